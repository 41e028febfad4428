use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ai_client::{JsonCompletion, OpenAi};
use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use exposure_common::{Config, Item};
use exposure_scan::analysis::{InsightWriter, TextAnalyzer};
use exposure_scan::fetch::HttpImageFetcher;
use exposure_scan::graph::EdgeLinker;
use exposure_scan::report::ExposureReport;
use exposure_scan::scan::{ScanConfig, ScanCoordinator, ScanPhase};
use exposure_scan::store::JsonFileStore;

#[derive(Parser)]
#[command(name = "exposure-scan", about = "Privacy exposure scan over scraped posts")]
struct Cli {
    /// Scraped items as a JSON array
    #[arg(long)]
    items: PathBuf,

    /// Resumable scan snapshot; created if missing
    #[arg(long)]
    state: PathBuf,

    /// Where to write the JSON report
    #[arg(long, default_value = "report.json")]
    report: PathBuf,

    /// Skip the evidence graph and per-item insights
    #[arg(long)]
    skip_graph: bool,
}

fn model(config: &Config, name: &str, http: &reqwest::Client) -> Arc<dyn JsonCompletion> {
    let mut model = OpenAi::new(&config.openai_api_key, name).with_http_client(http.clone());
    if let Some(ref url) = config.openai_base_url {
        model = model.with_base_url(url);
    }
    Arc::new(model)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("exposure=info".parse()?))
        .init();

    let cli = Cli::parse();

    let config = Config::from_env()?;
    config.log_redacted();

    let raw = tokio::fs::read_to_string(&cli.items)
        .await
        .with_context(|| format!("Failed to read {}", cli.items.display()))?;
    let items: Vec<Item> = serde_json::from_str(&raw).context("Items file is not a JSON array of items")?;
    info!(items = items.len(), "Loaded items");

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(90))
        .build()?;
    let vision = model(&config, &config.vision_model, &http);
    let graph_model = model(&config, &config.graph_model, &http);

    let fetcher = Arc::new(HttpImageFetcher::new(
        reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()?,
        config.max_image_bytes,
        config.trusted_image_hosts.clone(),
    ));
    let store = Arc::new(JsonFileStore::new(&cli.state));

    let coordinator = Arc::new(
        ScanCoordinator::open(
            items.clone(),
            vision,
            fetcher,
            store,
            ScanConfig::from_config(&config),
        )
        .await?,
    );

    {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, pausing after the in-flight step");
                coordinator.pause();
            }
        });
    }

    let mut phase = coordinator.subscribe();
    let finished = tokio::select! {
        result = coordinator.run() => match result {
            Ok(state) => {
                info!(processed = state.processed_count, total = state.total_count, "Image scan finished");
                true
            }
            Err(e) => {
                warn!(error = %e, "Image scan stopped, progress saved");
                false
            }
        },
        _ = phase.wait_for(|p| *p == ScanPhase::Paused) => false,
    };

    let snapshot = coordinator.snapshot();
    let mut report = if finished {
        let analysis = TextAnalyzer::new(graph_model.clone())
            .analyze(&items)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Text analysis failed");
                exposure_scan::analysis::TextAnalysis {
                    warnings: vec![format!("text analysis failed: {e}")],
                    ..Default::default()
                }
            });
        ExposureReport::new(&items, snapshot, analysis, Utc::now())
    } else {
        ExposureReport::new(&items, snapshot, Default::default(), Utc::now())
    };

    if finished && !cli.skip_graph {
        match EdgeLinker::new(graph_model.clone())
            .link(&report.text_signals, &report.image_signals, &report.risks, &report.scenarios)
            .await
        {
            Ok(graph) => report = report.with_graph(graph),
            Err(e) => {
                warn!(error = %e, "Evidence graph failed");
                report.warnings.push(format!("evidence graph failed: {e}"));
            }
        }

        let insights = InsightWriter::new(graph_model)
            .write(&items, &report.text_signals, &report.image_signals)
            .await;
        report = report.with_insights(insights);
    }

    let json = serde_json::to_string_pretty(&report)?;
    tokio::fs::write(&cli.report, json)
        .await
        .with_context(|| format!("Failed to write {}", cli.report.display()))?;

    info!(
        report = %cli.report.display(),
        risk_score = report.scoring.risk_score,
        processed = report.state.processed_count,
        total = report.state.total_count,
        "Report written"
    );
    println!(
        "risk score {} ({} of {} images scanned) -> {}",
        report.scoring.risk_score,
        report.state.processed_count,
        report.state.total_count,
        cli.report.display()
    );

    Ok(())
}
