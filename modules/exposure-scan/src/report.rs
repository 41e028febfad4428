use chrono::{DateTime, Utc};
use exposure_common::{
    EvidenceGraph, ImageSignal, Item, ReportScoring, RiskNode, ScanState, Scenario, TextSignal,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::analysis::{InsightReport, TextAnalysis};
use crate::graph::{retain_resolvable, GraphContext};
use crate::scan::ScanSnapshot;
use crate::scoring::score_report;

/// Everything one run produced, ready to write out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureReport {
    pub generated_at: DateTime<Utc>,
    pub scan_id: Uuid,
    pub state: ScanState,
    pub scoring: ReportScoring,
    pub image_signals: Vec<ImageSignal>,
    pub text_signals: Vec<TextSignal>,
    pub risks: Vec<RiskNode>,
    pub scenarios: Vec<Scenario>,
    #[serde(default)]
    pub graph: Option<EvidenceGraph>,
    #[serde(default)]
    pub insights: Option<InsightReport>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ExposureReport {
    /// Score the scan's findings together with the text analysis.
    ///
    /// A partial scan still reports everything merged so far.
    pub fn new(
        items: &[Item],
        snapshot: ScanSnapshot,
        analysis: TextAnalysis,
        now: DateTime<Utc>,
    ) -> Self {
        let scoring = score_report(items, &analysis.text_signals, &snapshot.findings, now);
        let mut warnings = snapshot.warnings;
        warnings.extend(analysis.warnings);

        info!(
            risk_score = scoring.risk_score,
            image_signals = snapshot.findings.len(),
            text_signals = analysis.text_signals.len(),
            complete = snapshot.state.is_complete(),
            "Report scored"
        );

        Self {
            generated_at: now,
            scan_id: snapshot.scan_id,
            state: snapshot.state,
            scoring,
            image_signals: snapshot.findings,
            text_signals: analysis.text_signals,
            risks: analysis.risks,
            scenarios: analysis.scenarios,
            graph: None,
            insights: None,
            warnings,
        }
    }

    /// Attach a graph, keeping only edges that still resolve against this
    /// report's collections.
    pub fn with_graph(mut self, mut graph: EvidenceGraph) -> Self {
        let ctx = GraphContext::new(
            &self.text_signals,
            &self.image_signals,
            &self.risks,
            &self.scenarios,
        );
        graph.edges = retain_resolvable(graph.edges, &ctx);
        self.graph = Some(graph);
        self
    }

    pub fn with_insights(mut self, insights: InsightReport) -> Self {
        self.insights = Some(insights);
        self
    }
}
