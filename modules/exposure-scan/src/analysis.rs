// Text-side model calls: signal extraction from item text, and per-item
// insight write-ups combining text and image evidence.

use std::sync::Arc;

use ai_client::{CompletionRequest, JsonCompletion};
use chrono::{DateTime, Utc};
use exposure_common::{ExposureError, ImageSignal, Item, ItemInsight, RiskNode, Scenario, TextSignal};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::decode::{decode_insights, decode_risk_nodes, decode_scenarios, decode_text_signals};
use crate::dedup::merge_signals;
use crate::model::{complete_and_parse, ModelReply};
use crate::prompt;

const INSIGHT_CHUNK: usize = 4;
const MAX_WARNINGS: usize = 10;

/// Signals, risks and scenarios read from item text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextAnalysis {
    pub text_signals: Vec<TextSignal>,
    pub risks: Vec<RiskNode>,
    pub scenarios: Vec<Scenario>,
    pub warnings: Vec<String>,
}

pub struct TextAnalyzer {
    model: Arc<dyn JsonCompletion>,
    max_tokens: u32,
}

impl TextAnalyzer {
    pub fn new(model: Arc<dyn JsonCompletion>) -> Self {
        Self {
            model,
            max_tokens: 2500,
        }
    }

    /// One call over all items. An unparseable reply yields an empty analysis
    /// with a warning; transport and rate-limit errors propagate.
    pub async fn analyze(&self, items: &[Item]) -> Result<TextAnalysis, ExposureError> {
        if items.iter().all(|it| it.text.trim().is_empty()) {
            return Ok(TextAnalysis::default());
        }

        let request = CompletionRequest::new(prompt::analysis_system(), prompt::analysis_user(items))
            .max_tokens(self.max_tokens);

        let parsed = match complete_and_parse(self.model.as_ref(), request, &["pieces"]).await? {
            ModelReply::Parsed(parsed) => parsed,
            ModelReply::Unparseable(e) => {
                return Ok(TextAnalysis {
                    warnings: vec![format!("text analysis unparseable: {e}")],
                    ..Default::default()
                });
            }
        };

        let pieces = decode_text_signals(&parsed.value, items);
        let risks = decode_risk_nodes(&parsed.value);
        let scenarios = decode_scenarios(&parsed.value);

        let decoded = pieces.records.len();
        let mut text_signals = Vec::with_capacity(decoded);
        let kept = merge_signals(&mut text_signals, pieces.records);

        let mut warnings = Vec::new();
        let dropped = pieces.dropped + risks.dropped + scenarios.dropped;
        if dropped > 0 {
            warnings.push(format!("dropped {dropped} malformed text analysis records"));
        }

        info!(
            strategy = %parsed.strategy,
            pieces = kept,
            duplicates = decoded - kept,
            risks = risks.records.len(),
            scenarios = scenarios.records.len(),
            dropped,
            "Text analysis complete"
        );

        Ok(TextAnalysis {
            text_signals,
            risks: risks.records,
            scenarios: scenarios.records,
            warnings,
        })
    }
}

/// Per-item briefings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightReport {
    pub generated_at: DateTime<Utc>,
    pub model: String,
    pub posts: Vec<ItemInsight>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

pub struct InsightWriter {
    model: Arc<dyn JsonCompletion>,
    max_tokens: u32,
}

impl InsightWriter {
    pub fn new(model: Arc<dyn JsonCompletion>) -> Self {
        Self {
            model,
            max_tokens: 1800,
        }
    }

    /// Write insights for every item that has evidence, a few items per call.
    ///
    /// A failing chunk becomes a warning; the other chunks still land.
    pub async fn write(
        &self,
        items: &[Item],
        text_signals: &[TextSignal],
        image_signals: &[ImageSignal],
    ) -> InsightReport {
        let with_evidence: Vec<&Item> = items
            .iter()
            .filter(|it| {
                text_signals
                    .iter()
                    .any(|s| s.source_item_id.as_deref() == Some(it.id.as_str()))
                    || image_signals.iter().any(|f| f.source_item_id == it.id)
            })
            .collect();

        let mut posts = Vec::new();
        let mut warnings = Vec::new();

        for chunk in with_evidence.chunks(INSIGHT_CHUNK) {
            let ids: Vec<&str> = chunk.iter().map(|it| it.id.as_str()).collect();
            let request = CompletionRequest::new(
                prompt::insights_system(),
                prompt::insights_user(chunk, text_signals, image_signals),
            )
            .max_tokens(self.max_tokens);

            match complete_and_parse(self.model.as_ref(), request, &["posts"]).await {
                Ok(ModelReply::Parsed(parsed)) => {
                    let decoded = decode_insights(&parsed.value, &ids);
                    if decoded.dropped > 0 {
                        warnings.push(format!("dropped {} malformed insights", decoded.dropped));
                    }
                    posts.extend(decoded.records);
                }
                Ok(ModelReply::Unparseable(e)) => {
                    warnings.push(format!("insights for {} unparseable: {e}", ids.join(",")));
                }
                Err(e) => {
                    warn!(items = ?ids, error = %e, "Insight chunk failed");
                    warnings.push(format!("insights for {} failed: {e}", ids.join(",")));
                }
            }
        }

        warnings.truncate(MAX_WARNINGS);
        InsightReport {
            generated_at: Utc::now(),
            model: self.model.model().to_string(),
            posts,
            warnings,
        }
    }
}
