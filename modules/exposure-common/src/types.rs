use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// --- Scraped Content ---

/// One scraped post. Produced by the external scraper and never mutated here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Item {
    pub id: String,
    pub url: String,
    pub title: String,
    /// Best-effort publish date as scraped: RFC 3339, `YYYY-MM-DD` or `YYYY.MM.DD`.
    #[serde(default, alias = "publishedAt")]
    pub published_at: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub images: Vec<String>,
}

impl Item {
    /// Parsed publish instant. Date-only values are taken as midnight UTC.
    pub fn published_at_utc(&self) -> Option<DateTime<Utc>> {
        let raw = self.published_at.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        let date_part = raw.get(..10).unwrap_or(raw);
        ["%Y-%m-%d", "%Y.%m.%d"]
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(date_part, fmt).ok())
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|ndt| ndt.and_utc())
    }
}

// --- Enums ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    AddressHint,
    Schedule,
    Family,
    PhotoMetadata,
    Other,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::AddressHint => "address_hint",
            SignalType::Schedule => "schedule",
            SignalType::Family => "family",
            SignalType::PhotoMetadata => "photo_metadata",
            SignalType::Other => "other",
        }
    }

    /// Unknown labels collapse to `Other` rather than rejecting the signal.
    pub fn from_label(label: &str) -> Self {
        match label.trim() {
            "address_hint" => SignalType::AddressHint,
            "schedule" => SignalType::Schedule,
            "family" => SignalType::Family,
            "photo_metadata" => SignalType::PhotoMetadata,
            _ => SignalType::Other,
        }
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim() {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
        }
    }
}

// --- Signals ---

/// A privacy-risk clue the model pulled out of an item's text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TextSignal {
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    pub value: String,
    #[serde(default)]
    pub source_item_id: Option<String>,
    #[serde(default)]
    pub excerpt: Option<String>,
    #[serde(default)]
    pub rationale: Option<String>,
    /// 0.0–1.0
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// A privacy-risk clue the model found in one image of one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ImageSignal {
    pub source_item_id: String,
    pub item_url: String,
    pub item_title: String,
    pub image_url: String,
    /// 0-based position within the item's images.
    pub image_index: usize,
    pub label: String,
    pub severity: Severity,
    /// Masked description. Never the raw identifier.
    pub excerpt: String,
    pub rationale: String,
    /// 0.0–1.0
    #[serde(default)]
    pub confidence: Option<f64>,
}

// --- Scan Progress ---

/// Resumable scan position: the next image to look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
pub struct ScanCursor {
    pub item_index: usize,
    pub image_index: usize,
}

impl ScanCursor {
    pub const START: ScanCursor = ScanCursor {
        item_index: 0,
        image_index: 0,
    };

    pub fn new(item_index: usize, image_index: usize) -> Self {
        Self {
            item_index,
            image_index,
        }
    }
}

impl std::fmt::Display for ScanCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.item_index, self.image_index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    Partial,
    Complete,
}

/// Plain-data scan progress; safe to persist and restore across processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ScanState {
    pub status: ScanStatus,
    pub processed_count: usize,
    pub total_count: usize,
    /// `None` once the scan has walked past the last image.
    #[serde(default)]
    pub cursor: Option<ScanCursor>,
}

impl ScanState {
    pub fn pending(total_count: usize) -> Self {
        Self {
            status: ScanStatus::Pending,
            processed_count: 0,
            total_count,
            cursor: Some(ScanCursor::START),
        }
    }

    pub fn complete(total_count: usize) -> Self {
        Self {
            status: ScanStatus::Complete,
            processed_count: total_count,
            total_count,
            cursor: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == ScanStatus::Complete
    }
}

// --- Enrichment Nodes ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RiskNode {
    pub id: String,
    pub label: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Scenario {
    pub id: String,
    pub title: String,
    pub narrative: String,
}

// --- Evidence Graph ---

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EdgeSource {
    Piece { index: usize },
    Image { index: usize },
    Risk { risk_id: String },
}

impl EdgeSource {
    /// `kind:identifier`, the dedup form.
    pub fn key(&self) -> String {
        match self {
            EdgeSource::Piece { index } => format!("piece:{index}"),
            EdgeSource::Image { index } => format!("image:{index}"),
            EdgeSource::Risk { risk_id } => format!("risk:{risk_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EdgeTarget {
    Risk { risk_id: String },
    Scenario { scenario_id: String },
}

impl EdgeTarget {
    pub fn key(&self) -> String {
        match self {
            EdgeTarget::Risk { risk_id } => format!("risk:{risk_id}"),
            EdgeTarget::Scenario { scenario_id } => format!("scenario:{scenario_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GraphEdge {
    pub id: String,
    pub source: EdgeSource,
    pub target: EdgeTarget,
    /// 0.0–1.0
    pub strength: f64,
    pub reason: String,
}

impl GraphEdge {
    pub fn key(&self) -> String {
        format!("{}=>{}", self.source.key(), self.target.key())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceGraph {
    pub generated_at: DateTime<Utc>,
    pub model: String,
    pub edges: Vec<GraphEdge>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

// --- Scoring ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SeverityTotals {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ScoreBreakdown {
    pub by_signal_type: BTreeMap<SignalType, f64>,
    pub by_severity: SeverityTotals,
    pub recency_bonus: f64,
    pub total: f64,
}

/// One item's share of the risk, for the "riskiest posts" ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ItemScore {
    pub item_id: String,
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub published_at: Option<String>,
    pub score: f64,
    pub reasons: Vec<String>,
    pub text_signal_indexes: Vec<usize>,
    pub image_signal_indexes: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReportScoring {
    /// 0–100
    pub risk_score: u8,
    /// Sorted by score, highest first.
    pub item_scores: Vec<ItemScore>,
    pub breakdown: ScoreBreakdown,
}

// --- Per-item Insights ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Text,
    Image,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InsightEvidence {
    pub kind: EvidenceKind,
    pub excerpt: String,
    pub why: String,
    pub severity: Severity,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ItemInsight {
    pub item_id: String,
    pub summary: String,
    pub risk_signals: Vec<String>,
    pub evidence: Vec<InsightEvidence>,
    pub defensive_actions: Vec<String>,
}
