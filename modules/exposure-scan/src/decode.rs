// Record-level decoding of parsed model output.
//
// Every array element is decoded on its own into a wire shape; an element
// that fails to decode or breaks a rule is dropped and counted, the rest of
// the batch survives. Wire shapes are lenient about number/string mixups the
// models make (`"imageIndex": "2"`, `"confidence": "high"`), strict about
// required text.

use ai_client::truncate_chars;
use exposure_common::{
    mask_digits, EvidenceKind, ImageSignal, InsightEvidence, Item, ItemInsight, RiskNode,
    Scenario, Severity, SignalType, TextSignal,
};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

pub const MAX_SUMMARY_CHARS: usize = 900;
pub const MAX_RISK_SIGNALS: usize = 8;
pub const MAX_EVIDENCE: usize = 14;
pub const MAX_EVIDENCE_EXCERPT_CHARS: usize = 200;
pub const MAX_EVIDENCE_WHY_CHARS: usize = 160;
pub const MAX_DEFENSIVE_ACTIONS: usize = 8;

/// Records that survived decoding, plus how many were dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<T> {
    pub records: Vec<T>,
    pub dropped: usize,
}

impl<T> Default for Decoded<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            dropped: 0,
        }
    }
}

impl<T> Decoded<T> {
    fn keep(&mut self, record: Option<T>) {
        match record {
            Some(r) => self.records.push(r),
            None => self.dropped += 1,
        }
    }
}

/// Elements of the top-level array `key`; empty if absent or not an array.
pub fn elements<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn decode_each<W, T>(
    value: &Value,
    key: &str,
    mut convert: impl FnMut(usize, W) -> Option<T>,
) -> Decoded<T>
where
    W: for<'de> Deserialize<'de>,
{
    let mut out = Decoded::default();
    for (i, element) in elements(value, key).iter().enumerate() {
        let record = W::deserialize(element)
            .ok()
            .and_then(|wire| convert(i, wire));
        out.keep(record);
    }
    out
}

// --- Lenient field helpers ---

fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
    .filter(|f| f.is_finite()))
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }))
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn clamp_confidence(c: Option<f64>) -> Option<f64> {
    c.map(|c| c.clamp(0.0, 1.0))
}

fn index(n: Option<f64>) -> Option<usize> {
    n.filter(|n| *n >= 0.0).map(|n| n.floor() as usize)
}

// --- Image findings ---

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WireImageFinding {
    /// Id of the item the image belongs to.
    #[serde(default, deserialize_with = "lenient_string")]
    #[schemars(with = "Option<String>")]
    pub source_item_id: Option<String>,
    /// 0-based index of the image within its item.
    #[serde(default, deserialize_with = "lenient_number")]
    #[schemars(with = "Option<u32>")]
    pub image_index: Option<f64>,
    #[serde(default)]
    pub label: Option<String>,
    /// "low" | "medium" | "high"
    #[serde(default)]
    pub severity: Option<String>,
    /// Masked description. Never the full identifier.
    #[serde(default)]
    pub excerpt: Option<String>,
    #[serde(default)]
    pub rationale: Option<String>,
    /// 0..1
    #[serde(default, deserialize_with = "lenient_number")]
    #[schemars(with = "Option<f64>")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct FindingsResponse {
    pub findings: Vec<WireImageFinding>,
}

/// Decode `{"findings": [...]}` against the items that were in the batch.
///
/// A record must name one of `batch_items` by id; with a single-item batch the
/// id may be omitted. Excerpt and rationale have long digit runs masked.
pub fn decode_image_findings(value: &Value, batch_items: &[&Item]) -> Decoded<ImageSignal> {
    decode_each(value, "findings", |_, wire: WireImageFinding| {
        let item = match non_empty(wire.source_item_id) {
            Some(id) => batch_items.iter().find(|it| it.id == id)?,
            None if batch_items.len() == 1 => batch_items.first()?,
            None => return None,
        };

        let image_index = index(wire.image_index)?;
        let image_url = item.images.get(image_index)?;
        let label = non_empty(wire.label)?;
        let excerpt = non_empty(wire.excerpt)?;
        let rationale = non_empty(wire.rationale)?;
        let severity = wire
            .severity
            .as_deref()
            .and_then(Severity::from_label)
            .unwrap_or(Severity::Low);

        Some(ImageSignal {
            source_item_id: item.id.clone(),
            item_url: item.url.clone(),
            item_title: item.title.clone(),
            image_url: image_url.clone(),
            image_index,
            label,
            severity,
            excerpt: mask_digits(&excerpt),
            rationale: mask_digits(&rationale),
            confidence: clamp_confidence(wire.confidence),
        })
    })
}

// --- Text signals ---

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WireTextSignal {
    /// "address_hint" | "schedule" | "family" | "photo_metadata" | "other"
    #[serde(default, rename = "type")]
    pub signal_type: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    #[schemars(with = "Option<String>")]
    pub source_item_id: Option<String>,
    /// Short quote from the item text.
    #[serde(default)]
    pub excerpt: Option<String>,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    #[schemars(with = "Option<f64>")]
    pub confidence: Option<f64>,
}

/// Decode `{"pieces": [...]}`. A signal quoting an excerpt must point at a real item.
pub fn decode_text_signals(value: &Value, items: &[Item]) -> Decoded<TextSignal> {
    decode_each(value, "pieces", |_, wire: WireTextSignal| {
        let value = non_empty(wire.value)?;
        let excerpt = non_empty(wire.excerpt);
        let source_item_id =
            non_empty(wire.source_item_id).filter(|id| items.iter().any(|it| &it.id == id));
        if excerpt.is_some() && source_item_id.is_none() {
            return None;
        }

        Some(TextSignal {
            signal_type: wire
                .signal_type
                .as_deref()
                .map(SignalType::from_label)
                .unwrap_or(SignalType::Other),
            value,
            source_item_id,
            excerpt,
            rationale: non_empty(wire.rationale),
            confidence: clamp_confidence(wire.confidence),
        })
    })
}

// --- Risk nodes and scenarios ---

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct WireRiskNode {
    #[serde(default, deserialize_with = "lenient_string")]
    #[schemars(with = "Option<String>")]
    pub id: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
}

/// Decode `{"risks": [...]}`. Missing ids become `risk-<n>`, unknown severity `medium`.
pub fn decode_risk_nodes(value: &Value) -> Decoded<RiskNode> {
    decode_each(value, "risks", |i, wire: WireRiskNode| {
        Some(RiskNode {
            id: non_empty(wire.id).unwrap_or_else(|| format!("risk-{}", i + 1)),
            label: non_empty(wire.label)?,
            severity: wire
                .severity
                .as_deref()
                .and_then(Severity::from_label)
                .unwrap_or(Severity::Medium),
        })
    })
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct WireScenario {
    #[serde(default, deserialize_with = "lenient_string")]
    #[schemars(with = "Option<String>")]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub narrative: Option<String>,
}

/// Decode `{"scenarios": [...]}`. Missing ids become `scn-<n>`.
pub fn decode_scenarios(value: &Value) -> Decoded<Scenario> {
    decode_each(value, "scenarios", |i, wire: WireScenario| {
        Some(Scenario {
            id: non_empty(wire.id).unwrap_or_else(|| format!("scn-{}", i + 1)),
            title: non_empty(wire.title)?,
            narrative: non_empty(wire.narrative)?,
        })
    })
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AnalysisResponse {
    pub pieces: Vec<WireTextSignal>,
    pub risks: Vec<WireRiskNode>,
    pub scenarios: Vec<WireScenario>,
}

// --- Graph edges ---

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WireEdgeRef {
    /// "piece" | "image" | "risk" | "scenario"
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    #[schemars(with = "Option<u32>")]
    pub index: Option<f64>,
    #[serde(default, deserialize_with = "lenient_string")]
    #[schemars(with = "Option<String>")]
    pub risk_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    #[schemars(with = "Option<String>")]
    pub scenario_id: Option<String>,
}

impl WireEdgeRef {
    pub fn index(&self) -> Option<usize> {
        index(self.index)
    }
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct WireEdge {
    #[serde(default, deserialize_with = "lenient_string")]
    #[schemars(with = "Option<String>")]
    pub id: Option<String>,
    #[serde(default)]
    pub source: Option<WireEdgeRef>,
    #[serde(default)]
    pub target: Option<WireEdgeRef>,
    /// 0..1
    #[serde(default, deserialize_with = "lenient_number")]
    #[schemars(with = "Option<f64>")]
    pub strength: Option<f64>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct EdgesResponse {
    pub edges: Vec<WireEdge>,
}

/// Decode `{"edges": [...]}` into wire edges, keeping their upstream position.
/// Reference checks happen in [`crate::graph::validate_edges`].
pub fn decode_edges(value: &Value) -> Decoded<(usize, WireEdge)> {
    decode_each(value, "edges", |i, wire: WireEdge| Some((i, wire)))
}

// --- Per-item insights ---

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct WireInsightEvidence {
    /// "text" | "image"
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub excerpt: Option<String>,
    #[serde(default)]
    pub why: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    #[schemars(with = "Option<f64>")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WireInsight {
    #[serde(default, deserialize_with = "lenient_string")]
    #[schemars(with = "Option<String>")]
    pub item_id: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    #[schemars(with = "Vec<String>")]
    pub risk_signals: Vec<Value>,
    #[serde(default)]
    #[schemars(with = "Vec<WireInsightEvidence>")]
    pub evidence: Vec<Value>,
    #[serde(default)]
    #[schemars(with = "Vec<String>")]
    pub defensive_actions: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct InsightsResponse {
    pub posts: Vec<WireInsight>,
}

fn short_labels(values: Vec<Value>, cap: usize) -> Vec<String> {
    values
        .into_iter()
        .filter_map(|v| match v {
            Value::String(s) => non_empty(Some(s)),
            _ => None,
        })
        .take(cap)
        .collect()
}

fn decode_evidence(value: &Value) -> Option<InsightEvidence> {
    let wire = WireInsightEvidence::deserialize(value).ok()?;
    let excerpt = non_empty(wire.excerpt)?;
    let why = non_empty(wire.why)?;
    Some(InsightEvidence {
        kind: match wire.kind.as_deref() {
            Some("image") => EvidenceKind::Image,
            _ => EvidenceKind::Text,
        },
        excerpt: truncate_chars(&excerpt, MAX_EVIDENCE_EXCERPT_CHARS).to_string(),
        why: truncate_chars(&why, MAX_EVIDENCE_WHY_CHARS).to_string(),
        severity: wire
            .severity
            .as_deref()
            .and_then(Severity::from_label)
            .unwrap_or(Severity::Low),
        confidence: clamp_confidence(wire.confidence),
    })
}

/// Decode `{"posts": [...]}` for the items that were asked about.
pub fn decode_insights(value: &Value, requested_ids: &[&str]) -> Decoded<ItemInsight> {
    decode_each(value, "posts", |_, wire: WireInsight| {
        let item_id = non_empty(wire.item_id).filter(|id| requested_ids.contains(&id.as_str()))?;
        let summary = non_empty(wire.summary)?;

        Some(ItemInsight {
            item_id,
            summary: truncate_chars(&summary, MAX_SUMMARY_CHARS).to_string(),
            risk_signals: short_labels(wire.risk_signals, MAX_RISK_SIGNALS),
            evidence: wire
                .evidence
                .iter()
                .filter_map(decode_evidence)
                .take(MAX_EVIDENCE)
                .collect(),
            defensive_actions: short_labels(wire.defensive_actions, MAX_DEFENSIVE_ACTIONS),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(id: &str, images: usize) -> Item {
        Item {
            id: id.into(),
            url: format!("https://blog.example/{id}"),
            title: format!("post {id}"),
            published_at: None,
            text: String::new(),
            images: (0..images)
                .map(|i| format!("https://postfiles.pstatic.net/{id}/{i}.jpg"))
                .collect(),
        }
    }

    #[test]
    fn image_finding_single_item_batch_may_omit_id() {
        let a = item("a", 3);
        let value = json!({ "findings": [{
            "imageIndex": 2, "label": "parcel label", "severity": "high",
            "excerpt": "tracking 1234567890", "rationale": "shows address", "confidence": 1.4
        }]});
        let out = decode_image_findings(&value, &[&a]);
        assert_eq!(out.dropped, 0);
        let f = &out.records[0];
        assert_eq!(f.source_item_id, "a");
        assert_eq!(f.image_url, "https://postfiles.pstatic.net/a/2.jpg");
        assert_eq!(f.severity, Severity::High);
        assert_eq!(f.excerpt, "tracking 12***90");
        assert_eq!(f.confidence, Some(1.0));
    }

    #[test]
    fn image_finding_multi_item_batch_needs_known_id() {
        let a = item("a", 1);
        let b = item("b", 1);
        let value = json!({ "findings": [
            { "imageIndex": 0, "label": "l", "excerpt": "e", "rationale": "r" },
            { "sourceItemId": "zzz", "imageIndex": 0, "label": "l", "excerpt": "e", "rationale": "r" },
            { "sourceItemId": "b", "imageIndex": "0", "label": "l", "excerpt": "e", "rationale": "r", "severity": "extreme" }
        ]});
        let out = decode_image_findings(&value, &[&a, &b]);
        assert_eq!(out.dropped, 2);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].source_item_id, "b");
        assert_eq!(out.records[0].severity, Severity::Low);
    }

    #[test]
    fn image_finding_bad_records_are_dropped_alone() {
        let a = item("a", 2);
        let value = json!({ "findings": [
            { "imageIndex": -1, "label": "l", "excerpt": "e", "rationale": "r" },
            { "imageIndex": 2, "label": "l", "excerpt": "e", "rationale": "r" },
            { "imageIndex": 0, "label": "  ", "excerpt": "e", "rationale": "r" },
            { "imageIndex": 1, "label": "l", "excerpt": "e" },
            "not an object",
            { "imageIndex": 1, "label": "name tag", "excerpt": "e", "rationale": "r", "confidence": "sure" }
        ]});
        let out = decode_image_findings(&value, &[&a]);
        assert_eq!(out.dropped, 5);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].label, "name tag");
        assert_eq!(out.records[0].confidence, None);
    }

    #[test]
    fn missing_findings_key_decodes_to_nothing() {
        let a = item("a", 1);
        let out = decode_image_findings(&json!({ "result": [] }), &[&a]);
        assert!(out.records.is_empty());
        assert_eq!(out.dropped, 0);
    }

    #[test]
    fn text_signals_unknown_type_and_orphan_excerpt() {
        let items = vec![item("a", 0)];
        let value = json!({ "pieces": [
            { "type": "license_plate", "value": "12가 3456", "sourceItemId": "a", "excerpt": "my car" },
            { "type": "family", "value": "two kids", "sourceItemId": "nope", "excerpt": "kids" },
            { "type": "schedule", "value": "gym at 6am" },
            { "type": "family", "value": "" }
        ]});
        let out = decode_text_signals(&value, &items);
        assert_eq!(out.dropped, 2);
        assert_eq!(out.records[0].signal_type, SignalType::Other);
        assert_eq!(out.records[1].signal_type, SignalType::Schedule);
        assert_eq!(out.records[1].source_item_id, None);
    }

    #[test]
    fn risk_nodes_and_scenarios_fill_ids() {
        let value = json!({
            "risks": [
                { "label": "home location", "severity": "catastrophic" },
                { "id": "r2", "label": "" },
                { "id": "r3", "label": "routine", "severity": "high" }
            ],
            "scenarios": [
                { "title": "doorstep visit", "narrative": "..." },
                { "id": "s2", "title": "no story" }
            ]
        });
        let risks = decode_risk_nodes(&value);
        assert_eq!(risks.records[0].id, "risk-1");
        assert_eq!(risks.records[0].severity, Severity::Medium);
        assert_eq!(risks.records[1].id, "r3");
        assert_eq!(risks.dropped, 1);

        let scenarios = decode_scenarios(&value);
        assert_eq!(scenarios.records.len(), 1);
        assert_eq!(scenarios.records[0].id, "scn-1");
    }

    #[test]
    fn insights_are_bounded() {
        let long_summary = "s".repeat(1200);
        let evidence: Vec<Value> = (0..20)
            .map(|i| json!({ "kind": "image", "excerpt": "x".repeat(300), "why": format!("w{i}"), "severity": "high" }))
            .collect();
        let value = json!({ "posts": [
            {
                "itemId": "a",
                "summary": long_summary,
                "riskSignals": ["a", "b", "", 3, "c", "d", "e", "f", "g", "h", "i"],
                "evidence": evidence,
                "defensiveActions": ["hide address"]
            },
            { "itemId": "unknown", "summary": "x" },
            { "itemId": "a" }
        ]});
        let out = decode_insights(&value, &["a"]);
        assert_eq!(out.dropped, 2);
        let insight = &out.records[0];
        assert_eq!(insight.summary.chars().count(), MAX_SUMMARY_CHARS);
        assert_eq!(insight.risk_signals.len(), MAX_RISK_SIGNALS);
        assert_eq!(insight.risk_signals[2], "c");
        assert_eq!(insight.evidence.len(), MAX_EVIDENCE);
        assert_eq!(insight.evidence[0].excerpt.chars().count(), MAX_EVIDENCE_EXCERPT_CHARS);
        assert_eq!(insight.evidence[0].kind, EvidenceKind::Image);
    }
}
