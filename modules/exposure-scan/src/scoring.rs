// Risk scoring.
//
// Recomputed from the full signal set on every call; nothing is patched
// incrementally. Each signal contributes `base × (0.55 + confidence × 0.9)`
// (confidence defaults to 0.6), image signals weighted by severity and text
// signals by type. The raw total saturates into 0–100 via
// `100 × (1 − e^(−total / 18))`.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use exposure_common::{
    ImageSignal, Item, ItemScore, ReportScoring, ScoreBreakdown, Severity, SeverityTotals,
    SignalType, TextSignal,
};

const DEFAULT_CONFIDENCE: f64 = 0.6;
const SATURATION: f64 = 18.0;

fn type_weight(signal_type: SignalType) -> f64 {
    match signal_type {
        SignalType::AddressHint => 7.0,
        SignalType::PhotoMetadata => 7.0,
        SignalType::Family => 5.0,
        SignalType::Schedule => 4.0,
        SignalType::Other => 2.0,
    }
}

fn severity_weight(severity: Severity) -> f64 {
    match severity {
        Severity::High => 10.0,
        Severity::Medium => 6.0,
        Severity::Low => 3.0,
    }
}

fn contribution(base: f64, confidence: Option<f64>) -> f64 {
    let conf = confidence
        .filter(|c| c.is_finite())
        .map(|c| c.clamp(0.0, 1.0))
        .unwrap_or(DEFAULT_CONFIDENCE);
    base * (0.55 + conf * 0.9)
}

pub fn text_signal_score(signal: &TextSignal) -> f64 {
    contribution(type_weight(signal.signal_type), signal.confidence)
}

pub fn image_signal_score(signal: &ImageSignal) -> f64 {
    contribution(severity_weight(signal.severity), signal.confidence)
}

/// Map a raw total onto 0–100.
pub fn saturate(total: f64) -> u8 {
    let score = (100.0 * (1.0 - (-total.max(0.0) / SATURATION).exp())).round();
    score.clamp(0.0, 100.0) as u8
}

fn round1(n: f64) -> f64 {
    (n * 10.0).round() / 10.0
}

/// Whole days between publish time and `now`. Future dates are negative.
fn days_ago(item: &Item, now: DateTime<Utc>) -> Option<i64> {
    let published = item.published_at_utc()?;
    Some((now - published).num_seconds().div_euclid(86_400))
}

fn recency_bonus(days: Option<i64>) -> f64 {
    match days {
        Some(d) if d <= 7 => 2.0,
        Some(d) if d <= 30 => 1.0,
        _ => 0.0,
    }
}

fn recency_multiplier(days: Option<i64>) -> f64 {
    match days {
        Some(d) if d <= 7 => 1.4,
        Some(d) if d <= 30 => 1.15,
        _ => 1.0,
    }
}

fn plural(n: usize, noun: &str) -> String {
    if n == 1 {
        format!("1 {noun}")
    } else {
        format!("{n} {noun}s")
    }
}

/// Score the accumulated signal set.
///
/// Signals are attributed to items by id; signals naming no known item still
/// count toward the total but not toward any item's ranking.
pub fn score_report(
    items: &[Item],
    text_signals: &[TextSignal],
    image_signals: &[ImageSignal],
    now: DateTime<Utc>,
) -> ReportScoring {
    let mut text_by_item: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, s) in text_signals.iter().enumerate() {
        if let Some(id) = s.source_item_id.as_deref() {
            text_by_item.entry(id).or_default().push(i);
        }
    }
    let mut images_by_item: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, s) in image_signals.iter().enumerate() {
        images_by_item
            .entry(s.source_item_id.as_str())
            .or_default()
            .push(i);
    }

    let mut by_signal_type: BTreeMap<SignalType, f64> = BTreeMap::new();
    for s in text_signals {
        *by_signal_type.entry(s.signal_type).or_default() += text_signal_score(s);
    }

    let mut by_severity = SeverityTotals::default();
    for s in image_signals {
        let score = image_signal_score(s);
        match s.severity {
            Severity::High => by_severity.high += score,
            Severity::Medium => by_severity.medium += score,
            Severity::Low => by_severity.low += score,
        }
    }

    let mut recency = 0.0;
    let mut item_scores = Vec::new();
    for item in items {
        let text_idx = text_by_item.get(item.id.as_str()).cloned().unwrap_or_default();
        let image_idx = images_by_item.get(item.id.as_str()).cloned().unwrap_or_default();
        if text_idx.is_empty() && image_idx.is_empty() {
            continue;
        }

        let days = days_ago(item, now);
        recency += recency_bonus(days);

        let raw: f64 = text_idx
            .iter()
            .map(|&i| text_signal_score(&text_signals[i]))
            .chain(image_idx.iter().map(|&i| image_signal_score(&image_signals[i])))
            .sum();

        let mut reasons = Vec::new();
        if !image_idx.is_empty() {
            reasons.push(plural(image_idx.len(), "image signal"));
        }
        if !text_idx.is_empty() {
            reasons.push(plural(text_idx.len(), "text signal"));
        }
        match days {
            Some(d) if d <= 7 => reasons.push("posted within 7 days".to_string()),
            Some(d) if d <= 30 => reasons.push("posted within 30 days".to_string()),
            _ => {}
        }

        item_scores.push(ItemScore {
            item_id: item.id.clone(),
            url: item.url.clone(),
            title: item.title.clone(),
            published_at: item.published_at.clone(),
            score: round1(raw * recency_multiplier(days)),
            reasons,
            text_signal_indexes: text_idx,
            image_signal_indexes: image_idx,
        });
    }
    item_scores.sort_by(|a, b| b.score.total_cmp(&a.score));

    let total = by_signal_type.values().sum::<f64>()
        + by_severity.low
        + by_severity.medium
        + by_severity.high
        + recency;

    ReportScoring {
        risk_score: saturate(total),
        item_scores,
        breakdown: ScoreBreakdown {
            by_signal_type: by_signal_type
                .into_iter()
                .map(|(k, v)| (k, round1(v)))
                .collect(),
            by_severity: SeverityTotals {
                low: round1(by_severity.low),
                medium: round1(by_severity.medium),
                high: round1(by_severity.high),
            },
            recency_bonus: round1(recency),
            total: round1(total),
        },
    }
}
