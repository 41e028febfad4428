use ai_client::truncate_chars;
use exposure_common::{ImageSignal, Item, RiskNode, Scenario, TextSignal};
use schemars::{schema_for, JsonSchema};
use serde_json::json;

use crate::decode::{AnalysisResponse, EdgesResponse, FindingsResponse, InsightsResponse};
use crate::scan::cursor::ImageRef;

const MAX_ITEM_TEXT_CHARS: usize = 6000;
const MAX_EVIDENCE_PER_ITEM: usize = 10;

const SAFETY_RULES: &str = "\
Rules:
- This is a defensive privacy review for the owner of the content.
- Never give operational instructions for stalking, intrusion, evasion or fraud.
- Never reproduce a full identifier. Mask long numbers (keep the first two and last two digits).
- Reply with a single JSON object and nothing else. No prose, no code fences.";

fn response_schema<T: JsonSchema>() -> String {
    serde_json::to_string(&schema_for!(T)).unwrap_or_default()
}

// =============================================================================
// Image scan
// =============================================================================

pub fn vision_system() -> String {
    format!(
        "You review photos from public blog posts for details that expose the author's \
         privacy: shipping labels, name tags, school or company logos, documents, \
         license plates, house numbers, screens, window views that reveal a location, \
         children's faces with identifying context.\n\n\
         Report only what is visible. One finding per distinct detail.\n\
         severity: high = directly identifies a person or location, medium = narrows it \
         down with other clues, low = weak hint.\n\
         confidence: 0..1.\n\n\
         {SAFETY_RULES}\n\n\
         Respond with JSON matching this schema:\n{}",
        response_schema::<FindingsResponse>()
    )
}

/// Describes the images in the order they are attached.
pub fn vision_user(items: &[Item], images: &[ImageRef]) -> String {
    let mut item_indexes: Vec<usize> = images.iter().map(|i| i.item_index).collect();
    item_indexes.dedup();

    let payload = json!({
        "items": item_indexes
            .iter()
            .filter_map(|&i| items.get(i))
            .map(|it| json!({
                "id": it.id,
                "title": it.title,
                "url": it.url,
                "publishedAt": it.published_at.clone().unwrap_or_default(),
            }))
            .collect::<Vec<_>>(),
        "images": images
            .iter()
            .enumerate()
            .filter_map(|(position, r)| items.get(r.item_index).map(|it| json!({
                "attachment": position + 1,
                "sourceItemId": it.id,
                "imageIndex": r.image_index,
            })))
            .collect::<Vec<_>>(),
    });

    format!(
        "The attached images are listed below in attachment order. Use each image's \
         sourceItemId and imageIndex in your findings.\n{payload}"
    )
}

// =============================================================================
// Text analysis
// =============================================================================

pub fn analysis_system() -> String {
    format!(
        "You review the text of public blog posts for privacy exposure.\n\
         pieces: individual clues. type is one of address_hint, schedule, family, \
         photo_metadata, other. excerpt is a 40-160 character quote from the post text; \
         sourceItemId is the id of the post it came from. confidence: 0..1.\n\
         risks: short labels for the exposures these clues add up to, with severity \
         low, medium or high.\n\
         scenarios: plausible misuse scenarios, told from a defender's point of view, \
         with a short title and a 2-4 sentence narrative.\n\n\
         {SAFETY_RULES}\n\n\
         Respond with JSON matching this schema:\n{}",
        response_schema::<AnalysisResponse>()
    )
}

pub fn analysis_user(items: &[Item]) -> String {
    let payload = json!({
        "posts": items
            .iter()
            .map(|it| json!({
                "id": it.id,
                "title": it.title,
                "url": it.url,
                "publishedAt": it.published_at.clone().unwrap_or_default(),
                "text": truncate_chars(&it.text, MAX_ITEM_TEXT_CHARS),
            }))
            .collect::<Vec<_>>(),
    });
    payload.to_string()
}

// =============================================================================
// Evidence graph
// =============================================================================

pub fn graph_system() -> String {
    format!(
        "You connect extracted privacy clues to the risks and scenarios they support.\n\
         An edge goes from a piece (by index), an image finding (by index) or a risk \
         (by riskId) to a risk (riskId) or a scenario (scenarioId). Only use indexes and \
         ids from the input. strength is 0..1. reason is one or two sentences explaining \
         the link; an edge without a reason is discarded.\n\n\
         {SAFETY_RULES}\n\n\
         Respond with JSON matching this schema:\n{}",
        response_schema::<EdgesResponse>()
    )
}

pub fn graph_user(
    pieces: &[&TextSignal],
    images: &[&ImageSignal],
    risks: &[RiskNode],
    scenarios: &[Scenario],
) -> String {
    let payload = json!({
        "pieces": pieces
            .iter()
            .enumerate()
            .map(|(index, p)| json!({
                "index": index,
                "type": p.signal_type,
                "value": p.value,
                "excerpt": p.excerpt.clone().unwrap_or_default(),
            }))
            .collect::<Vec<_>>(),
        "images": images
            .iter()
            .enumerate()
            .map(|(index, f)| json!({
                "index": index,
                "label": f.label,
                "severity": f.severity,
                "excerpt": f.excerpt,
            }))
            .collect::<Vec<_>>(),
        "risks": risks,
        "scenarios": scenarios,
    });
    payload.to_string()
}

// =============================================================================
// Per-item insights
// =============================================================================

pub fn insights_system() -> String {
    format!(
        "For each post, combine its text and image evidence into a short defensive \
         briefing.\n\
         summary: 3-5 sentences. riskSignals: 3-6 short labels. evidence: based only on \
         the given excerpts, keep masking intact. defensiveActions: 3-5 concrete steps \
         the author can take right away. Do not assert anything the evidence doesn't \
         support.\n\n\
         {SAFETY_RULES}\n\n\
         Respond with JSON matching this schema:\n{}",
        response_schema::<InsightsResponse>()
    )
}

pub fn insights_user(
    items: &[&Item],
    text_signals: &[TextSignal],
    image_signals: &[ImageSignal],
) -> String {
    let posts: Vec<_> = items
        .iter()
        .map(|it| {
            let text_evidence: Vec<_> = text_signals
                .iter()
                .filter(|s| s.source_item_id.as_deref() == Some(it.id.as_str()))
                .filter(|s| s.excerpt.is_some())
                .take(MAX_EVIDENCE_PER_ITEM)
                .map(|s| json!({
                    "type": s.signal_type,
                    "value": truncate_chars(&s.value, 140),
                    "excerpt": truncate_chars(s.excerpt.as_deref().unwrap_or_default(), 200),
                    "rationale": truncate_chars(s.rationale.as_deref().unwrap_or_default(), 220),
                    "confidence": s.confidence,
                }))
                .collect();
            let image_evidence: Vec<_> = image_signals
                .iter()
                .filter(|f| f.source_item_id == it.id)
                .take(MAX_EVIDENCE_PER_ITEM)
                .map(|f| json!({
                    "label": truncate_chars(&f.label, 100),
                    "severity": f.severity,
                    "excerpt": truncate_chars(&f.excerpt, 200),
                    "rationale": truncate_chars(&f.rationale, 220),
                    "confidence": f.confidence,
                }))
                .collect();
            json!({
                "itemId": it.id,
                "title": it.title,
                "url": it.url,
                "publishedAt": it.published_at.clone().unwrap_or_default(),
                "textEvidence": text_evidence,
                "imageEvidence": image_evidence,
            })
        })
        .collect();
    json!({ "posts": posts }).to_string()
}
