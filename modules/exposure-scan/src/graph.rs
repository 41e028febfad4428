// Evidence graph: validation of upstream-asserted edges, and the linker that
// asks the model for them.
//
// Edges are never trusted as stored references. Every edge is resolved
// against the collections handed to `validate_edges` at call time.

use std::sync::Arc;

use ai_client::{CompletionRequest, JsonCompletion};
use chrono::Utc;
use exposure_common::{
    EdgeSource, EdgeTarget, EvidenceGraph, ExposureError, GraphEdge, ImageSignal, RiskNode,
    Scenario, TextSignal,
};
use tracing::{info, warn};

use crate::decode::{decode_edges, WireEdge, WireEdgeRef};
use crate::dedup::{merge_edges, top_edges, MAX_EDGES};
use crate::model::{complete_and_parse, ModelReply};
use crate::prompt;
use crate::scoring::{image_signal_score, text_signal_score};

const DEFAULT_STRENGTH: f64 = 0.5;
const MAX_WARNINGS: usize = 10;

pub const MAX_LINK_PIECES: usize = 40;
pub const MAX_LINK_IMAGES: usize = 40;
pub const MAX_LINK_RISKS: usize = 20;
pub const MAX_LINK_SCENARIOS: usize = 12;

// =============================================================================
// Validation
// =============================================================================

/// The collections edges must resolve against.
#[derive(Debug, Clone, Copy)]
pub struct GraphContext<'a> {
    pub text_signal_count: usize,
    pub image_signal_count: usize,
    pub risks: &'a [RiskNode],
    pub scenarios: &'a [Scenario],
}

impl<'a> GraphContext<'a> {
    pub fn new(
        text_signals: &[TextSignal],
        image_signals: &[ImageSignal],
        risks: &'a [RiskNode],
        scenarios: &'a [Scenario],
    ) -> Self {
        Self {
            text_signal_count: text_signals.len(),
            image_signal_count: image_signals.len(),
            risks,
            scenarios,
        }
    }

    fn has_risk(&self, id: &str) -> bool {
        self.risks.iter().any(|r| r.id == id)
    }

    fn has_scenario(&self, id: &str) -> bool {
        self.scenarios.iter().any(|s| s.id == id)
    }

    pub fn resolves_source(&self, source: &EdgeSource) -> bool {
        match source {
            EdgeSource::Piece { index } => *index < self.text_signal_count,
            EdgeSource::Image { index } => *index < self.image_signal_count,
            EdgeSource::Risk { risk_id } => self.has_risk(risk_id),
        }
    }

    pub fn resolves_target(&self, target: &EdgeTarget) -> bool {
        match target {
            EdgeTarget::Risk { risk_id } => self.has_risk(risk_id),
            EdgeTarget::Scenario { scenario_id } => self.has_scenario(scenario_id),
        }
    }

    pub fn resolves(&self, edge: &GraphEdge) -> bool {
        self.resolves_source(&edge.source) && self.resolves_target(&edge.target)
    }
}

/// Translates indexes of a filtered signal subset back to the full collections.
///
/// `pieces[i]` is the full-collection index of the i-th text signal that was sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexRemap {
    pub pieces: Vec<usize>,
    pub images: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgeValidation {
    pub edges: Vec<GraphEdge>,
    pub dropped: usize,
}

fn source_ref(wire: &WireEdgeRef, remap: Option<&IndexRemap>) -> Option<EdgeSource> {
    match wire.kind.as_deref()?.trim() {
        "piece" => {
            let index = wire.index()?;
            let index = match remap {
                Some(r) => *r.pieces.get(index)?,
                None => index,
            };
            Some(EdgeSource::Piece { index })
        }
        "image" => {
            let index = wire.index()?;
            let index = match remap {
                Some(r) => *r.images.get(index)?,
                None => index,
            };
            Some(EdgeSource::Image { index })
        }
        "risk" => Some(EdgeSource::Risk {
            risk_id: wire.risk_id.clone()?,
        }),
        _ => None,
    }
}

fn target_ref(wire: &WireEdgeRef) -> Option<EdgeTarget> {
    match wire.kind.as_deref()?.trim() {
        "risk" => Some(EdgeTarget::Risk {
            risk_id: wire.risk_id.clone()?,
        }),
        "scenario" => Some(EdgeTarget::Scenario {
            scenario_id: wire.scenario_id.clone()?,
        }),
        _ => None,
    }
}

fn validate_one(
    position: usize,
    wire: WireEdge,
    ctx: &GraphContext<'_>,
    remap: Option<&IndexRemap>,
) -> Option<GraphEdge> {
    let reason = wire.reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty())?;
    let source = source_ref(wire.source.as_ref()?, remap).filter(|s| ctx.resolves_source(s))?;
    let target = target_ref(wire.target.as_ref()?).filter(|t| ctx.resolves_target(t))?;

    Some(GraphEdge {
        id: wire
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("e-{}", position + 1)),
        source,
        target,
        strength: wire.strength.unwrap_or(DEFAULT_STRENGTH).clamp(0.0, 1.0),
        reason,
    })
}

/// Reduce upstream edges to a bounded, resolvable, deduplicated set.
///
/// `candidates` carry their position in the upstream array (for generated
/// ids). With `remap`, piece/image indexes are translated before the bounds
/// check; an index without a mapping drops the edge.
pub fn validate_edges(
    candidates: Vec<(usize, WireEdge)>,
    ctx: &GraphContext<'_>,
    remap: Option<&IndexRemap>,
) -> EdgeValidation {
    let total = candidates.len();
    let valid: Vec<GraphEdge> = candidates
        .into_iter()
        .filter_map(|(position, wire)| validate_one(position, wire, ctx, remap))
        .collect();
    let dropped = total - valid.len();

    EdgeValidation {
        edges: top_edges(merge_edges(Vec::new(), valid), MAX_EDGES),
        dropped,
    }
}

/// Re-check already validated edges after the collections changed.
pub fn retain_resolvable(edges: Vec<GraphEdge>, ctx: &GraphContext<'_>) -> Vec<GraphEdge> {
    edges.into_iter().filter(|e| ctx.resolves(e)).collect()
}

// =============================================================================
// Linker
// =============================================================================

/// Indexes of the `cap` highest-scoring signals, in descending score order.
fn strongest<T>(signals: &[T], cap: usize, score: impl Fn(&T) -> f64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..signals.len()).collect();
    order.sort_by(|&a, &b| score(&signals[b]).total_cmp(&score(&signals[a])));
    order.truncate(cap);
    order
}

/// Asks the model how signals support risks and scenarios, then validates.
pub struct EdgeLinker {
    model: Arc<dyn JsonCompletion>,
    max_tokens: u32,
}

impl EdgeLinker {
    pub fn new(model: Arc<dyn JsonCompletion>) -> Self {
        Self {
            model,
            max_tokens: 1800,
        }
    }

    pub async fn link(
        &self,
        text_signals: &[TextSignal],
        image_signals: &[ImageSignal],
        risks: &[RiskNode],
        scenarios: &[Scenario],
    ) -> Result<EvidenceGraph, ExposureError> {
        let mut warnings = Vec::new();

        let remap = IndexRemap {
            pieces: strongest(text_signals, MAX_LINK_PIECES, text_signal_score),
            images: strongest(image_signals, MAX_LINK_IMAGES, image_signal_score),
        };
        let pieces: Vec<&TextSignal> = remap.pieces.iter().map(|&i| &text_signals[i]).collect();
        let images: Vec<&ImageSignal> = remap.images.iter().map(|&i| &image_signals[i]).collect();
        let risks_sent = &risks[..risks.len().min(MAX_LINK_RISKS)];
        let scenarios_sent = &scenarios[..scenarios.len().min(MAX_LINK_SCENARIOS)];

        if pieces.len() < text_signals.len() || images.len() < image_signals.len() {
            warnings.push(format!(
                "linked the strongest {} of {} text and {} of {} image signals",
                pieces.len(),
                text_signals.len(),
                images.len(),
                image_signals.len()
            ));
        }

        let request = CompletionRequest::new(
            prompt::graph_system(),
            prompt::graph_user(&pieces, &images, risks_sent, scenarios_sent),
        )
        .max_tokens(self.max_tokens);

        let edges = match complete_and_parse(self.model.as_ref(), request, &["edges"]).await? {
            ModelReply::Parsed(parsed) => {
                let decoded = decode_edges(&parsed.value);
                let ctx =
                    GraphContext::new(text_signals, image_signals, risks_sent, scenarios_sent);
                let validation = validate_edges(decoded.records, &ctx, Some(&remap));
                let dropped = decoded.dropped + validation.dropped;
                if dropped > 0 {
                    warnings.push(format!("dropped {dropped} unresolvable edges"));
                }
                info!(
                    strategy = %parsed.strategy,
                    kept = validation.edges.len(),
                    dropped,
                    "Evidence graph linked"
                );
                validation.edges
            }
            ModelReply::Unparseable(e) => {
                warn!(error = %e, "Evidence graph reply unparseable");
                warnings.push(format!("graph reply unparseable: {e}"));
                Vec::new()
            }
        };

        warnings.truncate(MAX_WARNINGS);
        Ok(EvidenceGraph {
            generated_at: Utc::now(),
            model: self.model.model().to_string(),
            edges,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exposure_common::{Severity, SignalType};
    use serde_json::json;

    fn risks() -> Vec<RiskNode> {
        vec![RiskNode {
            id: "r1".into(),
            label: "home location".into(),
            severity: Severity::High,
        }]
    }

    fn scenarios() -> Vec<Scenario> {
        vec![Scenario {
            id: "s1".into(),
            title: "doorstep".into(),
            narrative: "n".into(),
        }]
    }

    fn wire(value: serde_json::Value) -> Vec<(usize, WireEdge)> {
        decode_edges(&json!({ "edges": value })).records
    }

    fn ctx<'a>(pieces: usize, images: usize, r: &'a [RiskNode], s: &'a [Scenario]) -> GraphContext<'a> {
        GraphContext {
            text_signal_count: pieces,
            image_signal_count: images,
            risks: r,
            scenarios: s,
        }
    }

    #[test]
    fn duplicate_edges_keep_the_stronger() {
        let (r, s) = (risks(), scenarios());
        let out = validate_edges(
            wire(json!([
                { "source": { "kind": "piece", "index": 2 }, "target": { "kind": "risk", "riskId": "r1" }, "strength": 0.4, "reason": "a" },
                { "source": { "kind": "piece", "index": 2 }, "target": { "kind": "risk", "riskId": "r1" }, "strength": 0.9, "reason": "b" }
            ])),
            &ctx(3, 0, &r, &s),
            None,
        );
        assert_eq!(out.edges.len(), 1);
        assert_eq!(out.edges[0].strength, 0.9);
        assert_eq!(out.edges[0].reason, "b");
        assert_eq!(out.edges[0].id, "e-2");
    }

    #[test]
    fn unresolvable_endpoints_are_dropped() {
        let (r, s) = (risks(), scenarios());
        let out = validate_edges(
            wire(json!([
                { "source": { "kind": "piece", "index": 5 }, "target": { "kind": "risk", "riskId": "r1" }, "reason": "x" },
                { "source": { "kind": "image", "index": 0 }, "target": { "kind": "risk", "riskId": "r1" }, "reason": "x" },
                { "source": { "kind": "risk", "riskId": "r9" }, "target": { "kind": "scenario", "scenarioId": "s1" }, "reason": "x" },
                { "source": { "kind": "risk", "riskId": "r1" }, "target": { "kind": "scenario", "scenarioId": "s9" }, "reason": "x" },
                { "source": { "kind": "scenario", "scenarioId": "s1" }, "target": { "kind": "risk", "riskId": "r1" }, "reason": "x" },
                { "source": { "kind": "risk", "riskId": "r1" }, "target": { "kind": "scenario", "scenarioId": "s1" }, "reason": "kept" }
            ])),
            &ctx(5, 0, &r, &s),
            None,
        );
        assert_eq!(out.dropped, 5);
        assert_eq!(out.edges.len(), 1);
        assert_eq!(out.edges[0].reason, "kept");
    }

    #[test]
    fn reason_is_mandatory_strength_defaults_and_clamps() {
        let (r, s) = (risks(), scenarios());
        let out = validate_edges(
            wire(json!([
                { "id": "a", "source": { "kind": "piece", "index": 0 }, "target": { "kind": "risk", "riskId": "r1" }, "strength": 0.8 },
                { "id": "b", "source": { "kind": "piece", "index": 0 }, "target": { "kind": "scenario", "scenarioId": "s1" }, "reason": "  " },
                { "id": "c", "source": { "kind": "piece", "index": 1 }, "target": { "kind": "risk", "riskId": "r1" }, "reason": "why" },
                { "id": "d", "source": { "kind": "piece", "index": 2 }, "target": { "kind": "risk", "riskId": "r1" }, "strength": 3.0, "reason": "why" }
            ])),
            &ctx(3, 0, &r, &s),
            None,
        );
        assert_eq!(out.dropped, 2);
        let by_id = |id: &str| out.edges.iter().find(|e| e.id == id).unwrap().strength;
        assert_eq!(by_id("c"), DEFAULT_STRENGTH);
        assert_eq!(by_id("d"), 1.0);
    }

    #[test]
    fn remap_translates_and_drops_unmapped() {
        let (r, s) = (risks(), scenarios());
        let remap = IndexRemap {
            pieces: vec![7, 3],
            images: vec![],
        };
        let out = validate_edges(
            wire(json!([
                { "source": { "kind": "piece", "index": 1 }, "target": { "kind": "risk", "riskId": "r1" }, "reason": "x" },
                { "source": { "kind": "piece", "index": 2 }, "target": { "kind": "risk", "riskId": "r1" }, "reason": "x" },
                { "source": { "kind": "image", "index": 0 }, "target": { "kind": "risk", "riskId": "r1" }, "reason": "x" }
            ])),
            &ctx(8, 4, &r, &s),
            Some(&remap),
        );
        assert_eq!(out.edges.len(), 1);
        assert_eq!(out.edges[0].source, EdgeSource::Piece { index: 3 });
    }

    #[test]
    fn shrinking_collections_drop_stale_edges() {
        let (r, s) = (risks(), scenarios());
        let out = validate_edges(
            wire(json!([
                { "source": { "kind": "image", "index": 3 }, "target": { "kind": "risk", "riskId": "r1" }, "reason": "x" }
            ])),
            &ctx(0, 4, &r, &s),
            None,
        );
        assert_eq!(out.edges.len(), 1);

        let kept = retain_resolvable(out.edges.clone(), &ctx(0, 3, &r, &s));
        assert!(kept.is_empty());
        let kept = retain_resolvable(out.edges, &ctx(0, 4, &r, &[]));
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn volume_is_capped() {
        let r: Vec<RiskNode> = (0..300)
            .map(|i| RiskNode {
                id: format!("r{i}"),
                label: "l".into(),
                severity: Severity::Low,
            })
            .collect();
        let edges: Vec<serde_json::Value> = (0..300)
            .map(|i| json!({
                "source": { "kind": "piece", "index": 0 },
                "target": { "kind": "risk", "riskId": format!("r{i}") },
                "strength": (i as f64) / 300.0,
                "reason": "x"
            }))
            .collect();
        let out = validate_edges(wire(json!(edges)), &ctx(1, 0, &r, &[]), None);
        assert_eq!(out.edges.len(), MAX_EDGES);
        assert_eq!(
            out.edges[0].target,
            EdgeTarget::Risk {
                risk_id: "r299".into()
            }
        );
    }

    #[test]
    fn strongest_orders_by_score() {
        let pieces: Vec<TextSignal> = [SignalType::Other, SignalType::AddressHint, SignalType::Family]
            .into_iter()
            .map(|t| TextSignal {
                signal_type: t,
                value: t.to_string(),
                source_item_id: None,
                excerpt: None,
                rationale: None,
                confidence: None,
            })
            .collect();
        assert_eq!(strongest(&pieces, 2, text_signal_score), vec![1, 2]);
    }
}
