//! Text analysis, evidence graph linking and per-item insights against MockModel.

use std::sync::Arc;

use chrono::Utc;
use exposure_common::{
    EdgeSource, EdgeTarget, EvidenceKind, ExposureError, RiskNode, Scenario, Severity, SignalType,
};
use exposure_scan::analysis::{InsightWriter, TextAnalyzer};
use exposure_scan::graph::EdgeLinker;
use exposure_scan::report::ExposureReport;
use exposure_scan::scan::ScanSnapshot;
use exposure_scan::testing::{image_signal, item, text_item, text_signal, MockModel};
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
        title: "Stalking".into(),
        narrative: "A stranger finds the house from the school and the street sign.".into(),
    }]
}

// --- Text analysis ---

#[tokio::test]
async fn analysis_decodes_signals_risks_and_scenarios() {
    let items = vec![text_item(
        "a",
        "We walk to Hanbit Elementary every morning at 8:10.",
    )];
    let reply = json!({
        "pieces": [
            {"type": "schedule", "value": "school run at 8:10", "sourceItemId": "a",
             "excerpt": "every morning at 8:10", "confidence": 0.8},
            {"type": "address_hint", "value": "near a school", "sourceItemId": "zzz",
             "excerpt": "Hanbit Elementary"},
            {"type": "mystery", "value": "a child", "confidence": "0.4"}
        ],
        "risks": [{"label": "home location", "severity": "high"}],
        "scenarios": [{"id": "s1", "title": "Stalking", "narrative": "Waits at the school gate."}]
    });
    let model = Arc::new(MockModel::new().reply(format!("```json\n{reply}\n```")));

    let analysis = TextAnalyzer::new(model.clone()).analyze(&items).await.unwrap();

    assert_eq!(analysis.text_signals.len(), 2);
    assert_eq!(analysis.text_signals[0].signal_type, SignalType::Schedule);
    assert_eq!(analysis.text_signals[1].signal_type, SignalType::Other);
    assert_eq!(analysis.risks[0].id, "risk-1");
    assert_eq!(analysis.scenarios.len(), 1);
    assert_eq!(analysis.warnings, vec!["dropped 1 malformed text analysis records"]);
    assert_eq!(model.call_count(), 1);
}

#[tokio::test]
async fn repeated_pieces_are_scored_once() {
    let items = vec![text_item("a", "Our new place is right by Hanbit Elementary.")];
    let piece = json!({"type": "address_hint", "value": "near Hanbit Elementary",
                       "sourceItemId": "a", "excerpt": "right by Hanbit Elementary",
                       "confidence": 0.8});
    let reply = json!({"pieces": [piece.clone(), piece], "risks": [], "scenarios": []});
    let model = Arc::new(MockModel::new().reply(reply.to_string()));

    let analysis = TextAnalyzer::new(model).analyze(&items).await.unwrap();
    assert_eq!(analysis.text_signals.len(), 1);
    assert!(analysis.warnings.is_empty());

    let report = ExposureReport::new(
        &items,
        ScanSnapshot::new(exposure_common::ScanState::complete(0)),
        analysis,
        Utc::now(),
    );
    assert_eq!(report.text_signals.len(), 1);
}

#[tokio::test]
async fn analysis_without_text_makes_no_call() {
    let model = Arc::new(MockModel::new());
    let analysis = TextAnalyzer::new(model.clone())
        .analyze(&[item("a", 3)])
        .await
        .unwrap();
    assert!(analysis.text_signals.is_empty());
    assert_eq!(model.call_count(), 0);
}

#[tokio::test]
async fn unreadable_analysis_is_a_warning() {
    let model = Arc::new(MockModel::new().reply("Sorry, I can't help with that."));
    let analysis = TextAnalyzer::new(model)
        .analyze(&[text_item("a", "some text")])
        .await
        .unwrap();
    assert!(analysis.text_signals.is_empty());
    assert_eq!(analysis.warnings.len(), 1);
}

#[tokio::test]
async fn analysis_rate_limit_propagates() {
    let model = Arc::new(MockModel::new().rate_limited(None));
    let err = TextAnalyzer::new(model)
        .analyze(&[text_item("a", "some text")])
        .await
        .unwrap_err();
    assert!(matches!(err, ExposureError::RateLimited { retry_after_ms: None }));
}

// --- Evidence graph ---

#[tokio::test]
async fn linker_remaps_dedups_and_drops_unresolvable() {
    let text = vec![text_signal("a", SignalType::AddressHint, "next to the school")];
    // Sent strongest first, so the model's image 0 is our image 1.
    let images = vec![
        image_signal("a", 0, "blurry plate", Severity::Low),
        image_signal("a", 1, "house number", Severity::High),
    ];
    let reply = json!({"edges": [
        {"source": {"kind": "piece", "index": 0}, "target": {"kind": "risk", "riskId": "r1"},
         "strength": 0.4, "reason": "names the school"},
        {"source": {"kind": "image", "index": 0}, "target": {"kind": "scenario", "scenarioId": "s1"},
         "strength": 0.8, "reason": "house number is readable"},
        {"source": {"kind": "piece", "index": 0}, "target": {"kind": "risk", "riskId": "r1"},
         "strength": 0.9, "reason": "school plus walking time"},
        {"source": {"kind": "piece", "index": 0}, "target": {"kind": "risk", "riskId": "r404"},
         "strength": 0.9, "reason": "unknown risk"},
        {"source": {"kind": "image", "index": 1}, "target": {"kind": "risk", "riskId": "r1"},
         "strength": 0.7}
    ]});
    let model = Arc::new(MockModel::new().reply(reply.to_string()));

    let graph = EdgeLinker::new(model.clone())
        .link(&text, &images, &risks(), &scenarios())
        .await
        .unwrap();

    assert_eq!(graph.model, "mock-model");
    assert_eq!(graph.edges.len(), 2);

    let piece = &graph.edges[0];
    assert_eq!(piece.source, EdgeSource::Piece { index: 0 });
    assert_eq!(piece.strength, 0.9);
    assert_eq!(piece.id, "e-3");

    let image = &graph.edges[1];
    assert_eq!(image.source, EdgeSource::Image { index: 1 });
    assert_eq!(
        image.target,
        EdgeTarget::Scenario {
            scenario_id: "s1".into()
        }
    );
    assert!(graph.warnings.iter().any(|w| w.contains("dropped 2")));
}

#[tokio::test]
async fn linker_only_accepts_targets_it_offered() {
    let risks: Vec<RiskNode> = (1..=25)
        .map(|n| RiskNode {
            id: format!("r{n}"),
            label: format!("risk {n}"),
            severity: Severity::Medium,
        })
        .collect();
    let text = vec![text_signal("a", SignalType::Schedule, "school run at 8:10")];
    let reply = json!({"edges": [
        {"source": {"kind": "piece", "index": 0}, "target": {"kind": "risk", "riskId": "r20"},
         "strength": 0.5, "reason": "offered"},
        {"source": {"kind": "piece", "index": 0}, "target": {"kind": "risk", "riskId": "r21"},
         "strength": 0.9, "reason": "never offered"}
    ]});
    let model = Arc::new(MockModel::new().reply(reply.to_string()));

    let graph = EdgeLinker::new(model)
        .link(&text, &[], &risks, &scenarios())
        .await
        .unwrap();

    assert_eq!(graph.edges.len(), 1);
    assert_eq!(
        graph.edges[0].target,
        EdgeTarget::Risk {
            risk_id: "r20".into()
        }
    );
    assert!(graph.warnings.iter().any(|w| w.contains("dropped 1")));
}

#[tokio::test]
async fn linker_survives_truncated_reply() {
    let truncated = r#"{"edges": [
        {"source": {"kind": "piece", "index": 0}, "target": {"kind": "risk", "riskId": "r1"},
         "strength": 0.6, "reason": "names the school"},
        {"source": {"kind": "piece", "index": 0}, "target": {"kind": "sce"#;
    let model = Arc::new(MockModel::new().reply(truncated));
    let text = vec![text_signal("a", SignalType::AddressHint, "next to the school")];

    let graph = EdgeLinker::new(model)
        .link(&text, &[], &risks(), &scenarios())
        .await
        .unwrap();

    assert_eq!(graph.edges.len(), 1);
    assert_eq!(graph.edges[0].strength, 0.6);
}

#[tokio::test]
async fn linker_unreadable_reply_is_an_empty_graph() {
    let model = Arc::new(MockModel::new().reply("no edges today"));
    let graph = EdgeLinker::new(model)
        .link(&[], &[], &risks(), &scenarios())
        .await
        .unwrap();
    assert!(graph.edges.is_empty());
    assert_eq!(graph.warnings.len(), 1);
}

// --- Insights ---

#[tokio::test]
async fn insights_cover_only_items_with_evidence() {
    let items = vec![item("a", 1), item("b", 1), item("c", 1)];
    let text = vec![text_signal("a", SignalType::Family, "two kids")];
    let images = vec![image_signal("b", 0, "apartment gate", Severity::Medium)];
    let reply = json!({"posts": [
        {"itemId": "a", "summary": "Mentions the children.", "riskSignals": ["family"],
         "evidence": [{"kind": "text", "excerpt": "two kids", "why": "household makeup",
                       "severity": "medium", "confidence": 0.7}],
         "defensiveActions": ["Remove names"]},
        {"itemId": "b", "summary": "Gate code visible.", "evidence": [
            {"kind": "image", "excerpt": "gate keypad", "why": "entry code", "severity": "high"},
            {"kind": "image", "why": "missing excerpt"}
        ]},
        {"itemId": "c", "summary": "Not asked about."}
    ]});
    let model = Arc::new(MockModel::new().reply(reply.to_string()));

    let report = InsightWriter::new(model.clone())
        .write(&items, &text, &images)
        .await;

    assert_eq!(model.call_count(), 1);
    assert_eq!(report.posts.len(), 2);
    assert_eq!(report.posts[0].defensive_actions, vec!["Remove names"]);
    assert_eq!(report.posts[1].evidence.len(), 1);
    assert_eq!(report.posts[1].evidence[0].kind, EvidenceKind::Image);
    assert_eq!(report.posts[1].evidence[0].severity, Severity::High);
    assert!(report.warnings.iter().any(|w| w.contains("dropped 1")));
}

#[tokio::test]
async fn failed_insight_chunk_does_not_sink_the_rest() {
    let items: Vec<_> = ["a", "b", "c", "d", "e"].iter().map(|id| item(id, 1)).collect();
    let images: Vec<_> = items
        .iter()
        .map(|it| image_signal(&it.id, 0, "street sign", Severity::Medium))
        .collect();
    let model = Arc::new(
        MockModel::new()
            .api_error(502, "bad gateway")
            .reply(json!({"posts": [{"itemId": "e", "summary": "Street sign readable."}]}).to_string()),
    );

    let report = InsightWriter::new(model.clone()).write(&items, &[], &images).await;

    assert_eq!(model.call_count(), 2);
    assert_eq!(report.posts.len(), 1);
    assert_eq!(report.posts[0].item_id, "e");
    assert_eq!(report.warnings.len(), 1);
}

// --- Report ---

#[tokio::test]
async fn report_combines_scan_analysis_and_graph() {
    let items = vec![text_item("a", "Our new place is right by Hanbit Elementary.")];
    let analysis_reply = json!({
        "pieces": [{"type": "address_hint", "value": "near Hanbit Elementary",
                    "sourceItemId": "a", "excerpt": "right by Hanbit Elementary",
                    "confidence": 0.8}],
        "risks": [{"id": "r1", "label": "home location", "severity": "high"}],
        "scenarios": []
    });
    let edges_reply = json!({"edges": [
        {"source": {"kind": "piece", "index": 0}, "target": {"kind": "risk", "riskId": "r1"},
         "strength": 0.85, "reason": "school narrows the neighbourhood"}
    ]});
    let model = Arc::new(
        MockModel::new()
            .reply(analysis_reply.to_string())
            .reply(edges_reply.to_string()),
    );

    let analysis = TextAnalyzer::new(model.clone()).analyze(&items).await.unwrap();
    let snapshot = ScanSnapshot::new(exposure_common::ScanState::complete(0));
    let report = ExposureReport::new(&items, snapshot, analysis, Utc::now());
    let graph = EdgeLinker::new(model.clone())
        .link(&report.text_signals, &report.image_signals, &report.risks, &report.scenarios)
        .await
        .unwrap();
    let report = report.with_graph(graph);

    assert!(report.state.is_complete());
    assert!(report.scoring.risk_score > 0);
    assert_eq!(report.scoring.item_scores.len(), 1);
    assert_eq!(report.graph.as_ref().unwrap().edges.len(), 1);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["graph"]["edges"][0]["source"]["kind"], "piece");
}
