//! Router selection — end-to-end scenarios over seeded telemetry.
//!
//! Profiles seed telemetry with their nominal latency and full trust, so
//! each scenario states its backend table and asserts the selection.

use llm_substrate::routing::{
    BackendProfile, Capability, CapabilityTier, ModelRouter, RoutePriority, RouterConfig,
    StatsProjector, TaskKind,
};
use llm_substrate::telemetry::{TelemetryStore, DECISION_LOG_CAP};
use std::sync::Arc;

fn profile(
    name: &str,
    tier: CapabilityTier,
    cost: f64,
    nominal_ms: u64,
    structured: bool,
) -> BackendProfile {
    BackendProfile {
        name: name.into(),
        tier,
        cost_per_1k_tokens: cost,
        nominal_max_latency_ms: nominal_ms,
        supports_structured_output: structured,
        supports_streaming: true,
    }
}

fn router(profiles: Vec<BackendProfile>) -> ModelRouter {
    let telemetry = Arc::new(TelemetryStore::in_memory(&profiles));
    ModelRouter::new(profiles, telemetry, "default-model").unwrap()
}

// ── Scenario: cheapest backend wins classification under cost priority ──

#[test]
fn test_cost_priority_classification_selects_cheapest() {
    let router = router(vec![
        profile("m-basic", CapabilityTier::Basic, 0.01, 2000, true),
        profile("m-standard", CapabilityTier::Standard, 0.03, 1500, true),
    ]);

    let cfg = RouterConfig::for_task(TaskKind::Classification)
        .with_priority(RoutePriority::Cost);
    let selection = router.select(&cfg).unwrap();

    assert_eq!(selection.selected, "m-basic");
    // The runner-up is present with a strictly lower score
    let alt = &selection.alternatives[0];
    assert_eq!(alt.backend, "m-standard");
    assert!(selection.score > alt.score);
}

// ── Scenario: latency bound overrides tier preference ───────────────────

#[test]
fn test_latency_bound_excludes_slow_reasoning_model() {
    let router = router(vec![
        profile("m-reasoning", CapabilityTier::Reasoning, 0.05, 10_000, true),
        profile("m-standard", CapabilityTier::Standard, 0.02, 2_000, true),
    ]);

    let cfg = RouterConfig::for_task(TaskKind::Reasoning)
        .with_priority(RoutePriority::Quality)
        .with_max_latency_ms(5000);
    let selection = router.select(&cfg).unwrap();

    assert_eq!(
        selection.selected, "m-standard",
        "the in-bound standard model wins despite its lower tier"
    );
    let slow = selection
        .alternatives
        .iter()
        .find(|a| a.backend == "m-reasoning")
        .unwrap();
    assert!(selection.score > slow.score);
}

// ── Telemetry feedback loop ─────────────────────────────────────────────

#[test]
fn test_observed_failures_shift_future_selections() {
    let profiles = vec![
        profile("primary", CapabilityTier::Standard, 0.02, 1000, true),
        profile("backup", CapabilityTier::Standard, 0.02, 1000, true),
    ];
    let telemetry = Arc::new(TelemetryStore::in_memory(&profiles));
    let router = ModelRouter::new(profiles, telemetry.clone(), "d").unwrap();

    let cfg = RouterConfig::for_task(TaskKind::Chat).with_priority(RoutePriority::Quality);
    // Tied on everything; name tie-break picks "backup"
    assert_eq!(router.select(&cfg).unwrap().selected, "backup");

    // "backup" then fails most of its calls
    for i in 0..20 {
        telemetry.update("backup", 1000, i % 5 == 0);
        telemetry.update("primary", 1000, true);
    }
    assert_eq!(
        router.select(&cfg).unwrap().selected,
        "primary",
        "reliability penalty must redirect traffic"
    );
}

// ── Decision log behaviour ──────────────────────────────────────────────

#[test]
fn test_decision_log_bounded_and_projectable() {
    let profiles = vec![profile("only", CapabilityTier::Standard, 0.02, 1000, true)];
    let telemetry = Arc::new(TelemetryStore::in_memory(&profiles));
    let router = ModelRouter::new(profiles, telemetry.clone(), "d").unwrap();

    for _ in 0..(DECISION_LOG_CAP + 40) {
        router
            .select(&RouterConfig::for_task(TaskKind::Classification))
            .unwrap();
    }

    let snapshot = telemetry.snapshot();
    assert_eq!(snapshot.decisions.len(), DECISION_LOG_CAP);

    let report = StatsProjector::default().project(&snapshot);
    assert_eq!(report.summary.total_decisions, DECISION_LOG_CAP);
    assert_eq!(report.model_usage["only"], DECISION_LOG_CAP as u64);
    assert_eq!(report.timeline.len(), 10);
    assert_eq!(
        report.task_distribution["classification"],
        DECISION_LOG_CAP as u64
    );
}

// ── Capability gating across the whole table ────────────────────────────

#[test]
fn test_structured_output_requirement_never_picks_unsupporting_backend() {
    let router = router(vec![
        profile("schemaless-and-cheap", CapabilityTier::Advanced, 0.0001, 100, false),
        profile("compliant", CapabilityTier::Basic, 0.05, 4000, true),
    ]);

    let cfg = RouterConfig::for_task(TaskKind::Classification)
        .with_priority(RoutePriority::Speed)
        .require(Capability::StructuredOutput);

    for _ in 0..10 {
        assert_eq!(router.select(&cfg).unwrap().selected, "compliant");
    }
}
