//! End-to-end engine tests: full pipeline runs, policy gating, batch
//! isolation, and run control.

use mend_engine::engine::{
    EngineControl, EngineError, EngineRequest, EngineRuntimeState, EngineStatus,
    OrchestrationContext, control_engine, run_engine, run_engine_batch, run_engine_with_state,
};
use mend_engine::incident_graph::{
    CriticalityBand, DependencyEdge, GraphMeta, IncidentGraph, RecoveryNode,
};
use mend_engine::planner::PlannerConfig;
use mend_engine::policy::TenantProfile;
use mend_engine::readiness_signal::{ReadinessSignal, SignalSeverity};
use mend_engine::MILLION;

fn restore_graph() -> IncidentGraph {
    IncidentGraph {
        meta: GraphMeta {
            id: "incident-2291".to_string(),
            tenant_id: "acme".to_string(),
            name: "primary region restore".to_string(),
            owner_team: "sre".to_string(),
            window_start_minutes: 0,
            window_end_minutes: 240,
            ..GraphMeta::default()
        },
        nodes: vec![
            RecoveryNode::new("dns-failover", "dns failover", CriticalityBand::Critical),
            RecoveryNode::new("db-restore", "restore primary db", CriticalityBand::Critical),
            RecoveryNode::new("cache-warm", "warm caches", CriticalityBand::Medium),
            RecoveryNode::new("app-deploy", "redeploy app tier", CriticalityBand::High),
            RecoveryNode::new("smoke-test", "smoke tests", CriticalityBand::Low),
        ],
        edges: vec![
            DependencyEdge::new("dns-failover", "app-deploy"),
            DependencyEdge::new("db-restore", "app-deploy"),
            DependencyEdge::new("db-restore", "cache-warm"),
            DependencyEdge::new("app-deploy", "smoke-test"),
            DependencyEdge::new("cache-warm", "smoke-test"),
        ],
    }
}

fn request(request_id: &str) -> EngineRequest {
    EngineRequest {
        request_id: request_id.to_string(),
        context: OrchestrationContext {
            tenant_id: "acme".to_string(),
            requested_by: "oncall".to_string(),
            graph: restore_graph(),
            signals: vec![ReadinessSignal::new(
                "pager-118",
                "db-restore",
                SignalSeverity::Major,
                MILLION / 2,
            )],
            plan_overrides: None,
        },
    }
}

#[test]
fn full_pipeline_produces_consistent_response() {
    let response = run_engine(&request("run-1")).expect("run");
    assert!(response.accepted);
    assert_eq!(response.graph_id, "incident-2291");

    let plan = response.plan.as_ref().expect("plan");
    assert_eq!(plan.instructions.len(), 5);
    // Default profile allows 4 in parallel; the graph never fans wider.
    for wave in plan.waves().values() {
        assert!(wave.len() <= 4);
    }

    let simulation = response.simulation.as_ref().expect("simulation");
    assert_eq!(simulation.scenario_id, "run-1-optimized");

    let stages: Vec<&str> = response.traces.iter().map(|t| t.stage.as_str()).collect();
    for expected in [
        "normalize",
        "policy",
        "baseline-simulation",
        "plan",
        "throttle",
        "reorder",
        "optimized-simulation",
    ] {
        assert!(stages.contains(&expected), "missing stage trace {expected}");
    }
    for (i, event) in response.traces.iter().enumerate() {
        assert_eq!(event.sequence, i as u64);
        assert_eq!(event.correlation_id, "run-1");
    }
}

#[test]
fn response_is_reproducible_modulo_wall_clock() {
    let first = run_engine(&request("run-7")).expect("run");
    let second = run_engine(&request("run-7")).expect("run");
    assert_eq!(first.plan, second.plan);
    assert_eq!(first.simulation, second.simulation);
    assert_eq!(
        first.summary.readiness_improvement,
        second.summary.readiness_improvement
    );
}

#[test]
fn policy_block_surfaces_the_documented_error() {
    let mut req = request("run-9");
    let mut cfg = PlannerConfig::default_for_tenant("acme");
    cfg.profile = TenantProfile {
        max_parallelism: 1,
        allow_overrides: false,
        ..TenantProfile::default_for_tenant("acme")
    };
    req.context.plan_overrides = Some(cfg);
    // After guard serialization the widest layer still holds two nodes
    // (cache-warm and dns-failover), exceeding the serial-only profile.
    let err = run_engine(&req).expect_err("blocked");
    assert!(matches!(err, EngineError::PolicyBlocked { .. }));
    assert!(err.to_string().starts_with("execution blocked by policy checks"));
}

#[test]
fn policy_overrides_allow_wide_graphs_with_waiver_traces() {
    let mut req = request("run-10");
    let mut cfg = PlannerConfig::default_for_tenant("acme");
    cfg.profile = TenantProfile {
        max_parallelism: 1,
        allow_overrides: true,
        ..TenantProfile::default_for_tenant("acme")
    };
    req.context.plan_overrides = Some(cfg);
    let response = run_engine(&req).expect("run with overrides");
    assert!(response.accepted);
    assert!(response
        .traces
        .iter()
        .any(|t| t.message.contains("parallelism-waiver:")));
    // Throttling still enforces the serial limit on the plan itself.
    for wave in response.plan.expect("plan").waves().values() {
        assert_eq!(wave.len(), 1);
    }
}

#[test]
fn cycle_in_graph_aborts_the_run() {
    let mut req = request("run-11");
    req.context
        .graph
        .edges
        .push(DependencyEdge::new("smoke-test", "db-restore"));
    assert!(run_engine(&req).is_err());
}

#[test]
fn cancellation_is_honored_between_stages() {
    let req = request("run-12");
    let mut state = EngineRuntimeState::new("run-12");
    state = control_engine("run-12", &state, EngineControl::Resume).expect("resume");
    state = control_engine("run-12", &state, EngineControl::Cancel).expect("cancel");
    let err = run_engine_with_state(&req, &mut state).expect_err("cancelled run");
    assert!(matches!(err, EngineError::Cancelled { .. }));
    assert_eq!(state.status, EngineStatus::Cancelled);
}

#[test]
fn batch_responses_come_back_sorted_with_failures_isolated() {
    let mut blocked = request("batch-b");
    let mut cfg = PlannerConfig::default_for_tenant("acme");
    cfg.profile = TenantProfile {
        max_parallelism: 1,
        allow_overrides: false,
        ..TenantProfile::default_for_tenant("acme")
    };
    blocked.context.plan_overrides = Some(cfg);

    let responses = run_engine_batch(vec![request("batch-c"), blocked, request("batch-a")]);
    assert_eq!(responses.len(), 3);
    let ids: Vec<&str> = responses.iter().map(|r| r.request_id.as_str()).collect();
    assert_eq!(ids, vec!["batch-a", "batch-b", "batch-c"]);
    assert!(responses[0].accepted);
    assert!(!responses[1].accepted);
    assert!(responses[1].plan.is_none());
    assert!(responses[1].traces[0]
        .message
        .contains("execution blocked by policy checks"));
    assert!(responses[2].accepted);
}

#[test]
fn request_round_trips_through_json() {
    let req = request("run-serde");
    let raw = serde_json::to_string(&req).expect("serialize");
    let back: EngineRequest = serde_json::from_str(&raw).expect("deserialize");
    assert_eq!(req, back);
}
