//! Engine orchestration: the full recovery pipeline plus run control.
//!
//! [`run_engine`] drives one request end to end:
//!
//! 1. **Normalize** the incident graph
//! 2. **Policy gate** via [`evaluate_policies`] (fatal when blocked)
//! 3. **Baseline simulation** seeded `{request_id}-baseline`
//! 4. **Plan** via [`create_plan`]
//! 5. **Throttle** via [`enforce_max_parallelism`]
//! 6. **Reorder** via [`mutate_ordering`]
//! 7. **Optimized simulation** seeded `{request_id}-optimized`
//! 8. **Validate** graph (fatal) and instructions (advisory trace)
//! 9. **Assemble** the response with the readiness-improvement delta
//!
//! Each stage appends a structured [`TraceEvent`] and emits a `tracing`
//! debug event. Run control is a plain state machine over
//! [`EngineRuntimeState`]; cancellation is cooperative and honored between
//! pipeline stages only — an in-flight simulation call is never
//! interrupted.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::incident_graph::{IncidentGraph, normalize, validate_graph};
use crate::planner::{
    PlannerConfig, PlannerError, RecoveryPlan, create_plan, enforce_max_parallelism,
    mutate_ordering, validate_instructions,
};
use crate::policy::evaluate_policies;
use crate::readiness_signal::ReadinessSignal;
use crate::simulator::{SimulationResult, simulate_with_seed};

/// Floor for the per-request tick budget.
const MIN_TICK_BUDGET: u64 = 32;

// ---------------------------------------------------------------------------
// EngineStatus / EngineControl — run-control state machine
// ---------------------------------------------------------------------------

/// Status of one engine run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Cancelled,
    Failed,
}

impl EngineStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control action applied to a runtime state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineControl {
    Resume,
    Pause,
    Cancel,
    ForceComplete,
}

impl EngineControl {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Resume => "resume",
            Self::Pause => "pause",
            Self::Cancel => "cancel",
            Self::ForceComplete => "force-complete",
        }
    }
}

impl fmt::Display for EngineControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request runtime state. Created at request start, discarded after the
/// response is returned; never shared across requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineRuntimeState {
    pub request_id: String,
    pub started_at: String,
    pub status: EngineStatus,
    pub last_event_at: String,
    pub processed_nodes: usize,
}

impl EngineRuntimeState {
    pub fn new(request_id: impl Into<String>) -> Self {
        let now = now_rfc3339();
        Self {
            request_id: request_id.into(),
            started_at: now.clone(),
            status: EngineStatus::Idle,
            last_event_at: now,
            processed_nodes: 0,
        }
    }
}

/// Applies a control action to a runtime state, returning the new state.
///
/// Legal transitions: idle→running (resume), running→paused (pause),
/// paused→running (resume), running→cancelled (cancel), and any state →
/// idle (force-complete, terminal success marking). Anything else is an
/// [`EngineError::InvalidControl`].
pub fn control_engine(
    request_id: &str,
    state: &EngineRuntimeState,
    control: EngineControl,
) -> Result<EngineRuntimeState, EngineError> {
    if state.request_id != request_id {
        return Err(EngineError::RequestIdMismatch {
            expected: state.request_id.clone(),
            actual: request_id.to_string(),
        });
    }
    let next_status = match (state.status, control) {
        (_, EngineControl::ForceComplete) => EngineStatus::Idle,
        (EngineStatus::Idle, EngineControl::Resume) => EngineStatus::Running,
        (EngineStatus::Paused, EngineControl::Resume) => EngineStatus::Running,
        (EngineStatus::Running, EngineControl::Pause) => EngineStatus::Paused,
        (EngineStatus::Running, EngineControl::Cancel) => EngineStatus::Cancelled,
        (from, control) => return Err(EngineError::InvalidControl { from, control }),
    };
    let mut next = state.clone();
    next.status = next_status;
    next.last_event_at = now_rfc3339();
    Ok(next)
}

// ---------------------------------------------------------------------------
// TraceEvent — structured diagnostics carried on the response
// ---------------------------------------------------------------------------

/// One ordered diagnostic event from the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub sequence: u64,
    pub recorded_at: String,
    /// Correlates the event with its request.
    pub correlation_id: String,
    pub stage: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Request / response envelopes
// ---------------------------------------------------------------------------

/// Caller-supplied context for one orchestration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationContext {
    pub tenant_id: String,
    pub requested_by: String,
    pub graph: IncidentGraph,
    #[serde(default)]
    pub signals: Vec<ReadinessSignal>,
    /// Optional planner configuration; tenant defaults apply when absent.
    #[serde(default)]
    pub plan_overrides: Option<PlannerConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineRequest {
    pub request_id: String,
    pub context: OrchestrationContext,
}

/// Wall-clock bracket and readiness delta for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RunSummary {
    pub started_at: String,
    pub completed_at: String,
    /// Completed-node delta: optimized minus baseline.
    pub readiness_improvement: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineResponse {
    pub request_id: String,
    pub graph_id: String,
    pub accepted: bool,
    pub plan: Option<RecoveryPlan>,
    pub simulation: Option<SimulationResult>,
    pub traces: Vec<TraceEvent>,
    pub summary: RunSummary,
}

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Fatal pipeline errors. Advisory findings never surface here; they become
/// trace events instead.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum EngineError {
    #[error("execution blocked by policy checks: {}", reasons.join("; "))]
    PolicyBlocked { reasons: Vec<String> },
    #[error("planned graph failed validation: {}", reasons.join("; "))]
    GraphValidationFailed { reasons: Vec<String> },
    #[error("request '{request_id}' is missing a tenant id")]
    MissingTenantId { request_id: String },
    #[error("request is missing a request id")]
    MissingRequestId,
    #[error("run '{request_id}' was cancelled before completion")]
    Cancelled { request_id: String },
    #[error("control '{control}' is not valid from state '{from}'")]
    InvalidControl {
        from: EngineStatus,
        control: EngineControl,
    },
    #[error("control addressed request '{actual}' but state belongs to '{expected}'")]
    RequestIdMismatch { expected: String, actual: String },
    #[error(transparent)]
    Planner(#[from] PlannerError),
}

// ---------------------------------------------------------------------------
// run_engine
// ---------------------------------------------------------------------------

/// Runs the full pipeline for one request with a fresh runtime state.
pub fn run_engine(request: &EngineRequest) -> Result<EngineResponse, EngineError> {
    let mut state = EngineRuntimeState::new(request.request_id.clone());
    run_engine_with_state(request, &mut state)
}

/// Runs the pipeline against a caller-owned runtime state. Cancellation is
/// checked between stages: flipping the state to cancelled (via
/// [`control_engine`]) stops the run at the next stage boundary, but never
/// interrupts an in-flight simulation call.
pub fn run_engine_with_state(
    request: &EngineRequest,
    state: &mut EngineRuntimeState,
) -> Result<EngineResponse, EngineError> {
    let started_at = now_rfc3339();
    if request.request_id.is_empty() {
        return Err(EngineError::MissingRequestId);
    }
    let context = &request.context;
    if context.tenant_id.is_empty() {
        state.status = EngineStatus::Failed;
        return Err(EngineError::MissingTenantId {
            request_id: request.request_id.clone(),
        });
    }

    let mut traces: Vec<TraceEvent> = Vec::new();
    let trace = |traces: &mut Vec<TraceEvent>, stage: &str, message: String| {
        debug!(request_id = %request.request_id, stage, %message, "engine stage");
        traces.push(TraceEvent {
            sequence: traces.len() as u64,
            recorded_at: now_rfc3339(),
            correlation_id: request.request_id.clone(),
            stage: stage.to_string(),
            message,
        });
    };

    if state.status == EngineStatus::Idle {
        *state = control_engine(&request.request_id, state, EngineControl::Resume)?;
    }
    let config = context
        .plan_overrides
        .clone()
        .unwrap_or_else(|| PlannerConfig::default_for_tenant(context.tenant_id.clone()));

    checkpoint(state, &request.request_id)?;
    let normalized = normalize(&context.graph);
    trace(
        &mut traces,
        "normalize",
        format!(
            "normalized graph '{}': {} nodes, {} edges",
            normalized.meta().id,
            normalized.meta().snapshot.node_count,
            normalized.meta().snapshot.edge_count
        ),
    );

    checkpoint(state, &request.request_id)?;
    let decision = evaluate_policies(&normalized, &config.profile);
    if !decision.allow_execution {
        state.status = EngineStatus::Failed;
        return Err(EngineError::PolicyBlocked {
            reasons: decision.reasons,
        });
    }
    for waiver in &decision.overrides {
        trace(&mut traces, "policy", format!("override applied: {waiver}"));
    }
    trace(&mut traces, "policy", "execution admitted".to_string());

    let max_ticks = (normalized.nodes().len() as u64 * 2).max(MIN_TICK_BUDGET);

    checkpoint(state, &request.request_id)?;
    let baseline = simulate_with_seed(
        &normalized,
        &context.signals,
        max_ticks,
        &format!("{}-baseline", request.request_id),
    );
    trace(
        &mut traces,
        "baseline-simulation",
        format!(
            "baseline completed {} of {} nodes",
            baseline.summary.completed_node_count,
            normalized.nodes().len()
        ),
    );

    checkpoint(state, &request.request_id)?;
    let plan = create_plan(&normalized, &config)?;
    trace(
        &mut traces,
        "plan",
        format!("plan '{}' with {} waves", plan.id, plan.wave_count()),
    );

    checkpoint(state, &request.request_id)?;
    let throttled = enforce_max_parallelism(&plan, &config);
    trace(
        &mut traces,
        "throttle",
        format!(
            "max parallelism {} packed {} waves",
            config.profile.max_parallelism,
            throttled.wave_count()
        ),
    );

    checkpoint(state, &request.request_id)?;
    let reordered = mutate_ordering(&throttled, config.preferred_ordering);
    trace(
        &mut traces,
        "reorder",
        format!("intra-wave ordering '{}'", config.preferred_ordering),
    );

    checkpoint(state, &request.request_id)?;
    let optimized = simulate_with_seed(
        &normalized,
        &context.signals,
        max_ticks,
        &format!("{}-optimized", request.request_id),
    );
    state.processed_nodes = optimized.summary.completed_node_count
        + optimized.summary.failed_node_count
        + optimized.summary.warning_node_count;
    trace(
        &mut traces,
        "optimized-simulation",
        format!(
            "optimized completed {} of {} nodes",
            optimized.summary.completed_node_count,
            normalized.nodes().len()
        ),
    );

    checkpoint(state, &request.request_id)?;
    let graph_validation = validate_graph(normalized.graph());
    if !graph_validation.valid {
        state.status = EngineStatus::Failed;
        return Err(EngineError::GraphValidationFailed {
            reasons: graph_validation.reasons,
        });
    }
    let instruction_validation = validate_instructions(&reordered, &normalized);
    if !instruction_validation.valid {
        trace(
            &mut traces,
            "instruction-validation-warning",
            instruction_validation.reasons.join("; "),
        );
    }

    let readiness_improvement = optimized.summary.completed_node_count as i64
        - baseline.summary.completed_node_count as i64;
    *state = control_engine(&request.request_id, state, EngineControl::ForceComplete)?;

    Ok(EngineResponse {
        request_id: request.request_id.clone(),
        graph_id: normalized.meta().id.clone(),
        accepted: true,
        plan: Some(reordered),
        simulation: Some(optimized),
        traces,
        summary: RunSummary {
            started_at,
            completed_at: now_rfc3339(),
            readiness_improvement,
        },
    })
}

/// Stage-boundary cancellation check.
fn checkpoint(state: &EngineRuntimeState, request_id: &str) -> Result<(), EngineError> {
    if state.status == EngineStatus::Cancelled {
        return Err(EngineError::Cancelled {
            request_id: request_id.to_string(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// run_engine_batch
// ---------------------------------------------------------------------------

/// Processes a batch of requests sequentially, sorted by request id, each
/// with its own isolated runtime state. A fatally-failing request is
/// reported as a rejected response rather than aborting the batch.
pub fn run_engine_batch(mut requests: Vec<EngineRequest>) -> Vec<EngineResponse> {
    requests.sort_by(|a, b| a.request_id.cmp(&b.request_id));
    requests
        .iter()
        .map(|request| match run_engine(request) {
            Ok(response) => response,
            Err(error) => rejected_response(request, &error),
        })
        .collect()
}

fn rejected_response(request: &EngineRequest, error: &EngineError) -> EngineResponse {
    let now = now_rfc3339();
    EngineResponse {
        request_id: request.request_id.clone(),
        graph_id: request.context.graph.meta.id.clone(),
        accepted: false,
        plan: None,
        simulation: None,
        traces: vec![TraceEvent {
            sequence: 0,
            recorded_at: now.clone(),
            correlation_id: request.request_id.clone(),
            stage: "rejected".to_string(),
            message: error.to_string(),
        }],
        summary: RunSummary {
            started_at: now.clone(),
            completed_at: now,
            readiness_improvement: 0,
        },
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident_graph::{CriticalityBand, DependencyEdge, GraphMeta, RecoveryNode};
    use crate::policy::TenantProfile;

    fn request(request_id: &str) -> EngineRequest {
        EngineRequest {
            request_id: request_id.to_string(),
            context: OrchestrationContext {
                tenant_id: "tenant-1".to_string(),
                requested_by: "oncall".to_string(),
                graph: IncidentGraph {
                    meta: GraphMeta {
                        id: "g-1".to_string(),
                        tenant_id: "tenant-1".to_string(),
                        name: "restore".to_string(),
                        owner_team: "sre".to_string(),
                        ..GraphMeta::default()
                    },
                    nodes: vec![
                        RecoveryNode::new("a", "a", CriticalityBand::Low),
                        RecoveryNode::new("b", "b", CriticalityBand::Medium),
                        RecoveryNode::new("c", "c", CriticalityBand::High),
                        RecoveryNode::new("d", "d", CriticalityBand::Low),
                    ],
                    edges: vec![
                        DependencyEdge::new("a", "b"),
                        DependencyEdge::new("a", "c"),
                        DependencyEdge::new("b", "d"),
                        DependencyEdge::new("c", "d"),
                    ],
                },
                signals: Vec::new(),
                plan_overrides: None,
            },
        }
    }

    #[test]
    fn control_transitions_follow_the_state_machine() {
        let idle = EngineRuntimeState::new("req-1");
        let running = control_engine("req-1", &idle, EngineControl::Resume).expect("resume");
        assert_eq!(running.status, EngineStatus::Running);
        let paused = control_engine("req-1", &running, EngineControl::Pause).expect("pause");
        assert_eq!(paused.status, EngineStatus::Paused);
        let resumed = control_engine("req-1", &paused, EngineControl::Resume).expect("resume");
        assert_eq!(resumed.status, EngineStatus::Running);
        let cancelled = control_engine("req-1", &resumed, EngineControl::Cancel).expect("cancel");
        assert_eq!(cancelled.status, EngineStatus::Cancelled);
        let done = control_engine("req-1", &cancelled, EngineControl::ForceComplete)
            .expect("force-complete");
        assert_eq!(done.status, EngineStatus::Idle);
    }

    #[test]
    fn invalid_control_is_rejected() {
        let idle = EngineRuntimeState::new("req-1");
        let err = control_engine("req-1", &idle, EngineControl::Pause).expect_err("pause from idle");
        assert!(matches!(
            err,
            EngineError::InvalidControl {
                from: EngineStatus::Idle,
                control: EngineControl::Pause
            }
        ));
        let err = control_engine("other", &idle, EngineControl::Resume).expect_err("wrong id");
        assert!(matches!(err, EngineError::RequestIdMismatch { .. }));
    }

    #[test]
    fn run_engine_happy_path_produces_plan_and_delta() {
        let response = run_engine(&request("req-1")).expect("run");
        assert!(response.accepted);
        assert_eq!(response.graph_id, "g-1");
        let plan = response.plan.expect("plan");
        assert_eq!(plan.instructions.len(), 4);
        let simulation = response.simulation.expect("simulation");
        assert_eq!(simulation.scenario_id, "req-1-optimized");
        assert!(!response.traces.is_empty());
        assert!(response.traces.iter().all(|t| t.correlation_id == "req-1"));
        // Delta is consistent with what a caller would recompute.
        let baseline = crate::simulator::simulate_with_seed(
            &normalize(&request("req-1").context.graph),
            &[],
            32,
            "req-1-baseline",
        );
        assert_eq!(
            response.summary.readiness_improvement,
            simulation.summary.completed_node_count as i64
                - baseline.summary.completed_node_count as i64
        );
    }

    #[test]
    fn missing_tenant_id_is_fatal() {
        let mut req = request("req-1");
        req.context.tenant_id.clear();
        let err = run_engine(&req).expect_err("missing tenant");
        assert!(matches!(err, EngineError::MissingTenantId { .. }));
    }

    #[test]
    fn missing_request_id_is_fatal() {
        let req = request("");
        let err = run_engine(&req).expect_err("missing request id");
        assert!(matches!(err, EngineError::MissingRequestId));
    }

    #[test]
    fn policy_block_aborts_with_the_documented_message() {
        let mut req = request("req-1");
        // Fan five leaves out of one root with a serial-only profile.
        req.context.graph.nodes = vec![RecoveryNode::new("root", "root", CriticalityBand::Low)];
        req.context.graph.edges.clear();
        for i in 0..5 {
            let id = format!("leaf-{i}");
            req.context
                .graph
                .nodes
                .push(RecoveryNode::new(id.clone(), id.clone(), CriticalityBand::Low));
            req.context.graph.edges.push(DependencyEdge::new("root", id));
        }
        let mut overrides = PlannerConfig::default_for_tenant("tenant-1");
        overrides.profile = TenantProfile {
            max_parallelism: 2,
            allow_overrides: false,
            ..TenantProfile::default_for_tenant("tenant-1")
        };
        req.context.plan_overrides = Some(overrides);

        let err = run_engine(&req).expect_err("policy block");
        assert!(err.to_string().contains("execution blocked by policy checks"));
    }

    #[test]
    fn graph_cycle_fails_during_planning() {
        let mut req = request("req-1");
        req.context.graph.edges.push(DependencyEdge::new("d", "a"));
        let err = run_engine(&req).expect_err("cycle");
        assert!(matches!(err, EngineError::Planner(_)));
    }

    #[test]
    fn precancelled_state_stops_before_any_stage() {
        let req = request("req-1");
        let mut state = EngineRuntimeState::new("req-1");
        state.status = EngineStatus::Cancelled;
        let err = run_engine_with_state(&req, &mut state).expect_err("cancelled");
        assert!(matches!(err, EngineError::Cancelled { .. }));
    }

    #[test]
    fn batch_sorts_by_request_id_and_isolates_failures() {
        let mut bad = request("req-b");
        bad.context.tenant_id.clear();
        let responses = run_engine_batch(vec![request("req-c"), bad, request("req-a")]);
        let ids: Vec<&str> = responses.iter().map(|r| r.request_id.as_str()).collect();
        assert_eq!(ids, vec!["req-a", "req-b", "req-c"]);
        assert!(responses[0].accepted);
        assert!(!responses[1].accepted);
        assert!(responses[1].traces[0].message.contains("tenant id"));
        assert!(responses[2].accepted);
    }

    #[test]
    fn rerunning_a_request_is_deterministic_apart_from_timestamps() {
        let first = run_engine(&request("req-42")).expect("run");
        let second = run_engine(&request("req-42")).expect("run");
        assert_eq!(first.plan, second.plan);
        assert_eq!(first.simulation, second.simulation);
        assert_eq!(
            first.summary.readiness_improvement,
            second.summary.readiness_improvement
        );
    }
}
