#![forbid(unsafe_code)]

//! mend-engine: incident-recovery graph planner and deterministic simulator.
//!
//! Given a directed graph of recovery steps and their dependencies, the
//! engine normalizes and validates the graph, gates execution through
//! tenant policy, builds a concurrency-bounded wave plan, replays it in a
//! seed-reproducible tick simulation, and reports the readiness delta
//! between a baseline and an optimized run. All transformations are pure
//! functions over immutable value types; nothing here touches a clock or
//! ambient randomness inside the simulation path.

pub mod engine;
pub mod incident_graph;
pub mod planner;
pub mod policy;
pub mod readiness_signal;
pub mod simulator;

/// Fixed-point multiplier: 1_000_000 ≡ 1.0.
pub const MILLION: i64 = 1_000_000;

pub use engine::{
    EngineControl, EngineError, EngineRequest, EngineResponse, EngineRuntimeState, EngineStatus,
    OrchestrationContext, RunSummary, TraceEvent, control_engine, run_engine, run_engine_batch,
    run_engine_with_state,
};
pub use incident_graph::{
    CriticalityBand, DependencyEdge, GraphMeta, GraphSnapshot, GraphValidation, IncidentGraph,
    NormalizedGraph, RecoveryNode, normalize, validate_graph,
};
pub use planner::{
    PlanInstruction, PlannerConfig, PlannerError, PreferredOrdering, RecoveryPlan, RiskVector,
    create_plan, enforce_max_parallelism, mutate_ordering, validate_instructions,
};
pub use policy::{PolicyDecision, TenantProfile, evaluate_policies};
pub use readiness_signal::{ReadinessSignal, SignalSeverity};
pub use simulator::{
    NodeOutcome, SimulationResult, SimulationSummary, UNSEEDED_SCENARIO_ID, simulate_graph,
    simulate_with_seed,
};
