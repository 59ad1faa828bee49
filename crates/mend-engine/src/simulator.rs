//! Deterministic tick-based simulation of a recovery graph.
//!
//! The simulator replays a normalized graph against readiness signals in
//! discrete ticks. On each tick, every unattempted node whose dependencies
//! have all resolved (completed or warned) is evaluated; the transition
//! outcome is decided by a deterministic roll derived from
//! `(scenario_id, node_id, tick)` — FNV-1a 64 over the canonical key,
//! finalized splitmix64-style, reduced to millionths — compared against
//! fail/warn thresholds biased by the node's criticality band and any
//! matching signals. No wall clock and no ambient randomness: two calls
//! with identical inputs produce identical results, which is the central
//! contract of this module.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::MILLION;
use crate::incident_graph::{NormalizedGraph, RecoveryNode};
use crate::readiness_signal::ReadinessSignal;

/// Scenario id used by the unseeded entry point.
pub const UNSEEDED_SCENARIO_ID: &str = "unseeded";

/// Upper bound on the failure threshold so no node is doomed outright.
const MAX_FAIL_THRESHOLD_MILLIONTHS: i64 = 900_000;

/// Base width of the warn band, in millionths.
const BASE_WARN_WIDTH_MILLIONTHS: i64 = 100_000;

/// Red-risk contribution per incoming dependency, mirrors the planner.
const IN_DEGREE_RED_MILLIONTHS: i64 = 75_000;

// ---------------------------------------------------------------------------
// NodeOutcome
// ---------------------------------------------------------------------------

/// Terminal transition outcome of one evaluated node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOutcome {
    Completed,
    Warned,
    Failed,
}

impl NodeOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Warned => "warned",
            Self::Failed => "failed",
        }
    }

    /// Whether this outcome unblocks dependents. A warned node finished its
    /// step, only a failed node leaves dependents stranded.
    pub const fn unblocks_dependents(self) -> bool {
        !matches!(self, Self::Failed)
    }
}

impl fmt::Display for NodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SimulationSummary / SimulationResult
// ---------------------------------------------------------------------------

/// Aggregate counters for one simulation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SimulationSummary {
    pub completed_node_count: usize,
    pub failed_node_count: usize,
    pub warning_node_count: usize,
    /// Ids of signals that matched at least one evaluated node, sorted.
    pub triggered_signals: Vec<String>,
    /// Accumulated red risk of warn/fail resolutions, in millionths.
    pub total_risk_points: i64,
}

/// Result of one simulation run. Carries no identity beyond the scenario id
/// used to seed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub scenario_id: String,
    pub ticks_used: u64,
    /// False when the run ended with unattempted nodes (tick budget
    /// exhausted or dependents stranded behind a failure). Such nodes are
    /// counted in no bucket.
    pub converged: bool,
    pub summary: SimulationSummary,
}

// ---------------------------------------------------------------------------
// Deterministic roll
// ---------------------------------------------------------------------------

/// FNV-1a 64 over the canonical `(scenario, node, tick)` key.
fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        h ^= u64::from(b);
        h = h.wrapping_mul(0x0100_0000_01b3);
    }
    h
}

/// Splitmix64 finalizer for avalanche over the FNV state.
fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Deterministic roll in `[0, 1_000_000]` for one node evaluation.
pub fn outcome_roll_millionths(scenario_id: &str, node_id: &str, tick: u64) -> i64 {
    let key = format!("{scenario_id}:{node_id}:{tick}");
    let mixed = splitmix64(fnv1a64(key.as_bytes()));
    (mixed % (MILLION as u64 + 1)) as i64
}

// ---------------------------------------------------------------------------
// simulate
// ---------------------------------------------------------------------------

/// Seeded simulation: replays `graph` against `signals` for at most
/// `max_ticks` ticks. Byte-identical output for identical inputs.
pub fn simulate_with_seed(
    graph: &NormalizedGraph,
    signals: &[ReadinessSignal],
    max_ticks: u64,
    scenario_id: &str,
) -> SimulationResult {
    let node_ids = graph.graph().node_ids();
    let in_degrees = graph.graph().in_degrees();

    // Prerequisites per node, restricted to edges with valid endpoints.
    let mut prerequisites: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for edge in graph.edges() {
        if node_ids.contains(&edge.from) && node_ids.contains(&edge.to) {
            prerequisites
                .entry(edge.to.as_str())
                .or_default()
                .push(edge.from.as_str());
        }
    }

    let mut outcomes: BTreeMap<&str, NodeOutcome> = BTreeMap::new();
    let mut triggered: BTreeSet<&str> = BTreeSet::new();
    let mut total_risk_points: i64 = 0;
    let mut ticks_used: u64 = 0;

    for tick in 0..max_ticks {
        // Nodes whose dependencies have all resolved and which have not yet
        // been attempted, in node-sequence order.
        let ready: Vec<&RecoveryNode> = graph
            .nodes()
            .iter()
            .filter(|n| !outcomes.contains_key(n.id.as_str()))
            .filter(|n| {
                prerequisites.get(n.id.as_str()).is_none_or(|prereqs| {
                    prereqs
                        .iter()
                        .all(|p| outcomes.get(p).is_some_and(|o| o.unblocks_dependents()))
                })
            })
            .collect();
        if ready.is_empty() {
            break;
        }
        ticks_used = tick + 1;

        for node in ready {
            let id = node.id.as_str();

            let mut fail_threshold = node.band.fail_bias_millionths();
            let mut matched_confidence: i64 = 0;
            for signal in signals {
                if signal.matches_node(node) {
                    triggered.insert(signal.id.as_str());
                    fail_threshold += signal.scaled_fail_bias_millionths();
                    matched_confidence += signal.confidence_millionths;
                }
            }
            fail_threshold = fail_threshold.clamp(0, MAX_FAIL_THRESHOLD_MILLIONTHS);
            let warn_width = (BASE_WARN_WIDTH_MILLIONTHS + matched_confidence / 10)
                .min(MILLION - fail_threshold);

            let roll = outcome_roll_millionths(scenario_id, id, tick);
            let outcome = if roll < fail_threshold {
                NodeOutcome::Failed
            } else if roll < fail_threshold + warn_width {
                NodeOutcome::Warned
            } else {
                NodeOutcome::Completed
            };

            if outcome != NodeOutcome::Completed {
                let in_degree = in_degrees.get(id).copied().unwrap_or(0) as i64;
                total_risk_points += (node.band.risk_weight_millionths()
                    + in_degree * IN_DEGREE_RED_MILLIONTHS)
                    .clamp(0, MILLION);
            }
            outcomes.insert(id, outcome);
        }
    }

    let completed = outcomes
        .values()
        .filter(|o| **o == NodeOutcome::Completed)
        .count();
    let warned = outcomes
        .values()
        .filter(|o| **o == NodeOutcome::Warned)
        .count();
    let failed = outcomes
        .values()
        .filter(|o| **o == NodeOutcome::Failed)
        .count();

    SimulationResult {
        scenario_id: scenario_id.to_string(),
        ticks_used,
        converged: outcomes.len() == node_ids.len(),
        summary: SimulationSummary {
            completed_node_count: completed,
            failed_node_count: failed,
            warning_node_count: warned,
            triggered_signals: triggered.iter().map(|s| s.to_string()).collect(),
            total_risk_points,
        },
    }
}

/// Unseeded variant: same engine pinned to [`UNSEEDED_SCENARIO_ID`].
pub fn simulate_graph(
    graph: &NormalizedGraph,
    signals: &[ReadinessSignal],
    max_ticks: u64,
) -> SimulationResult {
    simulate_with_seed(graph, signals, max_ticks, UNSEEDED_SCENARIO_ID)
}
