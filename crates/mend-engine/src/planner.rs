//! Recovery planner: topological ordering, risk scoring, wave packing, and
//! intra-wave ordering mutation.
//!
//! Planning is a chain of pure transformations over immutable values:
//!
//! 1. [`create_plan`] — Kahn's algorithm over the normalized graph, with
//!    ties among ready nodes broken by the configured ordering; assigns each
//!    instruction a risk vector and its topological-depth wave,
//! 2. [`enforce_max_parallelism`] — repacks waves so no wave exceeds the
//!    tenant profile's `max_parallelism`, never moving an instruction ahead
//!    of its dependencies,
//! 3. [`mutate_ordering`] — re-sorts instructions within each wave only.
//!
//! Every step returns a new [`RecoveryPlan`] with the same stable `id`, so a
//! baseline and an optimized plan of the same graph stay comparable.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::MILLION;
use crate::incident_graph::{CriticalityBand, GraphValidation, NormalizedGraph};
use crate::policy::TenantProfile;

/// Modeled duration of one execution wave.
const WAVE_DURATION_MINUTES: u32 = 15;

/// Red-risk contribution per incoming dependency, in millionths.
const IN_DEGREE_RED_MILLIONTHS: i64 = 75_000;

/// Amber-risk contribution per incoming dependency, in millionths.
const IN_DEGREE_AMBER_MILLIONTHS: i64 = 50_000;

/// Red-risk allowance granted per configured retry, in millionths.
const RETRY_ALLOWANCE_MILLIONTHS: i64 = 25_000;

// ---------------------------------------------------------------------------
// PreferredOrdering
// ---------------------------------------------------------------------------

/// Tie-break strategy for ready nodes and intra-wave ordering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "kebab-case")]
pub enum PreferredOrdering {
    #[default]
    CriticalityFirst,
    Alpha,
    ReverseAlpha,
}

impl PreferredOrdering {
    pub const ALL: [Self; 3] = [Self::CriticalityFirst, Self::Alpha, Self::ReverseAlpha];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CriticalityFirst => "criticality-first",
            Self::Alpha => "alpha",
            Self::ReverseAlpha => "reverse-alpha",
        }
    }

    /// Ordering between two candidate instructions.
    fn compare(self, a: (&CriticalityBand, &str), b: (&CriticalityBand, &str)) -> Ordering {
        match self {
            Self::CriticalityFirst => b.0.cmp(a.0).then_with(|| a.1.cmp(b.1)),
            Self::Alpha => a.1.cmp(b.1),
            Self::ReverseAlpha => b.1.cmp(a.1),
        }
    }
}

impl fmt::Display for PreferredOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PlannerConfig
// ---------------------------------------------------------------------------

/// Constraint set for one planning pass. Never mutated in place; each
/// refinement produces a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerConfig {
    pub graph_window_minutes: u32,
    pub signal_grace_minutes: u32,
    pub failure_tolerance_percent: u32,
    pub max_retries: u32,
    pub preferred_ordering: PreferredOrdering,
    pub profile: TenantProfile,
}

impl PlannerConfig {
    pub fn default_for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            graph_window_minutes: 240,
            signal_grace_minutes: 10,
            failure_tolerance_percent: 10,
            max_retries: 1,
            preferred_ordering: PreferredOrdering::CriticalityFirst,
            profile: TenantProfile::default_for_tenant(tenant_id),
        }
    }
}

// ---------------------------------------------------------------------------
// RiskVector / PlanInstruction / RecoveryPlan
// ---------------------------------------------------------------------------

/// Named risk channels, fixed point (1_000_000 == 1.0), clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RiskVector {
    pub red_millionths: i64,
    pub amber_millionths: i64,
}

impl RiskVector {
    pub fn clamped(red_millionths: i64, amber_millionths: i64) -> Self {
        Self {
            red_millionths: red_millionths.clamp(0, MILLION),
            amber_millionths: amber_millionths.clamp(0, MILLION),
        }
    }
}

/// One node-execution unit within a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanInstruction {
    pub node_id: String,
    pub band: CriticalityBand,
    pub risks: RiskVector,
    /// Wave index; instructions in the same wave may run concurrently.
    pub wave: usize,
    /// Global position in the ordered instruction sequence.
    pub position: usize,
}

/// Ordered, wave-annotated execution plan. The `id` stays stable across
/// throttling and reordering transformations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub id: String,
    pub instructions: Vec<PlanInstruction>,
    pub estimated_duration_minutes: u32,
}

impl RecoveryPlan {
    /// Number of waves (max wave index + 1).
    pub fn wave_count(&self) -> usize {
        self.instructions
            .iter()
            .map(|i| i.wave + 1)
            .max()
            .unwrap_or(0)
    }

    /// Instructions grouped by wave, position order preserved.
    pub fn waves(&self) -> BTreeMap<usize, Vec<&PlanInstruction>> {
        let mut grouped: BTreeMap<usize, Vec<&PlanInstruction>> = BTreeMap::new();
        let mut ordered: Vec<&PlanInstruction> = self.instructions.iter().collect();
        ordered.sort_by_key(|i| i.position);
        for instruction in ordered {
            grouped.entry(instruction.wave).or_default().push(instruction);
        }
        grouped
    }
}

// ---------------------------------------------------------------------------
// PlannerError
// ---------------------------------------------------------------------------

/// Errors from planning operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlannerError {
    /// Topological sort could not consume every node.
    CyclicDependency { remaining: Vec<String> },
}

impl fmt::Display for PlannerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CyclicDependency { remaining } => write!(
                f,
                "cyclic dependency detected; unorderable nodes: {}",
                remaining.join(", ")
            ),
        }
    }
}

impl std::error::Error for PlannerError {}

// ---------------------------------------------------------------------------
// create_plan
// ---------------------------------------------------------------------------

/// Builds an ordered plan from a normalized graph via Kahn's algorithm.
///
/// Ties among zero-in-degree nodes are broken by
/// `config.preferred_ordering`. Each instruction's wave is its topological
/// depth; red risk grows with criticality band and in-degree and shrinks
/// with the configured retry allowance.
pub fn create_plan(
    graph: &NormalizedGraph,
    config: &PlannerConfig,
) -> Result<RecoveryPlan, PlannerError> {
    let in_degrees = graph.graph().in_degrees();
    let adjacency = graph.graph().adjacency();
    let layering = graph.layering();
    let bands: BTreeMap<&str, CriticalityBand> = graph
        .nodes()
        .iter()
        .map(|n| (n.id.as_str(), n.band))
        .collect();

    let mut remaining_degrees = in_degrees.clone();
    let mut ready: Vec<String> = remaining_degrees
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| id.clone())
        .collect();
    let mut ordered: Vec<String> = Vec::new();

    while !ready.is_empty() {
        ready.sort_by(|a, b| {
            let band_a = bands.get(a.as_str()).copied().unwrap_or_default();
            let band_b = bands.get(b.as_str()).copied().unwrap_or_default();
            config
                .preferred_ordering
                .compare((&band_a, a.as_str()), (&band_b, b.as_str()))
        });
        let next = ready.remove(0);
        if let Some(dependents) = adjacency.get(&next) {
            for dependent in dependents {
                if let Some(d) = remaining_degrees.get_mut(dependent) {
                    *d = d.saturating_sub(1);
                    if *d == 0 {
                        ready.push(dependent.clone());
                    }
                }
            }
        }
        ordered.push(next);
    }

    if ordered.len() != in_degrees.len() {
        let placed: BTreeSet<&str> = ordered.iter().map(String::as_str).collect();
        let remaining = in_degrees
            .keys()
            .filter(|id| !placed.contains(id.as_str()))
            .cloned()
            .collect();
        return Err(PlannerError::CyclicDependency { remaining });
    }

    let instructions: Vec<PlanInstruction> = ordered
        .iter()
        .enumerate()
        .map(|(position, id)| {
            let band = bands.get(id.as_str()).copied().unwrap_or_default();
            let in_degree = in_degrees.get(id).copied().unwrap_or(0) as i64;
            PlanInstruction {
                node_id: id.clone(),
                band,
                risks: instruction_risks(band, in_degree, config),
                wave: layering.get(id).copied().unwrap_or(0),
                position,
            }
        })
        .collect();

    let wave_count = instructions.iter().map(|i| i.wave + 1).max().unwrap_or(0);
    Ok(RecoveryPlan {
        id: derive_plan_id(&graph.meta().id, &graph.meta().tenant_id),
        estimated_duration_minutes: estimate_duration(wave_count, config),
        instructions,
    })
}

/// Risk channels for one instruction, fixed point, clamped to `[0, 1.0]`.
fn instruction_risks(band: CriticalityBand, in_degree: i64, config: &PlannerConfig) -> RiskVector {
    let retry_allowance = i64::from(config.max_retries) * RETRY_ALLOWANCE_MILLIONTHS;
    let red = band.risk_weight_millionths() + in_degree * IN_DEGREE_RED_MILLIONTHS
        - retry_allowance;
    let tolerance_shortfall = i64::from(100u32.saturating_sub(config.failure_tolerance_percent));
    let amber = in_degree * IN_DEGREE_AMBER_MILLIONTHS + tolerance_shortfall * 2_000;
    RiskVector::clamped(red, amber)
}

/// Wave count times the per-wave constant, clamped to the graph window when
/// one is configured.
fn estimate_duration(wave_count: usize, config: &PlannerConfig) -> u32 {
    let raw = (wave_count as u32).saturating_mul(WAVE_DURATION_MINUTES);
    if config.graph_window_minutes > 0 {
        raw.min(config.graph_window_minutes)
    } else {
        raw
    }
}

/// Stable plan identity derived from graph and tenant, never regenerated by
/// later transformations.
fn derive_plan_id(graph_id: &str, tenant_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(graph_id.as_bytes());
    hasher.update(b":");
    hasher.update(tenant_id.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!("plan-{hex}")
}

// ---------------------------------------------------------------------------
// enforce_max_parallelism
// ---------------------------------------------------------------------------

/// Greedily repacks the plan into waves of at most
/// `config.profile.max_parallelism` instructions.
///
/// Instructions are consumed in (wave, position) order and each original
/// wave is split into limit-sized chunks, so an instruction never lands in a
/// wave at or before any of its dependencies: for every edge from→to,
/// `wave(to) > wave(from)` still holds afterwards.
pub fn enforce_max_parallelism(plan: &RecoveryPlan, config: &PlannerConfig) -> RecoveryPlan {
    let limit = config.profile.max_parallelism.max(1);

    let mut ordered: Vec<PlanInstruction> = plan.instructions.clone();
    ordered.sort_by_key(|i| (i.wave, i.position));

    let mut packed: Vec<PlanInstruction> = Vec::with_capacity(ordered.len());
    let mut current_source_wave = usize::MAX;
    let mut current_wave = 0usize;
    let mut current_fill = 0usize;
    for mut instruction in ordered {
        let new_source = instruction.wave != current_source_wave;
        if new_source || current_fill == limit {
            if !packed.is_empty() {
                current_wave += 1;
            }
            current_fill = 0;
        }
        current_source_wave = instruction.wave;
        instruction.wave = current_wave;
        instruction.position = packed.len();
        current_fill += 1;
        packed.push(instruction);
    }

    let wave_count = packed.iter().map(|i| i.wave + 1).max().unwrap_or(0);
    RecoveryPlan {
        id: plan.id.clone(),
        estimated_duration_minutes: estimate_duration(wave_count, config),
        instructions: packed,
    }
}

// ---------------------------------------------------------------------------
// mutate_ordering
// ---------------------------------------------------------------------------

/// Re-sorts instructions within each wave according to `strategy`. Wave
/// assignment never changes, so the dependency invariant from
/// [`enforce_max_parallelism`] is preserved. Returns a new plan; the input
/// is untouched.
pub fn mutate_ordering(plan: &RecoveryPlan, strategy: PreferredOrdering) -> RecoveryPlan {
    let mut by_wave: BTreeMap<usize, Vec<PlanInstruction>> = BTreeMap::new();
    for instruction in &plan.instructions {
        by_wave
            .entry(instruction.wave)
            .or_default()
            .push(instruction.clone());
    }

    let mut instructions: Vec<PlanInstruction> = Vec::with_capacity(plan.instructions.len());
    for (_, mut wave) in by_wave {
        wave.sort_by(|a, b| {
            strategy.compare((&a.band, a.node_id.as_str()), (&b.band, b.node_id.as_str()))
        });
        for mut instruction in wave {
            instruction.position = instructions.len();
            instructions.push(instruction);
        }
    }

    RecoveryPlan {
        id: plan.id.clone(),
        estimated_duration_minutes: plan.estimated_duration_minutes,
        instructions,
    }
}

// ---------------------------------------------------------------------------
// validate_instructions
// ---------------------------------------------------------------------------

/// Advisory validation of a plan against its graph: every instruction must
/// reference an existing node, every node must appear exactly once, and wave
/// order must respect every edge. A failure is reported as a trace warning
/// by the engine, not an abort.
pub fn validate_instructions(plan: &RecoveryPlan, graph: &NormalizedGraph) -> GraphValidation {
    let mut reasons = Vec::new();
    let node_ids = graph.graph().node_ids();

    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
    for instruction in &plan.instructions {
        if !node_ids.contains(&instruction.node_id) {
            reasons.push(format!(
                "instruction references unknown node '{}'",
                instruction.node_id
            ));
        }
        *seen.entry(instruction.node_id.as_str()).or_insert(0) += 1;
    }
    for id in &node_ids {
        match seen.get(id.as_str()) {
            None => reasons.push(format!("node '{id}' missing from plan")),
            Some(1) => {}
            Some(n) => reasons.push(format!("node '{id}' appears {n} times in plan")),
        }
    }

    let wave_of: BTreeMap<&str, usize> = plan
        .instructions
        .iter()
        .map(|i| (i.node_id.as_str(), i.wave))
        .collect();
    for edge in graph.edges() {
        if let (Some(from_wave), Some(to_wave)) =
            (wave_of.get(edge.from.as_str()), wave_of.get(edge.to.as_str()))
        {
            if to_wave <= from_wave {
                reasons.push(format!(
                    "edge {} -> {} violates wave order ({} >= {})",
                    edge.from, edge.to, from_wave, to_wave
                ));
            }
        }
    }

    GraphValidation::from_reasons(reasons)
}
