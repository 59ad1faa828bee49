//! Tenant policy evaluation: admission control ahead of planning.
//!
//! A [`TenantProfile`] bounds what a tenant's recovery run may do. The
//! evaluator compares the graph's peak concurrent fan-out (widest
//! topological layer) against `max_parallelism`:
//!
//! - fan-out exceeds the limit and overrides are disallowed → execution is
//!   blocked and the engine aborts,
//! - overrides are allowed → the evaluator returns soft waivers naming the
//!   nodes whose direct concurrency was waived,
//! - reentrance disallowed → any node id that would occupy two waves
//!   (duplicate id in the node sequence) also blocks execution.

use serde::{Deserialize, Serialize};

use crate::incident_graph::NormalizedGraph;

// ---------------------------------------------------------------------------
// TenantProfile
// ---------------------------------------------------------------------------

/// Per-tenant execution constraints, supplied by the caller or defaulted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantProfile {
    pub tenant_id: String,
    pub profile_name: String,
    pub max_parallelism: usize,
    pub min_readiness_window_minutes: u32,
    pub allow_overrides: bool,
    pub allow_reentrance: bool,
}

impl TenantProfile {
    /// Conservative defaults for tenants without an explicit profile.
    pub fn default_for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            profile_name: "standard".to_string(),
            max_parallelism: 4,
            min_readiness_window_minutes: 30,
            allow_overrides: false,
            allow_reentrance: false,
        }
    }
}

// ---------------------------------------------------------------------------
// PolicyDecision
// ---------------------------------------------------------------------------

/// Outcome of the admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allow_execution: bool,
    /// Soft overrides applied instead of blocking, e.g.
    /// `parallelism-waiver:<node-id>`.
    pub overrides: Vec<String>,
    /// Reasons attached when execution is blocked.
    pub reasons: Vec<String>,
}

impl PolicyDecision {
    fn allowed(overrides: Vec<String>) -> Self {
        Self {
            allow_execution: true,
            overrides,
            reasons: Vec::new(),
        }
    }

    fn blocked(reasons: Vec<String>) -> Self {
        Self {
            allow_execution: false,
            overrides: Vec::new(),
            reasons,
        }
    }
}

// ---------------------------------------------------------------------------
// evaluate_policies
// ---------------------------------------------------------------------------

/// Evaluates tenant policy against a normalized graph.
pub fn evaluate_policies(graph: &NormalizedGraph, profile: &TenantProfile) -> PolicyDecision {
    let mut reasons = Vec::new();

    if !profile.allow_reentrance {
        let mut counts = std::collections::BTreeMap::new();
        for node in graph.nodes() {
            *counts.entry(node.id.as_str()).or_insert(0usize) += 1;
        }
        for (id, count) in counts {
            if count > 1 {
                reasons.push(format!(
                    "node '{id}' would run in {count} waves but reentrance is disallowed"
                ));
            }
        }
    }

    let layering = graph.layering();
    let mut widths = std::collections::BTreeMap::new();
    for depth in layering.values() {
        *widths.entry(*depth).or_insert(0usize) += 1;
    }
    let peak = widths.values().copied().max().unwrap_or(0);

    let mut overrides = Vec::new();
    if profile.max_parallelism > 0 && peak > profile.max_parallelism {
        if profile.allow_overrides {
            // Waive direct concurrency for nodes past the limit at each
            // over-wide depth, in deterministic id order.
            for (depth, width) in &widths {
                if *width <= profile.max_parallelism {
                    continue;
                }
                let mut at_depth: Vec<&str> = layering
                    .iter()
                    .filter(|(_, d)| *d == depth)
                    .map(|(id, _)| id.as_str())
                    .collect();
                at_depth.sort_unstable();
                for id in at_depth.iter().skip(profile.max_parallelism) {
                    overrides.push(format!("parallelism-waiver:{id}"));
                }
            }
        } else {
            reasons.push(format!(
                "peak fan-out {peak} exceeds profile limit {} for tenant '{}'",
                profile.max_parallelism, profile.tenant_id
            ));
        }
    }

    if reasons.is_empty() {
        PolicyDecision::allowed(overrides)
    } else {
        PolicyDecision::blocked(reasons)
    }
}
