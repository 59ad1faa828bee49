//! Incident-recovery graph model, normalizer, and structural validator.
//!
//! An [`IncidentGraph`] is the caller-supplied description of a recovery
//! effort: an ordered sequence of recovery steps (nodes) and the directed
//! dependency edges between them. Before planning or simulation the graph
//! passes through [`normalize`], which:
//!
//! 1. collapses duplicate from→to edges into one, keeping the maximum
//!    weight,
//! 2. inserts synthetic guard edges that serialize independent
//!    high-criticality steps converging on the same downstream step,
//! 3. refreshes the snapshot counters in the metadata.
//!
//! [`validate_graph`] performs the structural checks that are fatal at the
//! engine level: dependency cycles (depth-first traversal with an explicit
//! recursion-stack set keyed by node id), dangling edge endpoints, and
//! duplicate node ids.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::MILLION;

// ---------------------------------------------------------------------------
// CriticalityBand — node criticality classification
// ---------------------------------------------------------------------------

/// Criticality band of a recovery step. Influences risk scoring, planner
/// tie-breaks, and simulated failure bias.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum CriticalityBand {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl CriticalityBand {
    pub const ALL: [Self; 4] = [Self::Low, Self::Medium, Self::High, Self::Critical];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Base red-risk contribution, fixed point (1_000_000 == 1.0).
    pub const fn risk_weight_millionths(self) -> i64 {
        match self {
            Self::Low => 100_000,
            Self::Medium => 250_000,
            Self::High => 500_000,
            Self::Critical => 750_000,
        }
    }

    /// Baseline failure bias applied by the simulator, in millionths.
    pub const fn fail_bias_millionths(self) -> i64 {
        match self {
            Self::Low => 40_000,
            Self::Medium => 80_000,
            Self::High => 140_000,
            Self::Critical => 200_000,
        }
    }

    /// True for the bands that participate in guard-edge serialization.
    pub const fn is_elevated(self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

impl fmt::Display for CriticalityBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RecoveryNode / DependencyEdge
// ---------------------------------------------------------------------------

/// A single recovery step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryNode {
    /// Unique identifier within the graph.
    pub id: String,
    /// Human-readable label; also matched against signal topics.
    pub label: String,
    pub band: CriticalityBand,
}

impl RecoveryNode {
    pub fn new(id: impl Into<String>, label: impl Into<String>, band: CriticalityBand) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            band,
        }
    }
}

/// A directed dependency: `to` may not start before `from` has resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
    /// Edge weight in millionths; duplicate edges keep the maximum.
    #[serde(default)]
    pub weight_millionths: i64,
    /// Set on synthetic edges inserted by the normalizer.
    #[serde(default)]
    pub guard: bool,
}

impl DependencyEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            weight_millionths: 0,
            guard: false,
        }
    }
}

// ---------------------------------------------------------------------------
// GraphMeta / GraphSnapshot
// ---------------------------------------------------------------------------

/// Bookkeeping counters captured on the metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GraphSnapshot {
    /// RFC 3339 timestamp supplied by the caller.
    pub created_at: String,
    pub updated_at: String,
    pub node_count: usize,
    pub edge_count: usize,
}

/// Graph-level metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GraphMeta {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub owner_team: String,
    /// Simulation window, minutes from incident start.
    pub window_start_minutes: u32,
    pub window_end_minutes: u32,
    pub snapshot: GraphSnapshot,
}

// ---------------------------------------------------------------------------
// IncidentGraph
// ---------------------------------------------------------------------------

/// Caller-supplied recovery graph. Nodes form an ordered sequence; edges are
/// directed from prerequisite to dependent step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct IncidentGraph {
    pub meta: GraphMeta,
    pub nodes: Vec<RecoveryNode>,
    pub edges: Vec<DependencyEdge>,
}

impl IncidentGraph {
    pub fn node(&self, id: &str) -> Option<&RecoveryNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_ids(&self) -> BTreeSet<String> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }

    /// In-degree per node id, counting only edges whose endpoints exist.
    pub fn in_degrees(&self) -> BTreeMap<String, usize> {
        let ids = self.node_ids();
        let mut degrees: BTreeMap<String, usize> = ids.iter().map(|id| (id.clone(), 0)).collect();
        for edge in &self.edges {
            if ids.contains(&edge.from) {
                if let Some(d) = degrees.get_mut(&edge.to) {
                    *d += 1;
                }
            }
        }
        degrees
    }

    /// Adjacency map from node id to its dependents, in sorted order.
    pub fn adjacency(&self) -> BTreeMap<String, BTreeSet<String>> {
        let ids = self.node_ids();
        let mut adj: BTreeMap<String, BTreeSet<String>> =
            ids.iter().map(|id| (id.clone(), BTreeSet::new())).collect();
        for edge in &self.edges {
            if ids.contains(&edge.from) && ids.contains(&edge.to) {
                if let Some(set) = adj.get_mut(&edge.from) {
                    set.insert(edge.to.clone());
                }
            }
        }
        adj
    }
}

// ---------------------------------------------------------------------------
// NormalizedGraph — proof that normalization ran
// ---------------------------------------------------------------------------

/// An [`IncidentGraph`] that has passed through [`normalize`]. Planner,
/// policy evaluator, and simulator all consume this type rather than the raw
/// graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedGraph {
    graph: IncidentGraph,
}

impl NormalizedGraph {
    pub fn graph(&self) -> &IncidentGraph {
        &self.graph
    }

    pub fn into_inner(self) -> IncidentGraph {
        self.graph
    }

    pub fn nodes(&self) -> &[RecoveryNode] {
        &self.graph.nodes
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.graph.edges
    }

    pub fn meta(&self) -> &GraphMeta {
        &self.graph.meta
    }

    /// Topological depth per node id (Kahn layering). Nodes trapped in a
    /// cycle receive no entry; [`validate_graph`] reports those as fatal.
    pub fn layering(&self) -> BTreeMap<String, usize> {
        let mut in_deg = self.graph.in_degrees();
        let adj = self.graph.adjacency();
        let mut depth: BTreeMap<String, usize> = BTreeMap::new();
        let mut frontier: Vec<String> = in_deg
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| id.clone())
            .collect();
        let mut level = 0usize;
        while !frontier.is_empty() {
            let mut next: Vec<String> = Vec::new();
            for id in &frontier {
                depth.insert(id.clone(), level);
                if let Some(dependents) = adj.get(id) {
                    for dep in dependents {
                        if let Some(d) = in_deg.get_mut(dep) {
                            *d = d.saturating_sub(1);
                            if *d == 0 {
                                next.push(dep.clone());
                            }
                        }
                    }
                }
            }
            next.sort();
            next.dedup();
            frontier = next;
            level += 1;
        }
        depth
    }
}

// ---------------------------------------------------------------------------
// normalize
// ---------------------------------------------------------------------------

/// Normalizes a graph: dedupes multi-edges (keeping the maximum weight and
/// sticky guard flag), applies the guard-edge serialization rule, and
/// refreshes the snapshot counters. Returns a new value; the input is
/// untouched.
pub fn normalize(graph: &IncidentGraph) -> NormalizedGraph {
    let ids = graph.node_ids();

    // Dedupe: same from→to collapses to one edge with the max weight.
    let mut deduped: BTreeMap<(String, String), DependencyEdge> = BTreeMap::new();
    for edge in &graph.edges {
        let key = (edge.from.clone(), edge.to.clone());
        match deduped.get_mut(&key) {
            Some(existing) => {
                existing.weight_millionths = existing.weight_millionths.max(edge.weight_millionths);
                existing.guard = existing.guard || edge.guard;
            }
            None => {
                deduped.insert(key, edge.clone());
            }
        }
    }

    // Guard rule: when two or more independent elevated-criticality nodes
    // target the same downstream node, chain them (id order) with synthetic
    // guard edges so they cannot run in the same wave. An insertion is
    // skipped when the destination already reaches the source, which would
    // close a cycle.
    let band_of: BTreeMap<&str, CriticalityBand> =
        graph.nodes.iter().map(|n| (n.id.as_str(), n.band)).collect();
    let mut incoming_elevated: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for edge in deduped.values() {
        if !ids.contains(&edge.from) || !ids.contains(&edge.to) {
            continue;
        }
        if band_of
            .get(edge.from.as_str())
            .is_some_and(|band| band.is_elevated())
        {
            incoming_elevated
                .entry(edge.to.clone())
                .or_default()
                .push(edge.from.clone());
        }
    }

    for sources in incoming_elevated.values_mut() {
        sources.sort();
        sources.dedup();
        if sources.len() < 2 {
            continue;
        }
        for pair in 0..sources.len() - 1 {
            let earlier = sources[pair].clone();
            let later = sources[pair + 1].clone();
            let forward = (earlier.clone(), later.clone());
            let backward = (later.clone(), earlier.clone());
            if deduped.contains_key(&forward) || deduped.contains_key(&backward) {
                continue; // already dependent on each other
            }
            if reaches(&deduped, &later, &earlier) {
                continue;
            }
            deduped.insert(
                forward,
                DependencyEdge {
                    from: earlier,
                    to: later,
                    weight_millionths: MILLION,
                    guard: true,
                },
            );
        }
    }

    let mut normalized = graph.clone();
    normalized.edges = deduped.into_values().collect();
    normalized.meta.snapshot.node_count = normalized.nodes.len();
    normalized.meta.snapshot.edge_count = normalized.edges.len();
    NormalizedGraph { graph: normalized }
}

/// Breadth-first reachability over the deduped edge set.
fn reaches(edges: &BTreeMap<(String, String), DependencyEdge>, from: &str, to: &str) -> bool {
    let mut adj: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (f, t) in edges.keys() {
        adj.entry(f.as_str()).or_default().push(t.as_str());
    }
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    queue.push_back(from);
    while let Some(current) = queue.pop_front() {
        if current == to {
            return true;
        }
        if !seen.insert(current) {
            continue;
        }
        if let Some(nexts) = adj.get(current) {
            for next in nexts {
                queue.push_back(next);
            }
        }
    }
    false
}

// ---------------------------------------------------------------------------
// validate_graph
// ---------------------------------------------------------------------------

/// Outcome of a structural or instruction validation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphValidation {
    pub valid: bool,
    pub reasons: Vec<String>,
}

impl GraphValidation {
    pub fn ok() -> Self {
        Self {
            valid: true,
            reasons: Vec::new(),
        }
    }

    pub fn from_reasons(reasons: Vec<String>) -> Self {
        Self {
            valid: reasons.is_empty(),
            reasons,
        }
    }
}

/// Structural validation: duplicate node ids, dangling edge endpoints, and
/// dependency cycles. Fatal at the engine level.
pub fn validate_graph(graph: &IncidentGraph) -> GraphValidation {
    let mut reasons = Vec::new();

    let mut seen: BTreeSet<&str> = BTreeSet::new();
    for node in &graph.nodes {
        if !seen.insert(node.id.as_str()) {
            reasons.push(format!("duplicate node id '{}'", node.id));
        }
    }

    let ids = graph.node_ids();
    for edge in &graph.edges {
        if !ids.contains(&edge.from) {
            reasons.push(format!(
                "edge {} -> {} references unknown node '{}'",
                edge.from, edge.to, edge.from
            ));
        }
        if !ids.contains(&edge.to) {
            reasons.push(format!(
                "edge {} -> {} references unknown node '{}'",
                edge.from, edge.to, edge.to
            ));
        }
    }

    reasons.extend(find_cycles(graph));
    GraphValidation::from_reasons(reasons)
}

/// Depth-first cycle detection with an explicit recursion-stack set. Each
/// detected back edge yields one reason naming both endpoints.
fn find_cycles(graph: &IncidentGraph) -> Vec<String> {
    let adj = graph.adjacency();
    let mut visited: BTreeSet<String> = BTreeSet::new();
    let mut reasons = Vec::new();

    for start in adj.keys() {
        if visited.contains(start) {
            continue;
        }
        // Iterative DFS: (node, next-child cursor) frames plus a stack set.
        let mut in_stack: BTreeSet<String> = BTreeSet::new();
        let mut frames: Vec<(String, Vec<String>, usize)> = Vec::new();
        let children: Vec<String> = adj.get(start).map(|s| s.iter().cloned().collect()).unwrap_or_default();
        in_stack.insert(start.clone());
        visited.insert(start.clone());
        frames.push((start.clone(), children, 0));

        while let Some((node, children, cursor)) = frames.last_mut() {
            if *cursor >= children.len() {
                in_stack.remove(node.as_str());
                frames.pop();
                continue;
            }
            let child = children[*cursor].clone();
            *cursor += 1;
            if in_stack.contains(&child) {
                reasons.push(format!(
                    "dependency cycle detected between '{}' and '{}'",
                    node, child
                ));
                continue;
            }
            if visited.insert(child.clone()) {
                let grandchildren: Vec<String> = adj
                    .get(&child)
                    .map(|s| s.iter().cloned().collect())
                    .unwrap_or_default();
                in_stack.insert(child.clone());
                frames.push((child, grandchildren, 0));
            }
        }
    }
    reasons
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, band: CriticalityBand) -> RecoveryNode {
        RecoveryNode::new(id, format!("step {id}"), band)
    }

    fn graph(nodes: Vec<RecoveryNode>, edges: Vec<DependencyEdge>) -> IncidentGraph {
        IncidentGraph {
            meta: GraphMeta {
                id: "g-1".to_string(),
                tenant_id: "tenant-1".to_string(),
                name: "restore".to_string(),
                owner_team: "sre".to_string(),
                window_start_minutes: 0,
                window_end_minutes: 240,
                snapshot: GraphSnapshot::default(),
            },
            nodes,
            edges,
        }
    }

    #[test]
    fn normalize_dedupes_multi_edges_keeping_max_weight() {
        let mut e1 = DependencyEdge::new("a", "b");
        e1.weight_millionths = 200_000;
        let mut e2 = DependencyEdge::new("a", "b");
        e2.weight_millionths = 700_000;
        let g = graph(
            vec![node("a", CriticalityBand::Low), node("b", CriticalityBand::Low)],
            vec![e1, e2],
        );
        let normalized = normalize(&g);
        assert_eq!(normalized.edges().len(), 1);
        assert_eq!(normalized.edges()[0].weight_millionths, 700_000);
        assert_eq!(normalized.meta().snapshot.edge_count, 1);
    }

    #[test]
    fn normalize_inserts_guard_edge_for_converging_critical_nodes() {
        let g = graph(
            vec![
                node("db", CriticalityBand::Critical),
                node("cache", CriticalityBand::High),
                node("app", CriticalityBand::Low),
            ],
            vec![
                DependencyEdge::new("db", "app"),
                DependencyEdge::new("cache", "app"),
            ],
        );
        let normalized = normalize(&g);
        let guard: Vec<_> = normalized.edges().iter().filter(|e| e.guard).collect();
        assert_eq!(guard.len(), 1);
        assert_eq!(guard[0].from, "cache");
        assert_eq!(guard[0].to, "db");
        // Guarded graph must still validate.
        assert!(validate_graph(normalized.graph()).valid);
    }

    #[test]
    fn guard_rule_skips_dependent_sources() {
        let g = graph(
            vec![
                node("a", CriticalityBand::High),
                node("b", CriticalityBand::High),
                node("c", CriticalityBand::Low),
            ],
            vec![
                DependencyEdge::new("a", "b"),
                DependencyEdge::new("a", "c"),
                DependencyEdge::new("b", "c"),
            ],
        );
        let normalized = normalize(&g);
        assert!(normalized.edges().iter().all(|e| !e.guard));
        assert!(validate_graph(normalized.graph()).valid);
    }

    #[test]
    fn validate_rejects_two_node_cycle_naming_both_nodes() {
        let g = graph(
            vec![node("a", CriticalityBand::Low), node("b", CriticalityBand::Low)],
            vec![DependencyEdge::new("a", "b"), DependencyEdge::new("b", "a")],
        );
        let result = validate_graph(&g);
        assert!(!result.valid);
        assert!(result
            .reasons
            .iter()
            .any(|r| r.contains("'a'") && r.contains("'b'") && r.contains("cycle")));
    }

    #[test]
    fn validate_rejects_dangling_edge() {
        let g = graph(
            vec![node("a", CriticalityBand::Low)],
            vec![DependencyEdge::new("a", "ghost")],
        );
        let result = validate_graph(&g);
        assert!(!result.valid);
        assert!(result.reasons.iter().any(|r| r.contains("ghost")));
    }

    #[test]
    fn validate_rejects_duplicate_node_ids() {
        let g = graph(
            vec![node("a", CriticalityBand::Low), node("a", CriticalityBand::High)],
            vec![],
        );
        let result = validate_graph(&g);
        assert!(!result.valid);
        assert!(result.reasons.iter().any(|r| r.contains("duplicate")));
    }

    #[test]
    fn validate_accepts_diamond() {
        let g = graph(
            vec![
                node("a", CriticalityBand::Low),
                node("b", CriticalityBand::Low),
                node("c", CriticalityBand::Low),
                node("d", CriticalityBand::Low),
            ],
            vec![
                DependencyEdge::new("a", "b"),
                DependencyEdge::new("a", "c"),
                DependencyEdge::new("b", "d"),
                DependencyEdge::new("c", "d"),
            ],
        );
        assert!(validate_graph(&g).valid);
    }

    #[test]
    fn layering_assigns_topological_depths() {
        let g = graph(
            vec![
                node("a", CriticalityBand::Low),
                node("b", CriticalityBand::Low),
                node("c", CriticalityBand::Low),
                node("d", CriticalityBand::Low),
            ],
            vec![
                DependencyEdge::new("a", "b"),
                DependencyEdge::new("a", "c"),
                DependencyEdge::new("b", "d"),
                DependencyEdge::new("c", "d"),
            ],
        );
        let layering = normalize(&g).layering();
        assert_eq!(layering.get("a"), Some(&0));
        assert_eq!(layering.get("b"), Some(&1));
        assert_eq!(layering.get("c"), Some(&1));
        assert_eq!(layering.get("d"), Some(&2));
    }
}
