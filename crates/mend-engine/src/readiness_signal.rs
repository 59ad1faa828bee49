//! Readiness signals: external observations consumed by the simulator.
//!
//! A signal is immutable once issued. During simulation a signal that
//! matches an evaluated node biases that node's transition outcome: higher
//! severity raises the failure threshold, higher confidence raises the
//! weight the deterministic roll gives to that bias.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::MILLION;
use crate::incident_graph::RecoveryNode;

// ---------------------------------------------------------------------------
// SignalSeverity
// ---------------------------------------------------------------------------

/// Severity of a readiness observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSeverity {
    Info,
    Minor,
    Major,
    Critical,
}

impl SignalSeverity {
    pub const ALL: [Self; 4] = [Self::Info, Self::Minor, Self::Major, Self::Critical];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Minor => "minor",
            Self::Major => "major",
            Self::Critical => "critical",
        }
    }

    /// Failure bias contributed at full confidence, in millionths.
    pub const fn fail_bias_millionths(self) -> i64 {
        match self {
            Self::Info => 0,
            Self::Minor => 60_000,
            Self::Major => 150_000,
            Self::Critical => 300_000,
        }
    }
}

impl fmt::Display for SignalSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ReadinessSignal
// ---------------------------------------------------------------------------

/// An external observation about a node or topic. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessSignal {
    pub id: String,
    /// Originating node id, when the signal is node-scoped.
    pub node_id: String,
    /// Free-form topic; matched against node labels.
    pub topic: String,
    pub severity: SignalSeverity,
    /// Confidence in millionths, clamped to `[0, 1_000_000]`.
    pub confidence_millionths: i64,
    /// RFC 3339 issue timestamp supplied by the observer.
    pub issued_at: String,
}

impl ReadinessSignal {
    pub fn new(
        id: impl Into<String>,
        node_id: impl Into<String>,
        severity: SignalSeverity,
        confidence_millionths: i64,
    ) -> Self {
        Self {
            id: id.into(),
            node_id: node_id.into(),
            topic: String::new(),
            severity,
            confidence_millionths: confidence_millionths.clamp(0, MILLION),
            issued_at: String::new(),
        }
    }

    /// A signal matches a node by id, or by topic equal to the node label.
    pub fn matches_node(&self, node: &RecoveryNode) -> bool {
        (!self.node_id.is_empty() && self.node_id == node.id)
            || (!self.topic.is_empty() && self.topic == node.label)
    }

    /// Failure bias this signal contributes to a matching node, scaled by
    /// confidence. Fixed point, millionths.
    pub fn scaled_fail_bias_millionths(&self) -> i64 {
        self.severity.fail_bias_millionths() * self.confidence_millionths / MILLION
    }
}
