//! Evidence snapshots bracketing each step.
//!
//! Evidence is what makes replay possible: `context_before` is the exact
//! public state a step saw, `context_after` the state it left behind.
//! Records are append-only and addressable by `(node_id[, iteration])`.
//! Snapshots never contain the secrets layer — the snapshot type has no
//! field for it.

use std::collections::BTreeMap;

use aster_core::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::result::StepResult;

/// A point-in-time view of the public execution state.
///
/// Contains only the public variable layer and the step outputs completed
/// at snapshot time. The private and secrets layers are structurally
/// absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// The public variable layer (workflow params included).
    pub public: serde_json::Map<String, Value>,
    /// Completed step outputs at snapshot time, keyed by node id.
    pub step_outputs: BTreeMap<String, StepResult>,
}

impl ContextSnapshot {
    /// Build a snapshot from the public layer and completed outputs.
    #[must_use]
    pub fn new(
        public: serde_json::Map<String, Value>,
        step_outputs: BTreeMap<String, StepResult>,
    ) -> Self {
        Self {
            public,
            step_outputs,
        }
    }
}

/// One evidence record for one step execution (or one foreach iteration).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// The step this record brackets.
    pub node_id: NodeId,
    /// Iteration index for per-iteration foreach records; `None` for plain
    /// steps and for the foreach aggregate record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<usize>,
    /// Public state immediately before the invoker call.
    pub context_before: ContextSnapshot,
    /// Public state immediately after the outcome was recorded.
    pub context_after: ContextSnapshot,
    /// When the step started.
    pub started_at: DateTime<Utc>,
    /// When the step ended.
    pub ended_at: DateTime<Utc>,
}

impl Evidence {
    /// Create a record for a plain (non-iteration) step.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        context_before: ContextSnapshot,
        context_after: ContextSnapshot,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        Self {
            node_id,
            iteration: None,
            context_before,
            context_after,
            started_at,
            ended_at,
        }
    }

    /// Tag the record with a foreach iteration index.
    #[must_use]
    pub fn for_iteration(mut self, index: usize) -> Self {
        self.iteration = Some(index);
        self
    }
}

/// Append-only evidence store for one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceLog {
    records: Vec<Evidence>,
}

impl EvidenceLog {
    /// An empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.
    pub fn append(&mut self, record: Evidence) {
        self.records.push(record);
    }

    /// All records, in append order.
    #[must_use]
    pub fn records(&self) -> &[Evidence] {
        &self.records
    }

    /// The latest record for a node (aggregate record for foreach).
    #[must_use]
    pub fn latest_for(&self, node_id: &NodeId) -> Option<&Evidence> {
        self.records
            .iter()
            .rev()
            .find(|r| &r.node_id == node_id && r.iteration.is_none())
    }

    /// The record for a specific foreach iteration of a node.
    #[must_use]
    pub fn iteration_for(&self, node_id: &NodeId, iteration: usize) -> Option<&Evidence> {
        self.records
            .iter()
            .rev()
            .find(|r| &r.node_id == node_id && r.iteration == Some(iteration))
    }
}
