//! Engine event trace.
//!
//! Every execution appends [`EngineEvent`]s to a [`TraceLog`] in emission
//! order. The log round-trips through JSONL so traces persist as
//! append-only line files.

use aster_core::{ExecutionId, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Event discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Execution began.
    EngineStart,
    /// A step began.
    NodeStart,
    /// A step finished; payload is its `StepResult`.
    NodeEnd,
    /// A log line (module or plugin stderr).
    Log,
    /// A streaming chunk from a module (LLM tokens, progress).
    PartialOutput,
    /// An execution-level error.
    Error,
    /// Execution reached a terminal state.
    EngineEnd,
}

/// One trace entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    /// Event discriminant.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Unix seconds at emission.
    pub ts: f64,
    /// The owning execution.
    pub execution_id: ExecutionId,
    /// The step this event concerns, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    /// Event payload.
    #[serde(default)]
    pub payload: Value,
}

impl EngineEvent {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn now(kind: EventKind, execution_id: ExecutionId) -> Self {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self {
            kind,
            ts,
            execution_id,
            node_id: None,
            payload: Value::Null,
        }
    }

    /// Attach a node id.
    #[must_use]
    pub fn with_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// An append-only event log for one execution (or one replay generation).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceLog {
    /// Replay generation: 0 for the original run, incremented per replay.
    #[serde(default)]
    pub generation: u32,
    entries: Vec<EngineEvent>,
}

impl TraceLog {
    /// An empty generation-0 log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty log for a replay generation.
    #[must_use]
    pub fn for_generation(generation: u32) -> Self {
        Self {
            generation,
            entries: Vec::new(),
        }
    }

    /// Append an event.
    pub fn append(&mut self, event: EngineEvent) {
        self.entries.push(event);
    }

    /// The recorded events, in emission order.
    #[must_use]
    pub fn entries(&self) -> &[EngineEvent] {
        &self.entries
    }

    /// Number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize as JSON lines, one event per line.
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        Ok(out)
    }

    /// Parse a JSONL trace back into a log (generation 0).
    pub fn from_jsonl(source: &str) -> Result<Self, serde_json::Error> {
        let entries = source
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            generation: 0,
            entries,
        })
    }
}
