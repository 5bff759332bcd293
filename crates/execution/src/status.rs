//! Execution-level status state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle states of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created but not yet scheduled.
    Pending,
    /// Actively scheduling and running steps.
    Running,
    /// Suspended at a cycle boundary (breakpoint or explicit pause).
    Paused,
    /// Every reachable step completed.
    Completed,
    /// Terminated by a step failure under `on_error: fail`.
    Failed,
    /// Terminated by cancellation.
    Cancelled,
}

impl ExecutionStatus {
    /// Whether this status permits a transition to `target`.
    #[must_use]
    pub fn can_transition_to(self, target: ExecutionStatus) -> bool {
        use ExecutionStatus::{Cancelled, Completed, Failed, Paused, Pending, Running};
        matches!(
            (self, target),
            (Pending, Running | Cancelled)
                | (Running, Paused | Completed | Failed | Cancelled)
                | (Paused, Running | Failed | Cancelled)
        )
    }

    /// Whether this is a terminal status.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}
