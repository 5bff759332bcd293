//! Execution error types.

use thiserror::Error;

/// Errors raised by execution-state operations.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A status transition is not valid for the current state.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: String,
        /// Attempted target status.
        to: String,
    },

    /// A step outcome was recorded twice without an erase in between.
    #[error("step output already recorded for {0}")]
    DuplicateStepOutput(String),

    /// A persisted snapshot could not be restored.
    #[error("snapshot corrupt: {0}")]
    SnapshotCorrupt(String),

    /// A serialization failure.
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The execution was cancelled.
    #[error("execution cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_display() {
        let err = ExecutionError::InvalidTransition {
            from: "completed".into(),
            to: "running".into(),
        };
        assert_eq!(err.to_string(), "invalid transition from completed to running");
    }

    #[test]
    fn duplicate_output_display() {
        let err = ExecutionError::DuplicateStepOutput("a".into());
        assert!(err.to_string().contains("already recorded"));
    }

    #[test]
    fn from_serde_error() {
        let serde_err = serde_json::from_str::<String>("not json").unwrap_err();
        let err = ExecutionError::from(serde_err);
        assert!(err.to_string().starts_with("serialization:"));
    }
}
