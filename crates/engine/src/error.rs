//! Engine error types.

use aster_core::ExecutionId;
use aster_workflow::ValidationReport;
use thiserror::Error;

/// Errors raised by the engine API.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The workflow failed validation; no step ran.
    #[error("workflow validation failed with {} issue(s)", report.issues.len())]
    Validation {
        /// The full issue list.
        report: ValidationReport,
    },

    /// The workflow document could not be loaded.
    #[error(transparent)]
    Workflow(#[from] aster_workflow::WorkflowError),

    /// A registry lookup failed.
    #[error(transparent)]
    Registry(#[from] aster_registry::RegistryError),

    /// An execution-state operation failed.
    #[error(transparent)]
    Execution(#[from] aster_execution::ExecutionError),

    /// Supplied workflow inputs failed their declarations.
    #[error("invalid inputs: {0}")]
    InvalidInputs(String),

    /// No execution with the given id is known.
    #[error("execution {0} not found")]
    ExecutionNotFound(ExecutionId),

    /// The operation is not valid in the execution's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Replay preconditions were not met.
    #[error("replay failed: {0}")]
    Replay(String),
}

impl EngineError {
    /// Wrap a validation report.
    #[must_use]
    pub fn validation(report: ValidationReport) -> Self {
        Self::Validation { report }
    }
}
