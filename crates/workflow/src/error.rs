//! Workflow error types.

use aster_core::KeyError;
use thiserror::Error;

/// Errors raised while loading a workflow document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    /// The document failed to deserialize.
    #[error("failed to parse workflow document: {0}")]
    Parse(String),

    /// The document shape is invalid (e.g. both `steps` and `nodes`).
    #[error("invalid workflow shape: {0}")]
    Shape(String),

    /// An identifier inside the document is malformed.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// A referenced node does not exist.
    #[error("unknown node {0:?}")]
    UnknownNode(String),
}
