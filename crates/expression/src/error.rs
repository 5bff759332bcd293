//! Expression error types.

use thiserror::Error;

/// Errors produced while parsing or resolving a variable reference.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    /// The template or path text is malformed.
    #[error("parse error at offset {offset}: {message}")]
    Parse {
        /// Byte offset into the source where parsing failed.
        offset: usize,
        /// What went wrong.
        message: String,
    },

    /// A referenced path did not resolve (strict mode only).
    #[error("unresolved reference: {path}")]
    Missing {
        /// The dotted path that failed to resolve.
        path: String,
    },
}

impl ExpressionError {
    /// Construct a parse error.
    #[must_use]
    pub fn parse(offset: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            offset,
            message: message.into(),
        }
    }

    /// Construct a missing-reference error.
    #[must_use]
    pub fn missing(path: impl Into<String>) -> Self {
        Self::Missing { path: path.into() }
    }
}
