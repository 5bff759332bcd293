//! Structured step failure payload.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::code::ErrorCode;

/// A structured failure raised by a module handler or synthesized by the
/// engine.
///
/// The `message` is client-visible; internal diagnostics (tracebacks,
/// upstream payloads) belong in `details`, which stays inside the engine's
/// own trace and is never sent over a client boundary.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct StepError {
    /// Stable error code.
    pub code: ErrorCode,
    /// Human-readable description of the failure.
    pub message: String,
    /// Optional actionable suggestion shown to the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Optional parameter name the failure is attributed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Free-form internal diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl StepError {
    /// Create an error with just a code and message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            hint: None,
            field: None,
            details: None,
        }
    }

    /// Attach a hint.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attribute the failure to a parameter.
    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Attach internal diagnostics.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Shorthand for a `VALIDATION_ERROR`.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Shorthand for a `TIMEOUT`.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    /// Shorthand for a `CANCELLED`.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "execution cancelled")
    }

    /// Shorthand for an `INTERNAL_ERROR`.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Whether the step may be retried given the module's declaration and a
    /// per-step `retry_on` extension list.
    #[must_use]
    pub fn is_retryable(&self, module_retryable: bool, retry_on: &[ErrorCode]) -> bool {
        module_retryable
            && (self.code.is_retryable_by_default() || retry_on.contains(&self.code))
    }
}
