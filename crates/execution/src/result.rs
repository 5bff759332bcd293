//! The normalized step outcome contract.
//!
//! Whatever shape a module returns internally, the invoker normalizes it
//! into a [`StepResult`] before the engine stores or routes it.

use aster_core::ModuleId;
use aster_error::{ErrorCode, StepError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Execution metadata attached to every step outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMeta {
    /// The module that produced this result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<ModuleId>,
    /// Correlation id of the underlying invocation (plugin RPC id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Wall-clock duration of the final attempt, in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    /// Total attempts made (1 = no retries).
    #[serde(default)]
    pub attempts: u32,
    /// Additional metadata (module hints, internal diagnostics).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// The engine's normalized outcome for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Whether the step succeeded.
    pub ok: bool,
    /// Output data; `Null` when the step produced none.
    #[serde(default)]
    pub data: Value,
    /// Human-readable error, present when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stable error code, present when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    /// Whether the step was skipped by its guard.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    /// Execution metadata.
    #[serde(default)]
    pub meta: StepMeta,
}

impl StepResult {
    /// A successful result carrying `data`.
    #[must_use]
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data,
            error: None,
            error_code: None,
            skipped: false,
            meta: StepMeta::default(),
        }
    }

    /// A failure built from a structured error.
    ///
    /// `hint` and `field` move into `meta` so the flat result shape stays
    /// stable.
    #[must_use]
    pub fn failure(error: StepError) -> Self {
        let mut meta = StepMeta::default();
        if let Some(hint) = &error.hint {
            meta.extra.insert("hint".into(), Value::String(hint.clone()));
        }
        if let Some(field) = &error.field {
            meta.extra
                .insert("field".into(), Value::String(field.clone()));
        }
        if let Some(details) = &error.details {
            meta.extra.insert("details".into(), details.clone());
        }
        Self {
            ok: false,
            data: Value::Null,
            error: Some(error.message),
            error_code: Some(error.code),
            skipped: false,
            meta,
        }
    }

    /// A guard-skipped result: successful, no data.
    #[must_use]
    pub fn skipped() -> Self {
        Self {
            ok: true,
            data: Value::Null,
            error: None,
            error_code: None,
            skipped: true,
            meta: StepMeta::default(),
        }
    }

    /// A cancellation outcome.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::failure(StepError::cancelled())
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_meta(mut self, meta: StepMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Whether this result represents a failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        !self.ok
    }

    /// Reconstruct the structured error, if this is a failure.
    #[must_use]
    pub fn as_error(&self) -> Option<StepError> {
        if self.ok {
            return None;
        }
        Some(StepError {
            code: self.error_code.unwrap_or(ErrorCode::ExecutionError),
            message: self.error.clone().unwrap_or_default(),
            hint: self
                .meta
                .extra
                .get("hint")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
            field: self
                .meta
                .extra
                .get("field")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
            details: self.meta.extra.get("details").cloned(),
        })
    }
}
