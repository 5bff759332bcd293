//! Dual-track module invoker.
//!
//! The single point where every handler return shape is normalized into
//! [`StepResult`], where fallback routing happens, and where
//! `concurrent_safe: false` modules are serialized.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use aster_core::ModuleId;
use aster_error::{ErrorCode, StepError};
use aster_execution::{StepMeta, StepResult};
use aster_registry::{ModuleCall, ModuleResponse, RegistrySnapshot};
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error};

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Dispatches module calls to their registered handlers.
pub struct ModuleInvoker {
    snapshot: RegistrySnapshot,
    serial_locks: DashMap<ModuleId, Arc<tokio::sync::Mutex<()>>>,
}

impl ModuleInvoker {
    /// Build an invoker over a frozen registry snapshot.
    #[must_use]
    pub fn new(snapshot: RegistrySnapshot) -> Self {
        Self {
            snapshot,
            serial_locks: DashMap::new(),
        }
    }

    /// The snapshot this invoker dispatches against.
    #[must_use]
    pub fn snapshot(&self) -> &RegistrySnapshot {
        &self.snapshot
    }

    /// Invoke a module and normalize whatever comes back.
    ///
    /// Never returns `Err`: every failure mode becomes a `StepResult` with
    /// `ok: false` and a stable error code. Unknown modules produce
    /// `NOT_FOUND`; a handler panic produces `INTERNAL_ERROR` with the
    /// panic text kept in internal metadata.
    pub async fn invoke(&self, module_id: &ModuleId, call: ModuleCall) -> StepResult {
        let request_id = format!("req-{}", REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed));

        let module = match self.snapshot.get(module_id) {
            Ok(module) => module,
            Err(_) => {
                return with_meta(
                    StepResult::failure(StepError::new(
                        ErrorCode::NotFound,
                        format!("module {module_id} is not registered"),
                    )),
                    module_id,
                    &request_id,
                );
            }
        };

        // Serialize modules that declare themselves concurrency-unsafe.
        let _serial_guard = if module.metadata.execution.concurrent_safe {
            None
        } else {
            let lock = self
                .serial_locks
                .entry(module_id.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone();
            Some(lock.lock_owned().await)
        };

        let primary = self
            .run_handler(module.handler.clone(), call.clone(), module_id, &request_id)
            .await;

        let result = match (&primary, &module.fallback) {
            (result, Some(fallback)) if should_fall_back(result) => {
                debug!(module = %module_id, "primary handler unavailable, trying fallback");
                self.run_handler(fallback.clone(), call, module_id, &request_id)
                    .await
            }
            _ => primary,
        };

        with_meta(result, module_id, &request_id)
    }

    async fn run_handler(
        &self,
        handler: Arc<dyn aster_registry::ModuleHandler>,
        call: ModuleCall,
        module_id: &ModuleId,
        request_id: &str,
    ) -> StepResult {
        let outcome = std::panic::AssertUnwindSafe(handler.invoke(call))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(response)) => normalize_response(response),
            Ok(Err(step_error)) => StepResult::failure(step_error),
            Err(panic) => {
                let text = panic_text(panic.as_ref());
                error!(module = %module_id, request_id, "module handler panicked: {text}");
                let mut result = StepResult::failure(StepError::internal(
                    "module handler panicked",
                ));
                // Kept in the engine's own trace, never sent to clients.
                result
                    .meta
                    .extra
                    .insert("traceback".into(), Value::String(text));
                result
            }
        }
    }
}

fn with_meta(mut result: StepResult, module_id: &ModuleId, request_id: &str) -> StepResult {
    result.meta.module_id = Some(module_id.clone());
    result.meta.request_id = Some(request_id.to_owned());
    result
}

fn should_fall_back(result: &StepResult) -> bool {
    matches!(
        result.error_code,
        Some(ErrorCode::Unsupported | ErrorCode::PluginCrashed)
    )
}

fn panic_text(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "opaque panic payload".to_owned())
}

/// Normalize a handler response into the engine's outcome contract.
#[must_use]
pub fn normalize_response(response: ModuleResponse) -> StepResult {
    match response {
        ModuleResponse::Shaped(result) => result,
        ModuleResponse::Raw(value) => normalize_raw(value),
    }
}

fn normalize_raw(value: Value) -> StepResult {
    if let Value::Object(map) = &value {
        // New OK-pattern: `{ok: bool, data?, error?, error_code?}`.
        if let Some(ok) = map.get("ok").and_then(Value::as_bool) {
            if ok {
                let mut result =
                    StepResult::success(map.get("data").cloned().unwrap_or(Value::Null));
                result.meta = meta_from(map);
                return result;
            }
            let code = map
                .get("error_code")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<ErrorCode>().ok())
                .unwrap_or(ErrorCode::ExecutionError);
            let message = map
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("module reported failure")
                .to_owned();
            let mut result = StepResult::failure(StepError::new(code, message));
            result.meta = meta_from(map);
            return result;
        }

        // Old status-pattern: `{status: "error"|"success", message?, data?}`.
        if let Some(status) = map.get("status").and_then(Value::as_str) {
            match status {
                "error" => {
                    let message = map
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("module reported failure")
                        .to_owned();
                    return StepResult::failure(StepError::new(
                        ErrorCode::ExecutionError,
                        message,
                    ));
                }
                "success" | "ok" => {
                    return StepResult::success(
                        map.get("data").cloned().unwrap_or(Value::Null),
                    );
                }
                _ => {}
            }
        }
    }

    // Arbitrary value: wrap as success.
    StepResult::success(value)
}

fn meta_from(map: &serde_json::Map<String, Value>) -> StepMeta {
    map.get("meta")
        .cloned()
        .and_then(|m| serde_json::from_value(m).ok())
        .unwrap_or_default()
}
