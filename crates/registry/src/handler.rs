//! Type-erased module handler seam.
//!
//! Every module — in-process builtin or plugin-backed — is invoked through
//! [`ModuleHandler`]. Handlers receive an explicit [`InvokeContext`] (the
//! sanitized public view of the execution) rather than reaching into any
//! ambient state.

use async_trait::async_trait;
use aster_core::ExecutionId;
use aster_error::StepError;
use aster_execution::StepResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The sanitized context a module receives at invoke time.
///
/// Contains the public layer only — never the private or secrets layers.
/// Resolved credential values appear in `credentials` exclusively for
/// modules declaring `requires_credentials`, injected by the invoker for
/// the duration of the call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvokeContext {
    /// The owning execution.
    pub execution_id: String,
    /// Workflow document id.
    pub workflow_id: String,
    /// Workflow display name.
    pub workflow_name: String,
    /// Public variable layer snapshot.
    #[serde(default)]
    pub public: serde_json::Map<String, Value>,
    /// Injected runtime handles (e.g. `browser_ws_endpoint`).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub handles: serde_json::Map<String, Value>,
    /// Resolved credentials, present only for `requires_credentials`
    /// modules.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub credentials: serde_json::Map<String, Value>,
}

impl InvokeContext {
    /// Build a context for an execution.
    #[must_use]
    pub fn new(
        execution_id: ExecutionId,
        workflow_id: impl Into<String>,
        workflow_name: impl Into<String>,
    ) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            workflow_id: workflow_id.into(),
            workflow_name: workflow_name.into(),
            public: serde_json::Map::new(),
            handles: serde_json::Map::new(),
            credentials: serde_json::Map::new(),
        }
    }

    /// Attach the public layer snapshot.
    #[must_use]
    pub fn with_public(mut self, public: serde_json::Map<String, Value>) -> Self {
        self.public = public;
        self
    }

    /// Inject a runtime handle.
    #[must_use]
    pub fn with_handle(mut self, name: impl Into<String>, value: Value) -> Self {
        self.handles.insert(name.into(), value);
        self
    }

    /// Inject a resolved credential.
    #[must_use]
    pub fn with_credential(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.credentials
            .insert(name.into(), Value::String(value.into()));
        self
    }
}

/// One module invocation: canonicalized parameters plus context.
#[derive(Debug, Clone, Default)]
pub struct ModuleCall {
    /// Canonicalized, schema-validated parameters.
    pub params: serde_json::Map<String, Value>,
    /// The sanitized invoke context.
    pub context: InvokeContext,
    /// Per-call time budget in milliseconds; `0` means unbounded.
    pub timeout_ms: u64,
}

impl ModuleCall {
    /// Build a call with no time budget.
    #[must_use]
    pub fn new(params: serde_json::Map<String, Value>, context: InvokeContext) -> Self {
        Self {
            params,
            context,
            timeout_ms: 0,
        }
    }

    /// Set the per-call time budget.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// What a handler returns on success.
///
/// `Shaped` results pass through the invoker untouched; `Raw` values go
/// through legacy-shape normalization (OK-pattern, status-pattern, bare
/// value).
#[derive(Debug, Clone)]
pub enum ModuleResponse {
    /// Already in the engine's normalized shape.
    Shaped(StepResult),
    /// An arbitrary value to be normalized by the invoker.
    Raw(Value),
}

impl ModuleResponse {
    /// Shorthand for a shaped success.
    #[must_use]
    pub fn success(data: Value) -> Self {
        Self::Shaped(StepResult::success(data))
    }
}

/// Type-erased module executor.
///
/// Module authors implement this once per module; the registry stores the
/// handler next to its metadata. Handlers must be cheap to call
/// concurrently unless their metadata declares `concurrent_safe: false`,
/// in which case the invoker serializes them.
#[async_trait]
pub trait ModuleHandler: Send + Sync + 'static {
    /// Execute the module.
    async fn invoke(&self, call: ModuleCall) -> Result<ModuleResponse, StepError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ModuleHandler for Echo {
        async fn invoke(&self, call: ModuleCall) -> Result<ModuleResponse, StepError> {
            Ok(ModuleResponse::Raw(Value::Object(call.params)))
        }
    }

    #[tokio::test]
    async fn handler_receives_params() {
        let call = ModuleCall::new(
            json!({"text": "hi"}).as_object().unwrap().clone(),
            InvokeContext::default(),
        );
        let response = Echo.invoke(call).await.unwrap();
        match response {
            ModuleResponse::Raw(value) => assert_eq!(value["text"], "hi"),
            ModuleResponse::Shaped(_) => panic!("expected Raw"),
        }
    }

    #[test]
    fn context_serialization_skips_empty_maps() {
        let ctx = InvokeContext::new(ExecutionId::v4(), "wf", "wf");
        let json = serde_json::to_value(&ctx).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("handles"));
        assert!(!obj.contains_key("credentials"));
        assert!(obj.contains_key("public"));
    }

    #[test]
    fn context_builders() {
        let ctx = InvokeContext::new(ExecutionId::v4(), "wf", "demo")
            .with_public(json!({"cursor": 3}).as_object().unwrap().clone())
            .with_handle("browser_ws_endpoint", json!("ws://localhost:9222"))
            .with_credential("api_key", "abc");
        assert_eq!(ctx.public["cursor"], 3);
        assert_eq!(ctx.handles["browser_ws_endpoint"], "ws://localhost:9222");
        assert_eq!(ctx.credentials["api_key"], "abc");
    }
}
