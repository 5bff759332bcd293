//! Shared test fixtures: a registry of small deterministic modules.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aster_engine::Engine;
use aster_error::{ErrorCode, StepError};
use aster_registry::{
    Capability, ExecutionContract, ModuleCall, ModuleHandler, ModuleMetadata, ModuleRegistry,
    ModuleResponse, ParamSpec, SecurityContract,
};
use async_trait::async_trait;
use serde_json::{json, Value};

pub struct Uppercase;

#[async_trait]
impl ModuleHandler for Uppercase {
    async fn invoke(&self, call: ModuleCall) -> Result<ModuleResponse, StepError> {
        let text = call.params["text"].as_str().unwrap_or_default();
        Ok(ModuleResponse::Raw(json!({"result": text.to_uppercase()})))
    }
}

pub struct Reverse;

#[async_trait]
impl ModuleHandler for Reverse {
    async fn invoke(&self, call: ModuleCall) -> Result<ModuleResponse, StepError> {
        let text = call.params["text"].as_str().unwrap_or_default();
        let reversed: String = text.chars().rev().collect();
        Ok(ModuleResponse::Raw(json!({"result": reversed})))
    }
}

pub struct Divide;

#[async_trait]
impl ModuleHandler for Divide {
    async fn invoke(&self, call: ModuleCall) -> Result<ModuleResponse, StepError> {
        let a = call.params["a"].as_f64().unwrap_or(0.0);
        let b = call.params["b"].as_f64().unwrap_or(0.0);
        if b == 0.0 {
            return Err(StepError::validation("division by zero").with_field("b"));
        }
        Ok(ModuleResponse::Raw(json!(a / b)))
    }
}

/// Counts invocations across the whole test; returns `{n: <count>}`.
pub struct Tick(pub Arc<AtomicU32>);

#[async_trait]
impl ModuleHandler for Tick {
    async fn invoke(&self, _call: ModuleCall) -> Result<ModuleResponse, StepError> {
        let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ModuleResponse::Raw(json!({"n": n})))
    }
}

pub struct Sleep;

#[async_trait]
impl ModuleHandler for Sleep {
    async fn invoke(&self, call: ModuleCall) -> Result<ModuleResponse, StepError> {
        let ms = call.params.get("ms").and_then(Value::as_u64).unwrap_or(10);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(ModuleResponse::Raw(json!({"slept": ms})))
    }
}

/// Fails `fail_times` times with NETWORK_ERROR, then succeeds.
pub struct Flaky {
    pub calls: Arc<AtomicU32>,
    pub fail_times: u32,
}

#[async_trait]
impl ModuleHandler for Flaky {
    async fn invoke(&self, _call: ModuleCall) -> Result<ModuleResponse, StepError> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_times {
            return Err(StepError::new(ErrorCode::NetworkError, "connection reset"));
        }
        Ok(ModuleResponse::Raw(json!({"attempt": attempt})))
    }
}

/// Proves it received a credential without echoing the raw value
/// (outputs land in traces; modules must not leak what they were given).
pub struct VaultRead;

#[async_trait]
impl ModuleHandler for VaultRead {
    async fn invoke(&self, call: ModuleCall) -> Result<ModuleResponse, StepError> {
        let api_key = call
            .context
            .credentials
            .get("api_key")
            .and_then(Value::as_str);
        Ok(ModuleResponse::Raw(json!({
            "has_api_key": api_key.is_some(),
            "fingerprint": api_key.map(str::len),
        })))
    }
}

/// Echoes the context it received; declares nothing.
pub struct ContextProbe;

#[async_trait]
impl ModuleHandler for ContextProbe {
    async fn invoke(&self, call: ModuleCall) -> Result<ModuleResponse, StepError> {
        Ok(ModuleResponse::Raw(json!({
            "params": call.params,
            "credentials": call.context.credentials,
            "public": call.context.public,
        })))
    }
}

/// Build a registry with the standard test modules plus a shared counter.
pub fn test_registry() -> (Arc<ModuleRegistry>, Arc<AtomicU32>) {
    let registry = Arc::new(ModuleRegistry::new());
    let counter = Arc::new(AtomicU32::new(0));

    registry
        .register(
            ModuleMetadata::new("string.uppercase", "Uppercase", "Uppercases text")
                .with_param("text", ParamSpec::string().required()),
            Arc::new(Uppercase),
        )
        .unwrap();
    registry
        .register(
            ModuleMetadata::new("string.reverse", "Reverse", "Reverses text")
                .with_param("text", ParamSpec::string().required()),
            Arc::new(Reverse),
        )
        .unwrap();
    registry
        .register(
            ModuleMetadata::new("math.divide", "Divide", "Divides a by b")
                .with_param("a", ParamSpec::number().required())
                .with_param("b", ParamSpec::number().required()),
            Arc::new(Divide),
        )
        .unwrap();
    registry
        .register(
            ModuleMetadata::new("util.tick", "Tick", "Counts invocations"),
            Arc::new(Tick(counter.clone())),
        )
        .unwrap();
    registry
        .register(
            ModuleMetadata::new("util.sleep", "Sleep", "Sleeps for `ms` milliseconds")
                .with_param("ms", ParamSpec::number()),
            Arc::new(Sleep),
        )
        .unwrap();
    registry
        .register(
            ModuleMetadata::new("vault.read", "Vault Read", "Reads a credential")
                .with_security(SecurityContract {
                    requires_credentials: true,
                    capabilities: vec![Capability::CredentialsAccess],
                    ..SecurityContract::default()
                }),
            Arc::new(VaultRead),
        )
        .unwrap();
    registry
        .register(
            ModuleMetadata::new("util.probe", "Probe", "Echoes its invoke context"),
            Arc::new(ContextProbe),
        )
        .unwrap();

    (registry, counter)
}

/// Registry plus an `http.get` that fails `fail_times` before succeeding.
pub fn registry_with_flaky(fail_times: u32) -> (Arc<ModuleRegistry>, Arc<AtomicU32>) {
    let (registry, _) = test_registry();
    let calls = Arc::new(AtomicU32::new(0));
    registry
        .register(
            ModuleMetadata::new("http.get", "HTTP GET", "Fetches a URL").with_execution(
                ExecutionContract {
                    retryable: true,
                    ..ExecutionContract::default()
                },
            ),
            Arc::new(Flaky {
                calls: calls.clone(),
                fail_times,
            }),
        )
        .unwrap();
    (registry, calls)
}

/// Build an engine over the standard test registry.
pub fn test_engine() -> (Engine, Arc<AtomicU32>) {
    let (registry, counter) = test_registry();
    (Engine::new(registry).unwrap(), counter)
}

/// Convenience: a JSON object as a serde map.
pub fn inputs(value: Value) -> serde_json::Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
