//! In-process `flow.*` builtin modules.
//!
//! Single-shot control nodes (start, trigger, end, branch, switch, fork,
//! error_handle) are ordinary [`ModuleHandler`]s that communicate their
//! port decision through a metadata hint the router reads. Multi-emission
//! constructs (loop, foreach, goto, merge, join, breakpoint, invoke,
//! subflow, error_workflow_trigger) are registered for cataloging but are
//! driven by the scheduler, which intercepts them before the invoker.

pub mod condition;

use std::sync::Arc;

use async_trait::async_trait;
use aster_core::{DataType, PortSemantics};
use aster_error::StepError;
use aster_execution::StepResult;
use aster_registry::{
    ModuleCall, ModuleHandler, ModuleMetadata, ModuleRegistry, ModuleResponse, ParamSpec,
    PortDecl, RegistryError, Tier,
};
use serde_json::{json, Value};

/// Metadata key carrying a single selected output port.
pub const META_PORT: &str = "port";

/// Metadata key set to `"all"` by fan-out nodes.
pub const META_PORTS: &str = "ports";

/// Module ids the scheduler drives directly instead of the invoker.
pub const SCHEDULER_MANAGED: &[&str] = &[
    "flow.loop",
    "flow.foreach",
    "flow.goto",
    "flow.merge",
    "flow.join",
    "flow.breakpoint",
    "flow.invoke",
    "flow.subflow",
    "flow.error_workflow_trigger",
];

/// Whether a module id is driven by the scheduler.
#[must_use]
pub fn is_scheduler_managed(module: &aster_core::ModuleId) -> bool {
    SCHEDULER_MANAGED.contains(&module.as_str())
}

fn shaped(data: Value) -> Result<ModuleResponse, StepError> {
    Ok(ModuleResponse::Shaped(StepResult::success(data)))
}

fn shaped_with_port(data: Value, port: &str) -> Result<ModuleResponse, StepError> {
    let mut result = StepResult::success(data);
    result
        .meta
        .extra
        .insert(META_PORT.into(), Value::String(port.to_owned()));
    Ok(ModuleResponse::Shaped(result))
}

// ── Handlers ────────────────────────────────────────────────────────────────

struct StartHandler;

#[async_trait]
impl ModuleHandler for StartHandler {
    async fn invoke(&self, _call: ModuleCall) -> Result<ModuleResponse, StepError> {
        shaped(Value::Null)
    }
}

struct TriggerHandler;

#[async_trait]
impl ModuleHandler for TriggerHandler {
    async fn invoke(&self, call: ModuleCall) -> Result<ModuleResponse, StepError> {
        let trigger_type = call
            .params
            .get("trigger_type")
            .and_then(Value::as_str)
            .unwrap_or("manual")
            .to_owned();
        let payload = call.params.get("payload").cloned().unwrap_or(Value::Null);
        shaped(json!({"type": trigger_type, "payload": payload}))
    }
}

struct EndHandler;

#[async_trait]
impl ModuleHandler for EndHandler {
    async fn invoke(&self, call: ModuleCall) -> Result<ModuleResponse, StepError> {
        // The scheduler substitutes the inbound payload when no explicit
        // output mapping is configured.
        let mapping = call
            .params
            .get("output_mapping")
            .cloned()
            .unwrap_or(Value::Null);
        shaped(mapping)
    }
}

struct BranchHandler;

#[async_trait]
impl ModuleHandler for BranchHandler {
    async fn invoke(&self, call: ModuleCall) -> Result<ModuleResponse, StepError> {
        let condition = call.params.get("condition").unwrap_or(&Value::Null);
        let taken = condition::evaluate(condition);
        let port = if taken { "true" } else { "false" };
        shaped_with_port(json!({"condition": taken}), port)
    }
}

struct SwitchHandler;

#[async_trait]
impl ModuleHandler for SwitchHandler {
    async fn invoke(&self, call: ModuleCall) -> Result<ModuleResponse, StepError> {
        let value = call
            .params
            .get("value")
            .or_else(|| call.params.get("expression"))
            .cloned()
            .unwrap_or(Value::Null);
        let key = match &value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        shaped_with_port(json!({"matched": key}), &format!("case:{key}"))
    }
}

struct ForkHandler;

#[async_trait]
impl ModuleHandler for ForkHandler {
    async fn invoke(&self, _call: ModuleCall) -> Result<ModuleResponse, StepError> {
        let mut result = StepResult::success(Value::Null);
        result
            .meta
            .extra
            .insert(META_PORTS.into(), Value::String("all".into()));
        Ok(ModuleResponse::Shaped(result))
    }
}

struct ErrorHandleHandler;

#[async_trait]
impl ModuleHandler for ErrorHandleHandler {
    async fn invoke(&self, call: ModuleCall) -> Result<ModuleResponse, StepError> {
        // Pass the (resolved) params through so error subgraphs can shape
        // the failure payload they forward.
        shaped(Value::Object(call.params))
    }
}

/// Placeholder handler for scheduler-managed modules; reaching it means a
/// routing bug.
struct SchedulerManagedHandler(&'static str);

#[async_trait]
impl ModuleHandler for SchedulerManagedHandler {
    async fn invoke(&self, _call: ModuleCall) -> Result<ModuleResponse, StepError> {
        Err(StepError::internal(format!(
            "{} is driven by the scheduler and must not reach the invoker",
            self.0
        )))
    }
}

// ── Registration ────────────────────────────────────────────────────────────

/// Register every `flow.*` builtin into a registry.
pub fn register_flow_builtins(registry: &ModuleRegistry) -> Result<(), RegistryError> {
    let entry_meta = |id: &str, label: &str, description: &str| {
        ModuleMetadata::new(id, label, description)
            .with_tier(Tier::Featured)
            .with_input_ports(vec![])
            .with_can_be_start(true)
    };

    registry.register(
        entry_meta("flow.start", "Start", "Entry point of a workflow"),
        Arc::new(StartHandler),
    )?;
    registry.register(
        entry_meta("flow.trigger", "Trigger", "External entry point")
            .with_param("trigger_type", ParamSpec::string().with_default(json!("manual")))
            .with_param("payload", ParamSpec::of(DataType::Any)),
        Arc::new(TriggerHandler),
    )?;
    registry.register(
        ModuleMetadata::new("flow.end", "End", "Terminal node; resolves workflow output")
            .with_tier(Tier::Featured)
            .with_output_ports(vec![])
            .with_param("output_mapping", ParamSpec::of(DataType::Object)),
        Arc::new(EndHandler),
    )?;
    registry.register(
        ModuleMetadata::new("flow.branch", "Branch", "Two-way conditional")
            .with_tier(Tier::Featured)
            .with_param("condition", ParamSpec::of(DataType::Any).required())
            .with_output_ports(vec![
                PortDecl::new("true").with_semantics(PortSemantics::True),
                PortDecl::new("false").with_semantics(PortSemantics::False),
            ]),
        Arc::new(BranchHandler),
    )?;
    registry.register(
        ModuleMetadata::new("flow.switch", "Switch", "Multi-way case dispatch")
            .with_tier(Tier::Featured)
            .with_param("value", ParamSpec::of(DataType::Any).with_alias("expression"))
            .with_output_ports(vec![PortDecl::new("default")]),
        Arc::new(SwitchHandler),
    )?;
    registry.register(
        ModuleMetadata::new("flow.fork", "Fork", "Fan out to every outgoing edge")
            .with_tier(Tier::Featured),
        Arc::new(ForkHandler),
    )?;
    registry.register(
        ModuleMetadata::new("flow.error_handle", "Handle Error", "Shapes a routed failure"),
        Arc::new(ErrorHandleHandler),
    )?;

    // Scheduler-managed constructs: registered for catalog/validation;
    // the scheduler intercepts them before dispatch.
    let managed: &[(&str, &str, &str)] = &[
        ("flow.loop", "Loop", "Repeat the iterate branch a fixed number of times"),
        ("flow.foreach", "For Each", "Iterate the iterate branch over a collection"),
        ("flow.goto", "Goto", "Unconditional jump with an iteration ceiling"),
        ("flow.merge", "Merge", "Gather upstream emissions by strategy"),
        ("flow.join", "Join", "Synchronize parallel branches"),
        ("flow.breakpoint", "Breakpoint", "Pause for human approval"),
        ("flow.invoke", "Invoke", "Run another workflow inline"),
        ("flow.subflow", "Subflow", "Run a nested workflow"),
        (
            "flow.error_workflow_trigger",
            "Error Trigger",
            "Entry point of the error-handling subgraph",
        ),
    ];
    for &(id, label, description) in managed {
        let mut meta = ModuleMetadata::new(id, label, description).with_tier(Tier::Toolkit);
        meta = match id {
            "flow.loop" | "flow.foreach" => meta.with_output_ports(vec![
                PortDecl::new("iterate").with_semantics(PortSemantics::Iterate),
                PortDecl::new("done").with_semantics(PortSemantics::Done),
            ]),
            "flow.error_workflow_trigger" => meta
                .with_input_ports(vec![])
                .with_can_be_start(false),
            _ => meta,
        };
        registry.register(meta, Arc::new(SchedulerManagedHandler(id)))?;
    }

    Ok(())
}
