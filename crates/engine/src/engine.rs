//! The top-level workflow engine.
//!
//! One [`Engine`] lives per process, owning the module registry handed to
//! it at construction. Each execution captures a registry snapshot at
//! start, runs its own scheduler loop, and is addressable afterwards for
//! traces, evidence, introspection and replay.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use aster_core::{ExecutionId, NodeId};
use aster_error::{ErrorCode, StepError};
use aster_execution::{
    EngineEvent, EvidenceLog, ExecutionContext, ExecutionStatus, StepResult, TraceLog,
};
use aster_expression::{EvalContext, Template};
use aster_registry::{
    CatalogView, ConnectVerdict, IntrospectMode, ModuleRegistry, RegistryError, VarCatalog,
};
use aster_workflow::{DependencyGraph, ValidationIssue, ValidationReport, Workflow};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::info;

use crate::builtins::register_flow_builtins;
use crate::control::ControlState;
use crate::error::EngineError;
use crate::events::EventSink;
use crate::executor::ForeachResume;
use crate::introspect;
use crate::invoker::ModuleInvoker;
use crate::scheduler::{ReplaySeed, Scheduler};

/// Options for one execution.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Parent execution when spawned by `flow.invoke` / `flow.subflow`.
    pub parent: Option<ExecutionId>,
    /// Secrets to load into the context, by handle. Delivered only to
    /// modules declaring `requires_credentials`; never logged or
    /// snapshotted.
    pub secrets: Vec<(String, secrecy::SecretString)>,
}

/// The final outcome of one execution (or replay generation).
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// The execution's id.
    pub execution_id: ExecutionId,
    /// Terminal status.
    pub status: ExecutionStatus,
    /// Evaluated workflow output mapping.
    pub output: serde_json::Map<String, Value>,
    /// Every recorded step outcome, keyed by node id.
    pub step_outputs: BTreeMap<String, StepResult>,
    /// The failure that terminated the run, if any.
    pub failure: Option<StepError>,
    /// Wall-clock duration.
    pub duration: Duration,
}

impl ExecutionResult {
    /// Whether the execution completed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    /// Whether the execution failed.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.status == ExecutionStatus::Failed
    }

    /// A step's recorded data, by node id.
    #[must_use]
    pub fn step_data(&self, node: &str) -> Option<&Value> {
        self.step_outputs.get(node).map(|r| &r.data)
    }
}

struct ExecutionHandle {
    workflow: Arc<Workflow>,
    control: Arc<ControlState>,
    ctx: RwLock<Arc<ExecutionContext>>,
    past_traces: RwLock<Vec<TraceLog>>,
    result: RwLock<Option<ExecutionResult>>,
    generation: AtomicU32,
}

/// The workflow execution engine.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<ModuleRegistry>,
    executions: Arc<DashMap<ExecutionId, Arc<ExecutionHandle>>>,
}

impl Engine {
    /// Build an engine over a registry; the `flow.*` builtins are
    /// registered idempotently.
    pub fn new(registry: Arc<ModuleRegistry>) -> Result<Self, RegistryError> {
        register_flow_builtins(&registry)?;
        Ok(Self {
            registry,
            executions: Arc::new(DashMap::new()),
        })
    }

    /// The registry this engine dispatches against.
    #[must_use]
    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    // ── Validation ──────────────────────────────────────────────────

    /// Validate a workflow: structural rules plus registry-aware checks
    /// (module existence, start capability, port compatibility). Pure —
    /// no step runs.
    #[must_use]
    pub fn validate(&self, workflow: &Workflow) -> ValidationReport {
        let mut report = aster_workflow::validate(workflow);
        let snapshot = self.registry.snapshot();

        for (i, node) in workflow.nodes().iter().enumerate() {
            if !snapshot.contains(&node.module) {
                report.issues.push(ValidationIssue {
                    code: ErrorCode::NotFound,
                    path: format!("nodes[{i}].module"),
                    message: format!("module {} is not registered", node.module),
                });
            }
        }

        if let Ok(graph) = DependencyGraph::from_workflow(workflow) {
            for node in graph.entry_nodes() {
                let Some(step) = workflow.node(&node) else {
                    continue;
                };
                if step.module.as_str() == "flow.error_workflow_trigger" {
                    continue;
                }
                if let Ok(metadata) = snapshot.metadata(&step.module) {
                    if !metadata.effective_can_be_start() {
                        report.issues.push(ValidationIssue {
                            code: ErrorCode::InvalidStartNode,
                            path: format!("nodes.{node}"),
                            message: format!("module {} cannot start a workflow", step.module),
                        });
                    }
                }
            }
        }

        for (i, edge) in workflow.edges().iter().enumerate() {
            if edge.semantics.is_some() {
                continue; // control-flow ports are validated by semantics
            }
            let (Some(source), Some(target)) = (
                workflow.node(&edge.source_node),
                workflow.node(&edge.target_node),
            ) else {
                continue;
            };
            if !snapshot.contains(&source.module) || !snapshot.contains(&target.module) {
                continue;
            }
            match snapshot.can_connect(
                &source.module,
                &edge.source_port,
                &target.module,
                &edge.target_port,
            ) {
                Ok(ConnectVerdict::Ok) | Err(_) => {}
                Ok(ConnectVerdict::IncompatibleType) => {
                    report.issues.push(ValidationIssue {
                        code: ErrorCode::TypeMismatch,
                        path: format!("edges[{i}]"),
                        message: format!(
                            "{}.{} cannot feed {}.{}",
                            edge.source_node, edge.source_port, edge.target_node, edge.target_port
                        ),
                    });
                }
                Ok(ConnectVerdict::PortNotFound) => {
                    report.issues.push(ValidationIssue {
                        code: ErrorCode::PortNotFound,
                        path: format!("edges[{i}]"),
                        message: format!(
                            "port {}.{} or {}.{} does not exist",
                            edge.source_node, edge.source_port, edge.target_node, edge.target_port
                        ),
                    });
                }
            }
        }

        report
    }

    // ── Execution ───────────────────────────────────────────────────

    /// Execute a workflow to completion (blocking the caller's task).
    pub async fn execute(
        &self,
        workflow: Workflow,
        inputs: serde_json::Map<String, Value>,
        options: ExecuteOptions,
    ) -> Result<ExecutionResult, EngineError> {
        self.execute_with_sink(workflow, inputs, options, EventSink::trace_only())
            .await
    }

    /// Execute a child workflow for `flow.invoke` / `flow.subflow`.
    pub(crate) async fn execute_child(
        &self,
        workflow: Workflow,
        inputs: serde_json::Map<String, Value>,
        parent: ExecutionId,
    ) -> Result<ExecutionResult, EngineError> {
        self.execute(
            workflow,
            inputs,
            ExecuteOptions {
                parent: Some(parent),
                ..ExecuteOptions::default()
            },
        )
        .await
    }

    /// Execute while streaming events to a subscriber.
    ///
    /// Returns the execution id and the event stream; the execution runs
    /// on a spawned task.
    pub fn execute_stream(
        &self,
        workflow: Workflow,
        inputs: serde_json::Map<String, Value>,
        options: ExecuteOptions,
    ) -> Result<(ExecutionId, UnboundedReceiverStream<EngineEvent>), EngineError> {
        let report = self.validate(&workflow);
        if !report.is_ok() {
            return Err(EngineError::validation(report));
        }

        let execution_id = ExecutionId::v4();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let engine = self.clone();
        tokio::spawn(async move {
            let sink = EventSink::with_subscriber(tx);
            let _ = engine
                .execute_prepared(workflow, inputs, options, sink, Some(execution_id))
                .await;
        });
        Ok((execution_id, UnboundedReceiverStream::new(rx)))
    }

    async fn execute_with_sink(
        &self,
        workflow: Workflow,
        inputs: serde_json::Map<String, Value>,
        options: ExecuteOptions,
        sink: EventSink,
    ) -> Result<ExecutionResult, EngineError> {
        let report = self.validate(&workflow);
        if !report.is_ok() {
            return Err(EngineError::validation(report));
        }
        self.execute_prepared(workflow, inputs, options, sink, None)
            .await
    }

    async fn execute_prepared(
        &self,
        workflow: Workflow,
        inputs: serde_json::Map<String, Value>,
        options: ExecuteOptions,
        sink: EventSink,
        execution_id: Option<ExecutionId>,
    ) -> Result<ExecutionResult, EngineError> {
        let workflow = Arc::new(workflow);
        let graph = DependencyGraph::from_workflow(&workflow)?;
        let execution_id = execution_id.unwrap_or_else(ExecutionId::v4);

        let params = resolve_inputs(&workflow, &inputs)?;
        let ctx = Arc::new(build_context(&workflow, execution_id, params, &options));
        let control = Arc::new(ControlState::new());

        let handle = Arc::new(ExecutionHandle {
            workflow: workflow.clone(),
            control: control.clone(),
            ctx: RwLock::new(ctx.clone()),
            past_traces: RwLock::new(Vec::new()),
            result: RwLock::new(None),
            generation: AtomicU32::new(0),
        });
        self.executions.insert(execution_id, handle.clone());

        info!(execution = %execution_id, workflow = %workflow.name, "execution starting");
        let started = Instant::now();
        let ctx_for_run = ctx.clone();
        ctx_for_run.transition_status(ExecutionStatus::Running)?;

        let invoker = Arc::new(ModuleInvoker::new(self.registry.snapshot()));
        let scheduler = Scheduler::new(
            self,
            workflow.clone(),
            graph,
            ctx.clone(),
            invoker,
            sink,
            control,
            ReplaySeed::default(),
        );

        let outcome = run_with_deadline(scheduler, &workflow, &ctx).await;
        let result = build_result(&workflow, &ctx, execution_id, outcome, started.elapsed());
        *handle.result.write() = Some(result.clone());
        info!(execution = %execution_id, status = %result.status, "execution finished");
        Ok(result)
    }

    // ── Control ─────────────────────────────────────────────────────

    /// Request cancellation; idempotent.
    pub fn cancel(&self, execution_id: ExecutionId) -> Result<(), EngineError> {
        let handle = self.handle(execution_id)?;
        handle.ctx.read().cancellation.cancel();
        Ok(())
    }

    /// Request a pause at the next cycle boundary; idempotent.
    pub fn pause(&self, execution_id: ExecutionId) -> Result<(), EngineError> {
        self.handle(execution_id)?.control.pause();
        Ok(())
    }

    /// Clear a pause; idempotent. Does not resolve breakpoints.
    pub fn resume(&self, execution_id: ExecutionId) -> Result<(), EngineError> {
        self.handle(execution_id)?.control.resume();
        Ok(())
    }

    /// Resolve a waiting `flow.breakpoint` with an approval payload
    /// (`{"approved": bool, ...custom inputs}`).
    pub fn resolve_breakpoint(
        &self,
        execution_id: ExecutionId,
        resolution: Value,
    ) -> Result<(), EngineError> {
        let handle = self.handle(execution_id)?;
        if handle.control.resolve_breakpoint(resolution) {
            Ok(())
        } else {
            Err(EngineError::InvalidState(
                "no breakpoint is waiting".into(),
            ))
        }
    }

    // ── Inspection ──────────────────────────────────────────────────

    /// The (current-generation) trace of an execution.
    pub fn trace(&self, execution_id: ExecutionId) -> Result<TraceLog, EngineError> {
        Ok(self.handle(execution_id)?.ctx.read().trace())
    }

    /// Traces of every earlier replay generation.
    pub fn past_traces(&self, execution_id: ExecutionId) -> Result<Vec<TraceLog>, EngineError> {
        Ok(self.handle(execution_id)?.past_traces.read().clone())
    }

    /// The evidence log of an execution.
    pub fn evidence(&self, execution_id: ExecutionId) -> Result<EvidenceLog, EngineError> {
        Ok(self.handle(execution_id)?.ctx.read().evidence())
    }

    /// The stored result of a finished execution.
    pub fn result(&self, execution_id: ExecutionId) -> Result<Option<ExecutionResult>, EngineError> {
        Ok(self.handle(execution_id)?.result.read().clone())
    }

    /// Variable-catalog introspection for one node.
    ///
    /// Runtime mode requires the execution whose observations to use.
    pub fn introspect(
        &self,
        workflow: &Workflow,
        node: &NodeId,
        mode: IntrospectMode,
        execution_id: Option<ExecutionId>,
    ) -> Result<VarCatalog, EngineError> {
        let graph = DependencyGraph::from_workflow(workflow)?;
        let snapshot = self.registry.snapshot();
        match mode {
            IntrospectMode::Edit => Ok(introspect::edit_catalog(
                workflow, &graph, &snapshot, node,
            )),
            IntrospectMode::Runtime => {
                let execution_id = execution_id.ok_or_else(|| {
                    EngineError::InvalidState("runtime introspection needs an execution".into())
                })?;
                let handle = self.handle(execution_id)?;
                let ctx = handle.ctx.read().clone();
                Ok(introspect::runtime_catalog(
                    workflow, &graph, &snapshot, node, &ctx,
                ))
            }
        }
    }

    /// The public or internal module catalog (tiered form is available via
    /// [`aster_registry::catalog_tiered`] over [`Engine::registry`]).
    #[must_use]
    pub fn catalog(&self, view: CatalogView) -> Vec<aster_registry::CatalogEntry> {
        aster_registry::catalog_flat(&self.registry.snapshot(), view)
    }

    // ── Replay ──────────────────────────────────────────────────────

    /// Replay a finished execution from a chosen step.
    ///
    /// The context is rebuilt from the target's `context_before` evidence;
    /// outputs of the target and everything downstream are erased; events
    /// land in a fresh trace generation keyed
    /// `(execution_id, replay_generation)`. A foreach target restarts
    /// whole unless `iteration` names the iteration to resume from, in
    /// which case earlier iterations are seeded from the original
    /// aggregate.
    pub async fn replay_from(
        &self,
        execution_id: ExecutionId,
        node: &NodeId,
        iteration: Option<usize>,
    ) -> Result<ExecutionResult, EngineError> {
        let handle = self.handle(execution_id)?;
        if handle.result.read().is_none() {
            return Err(EngineError::InvalidState(
                "execution has not finished; replay needs a terminal run".into(),
            ));
        }
        let workflow = handle.workflow.clone();
        let graph = DependencyGraph::from_workflow(&workflow)?;
        if workflow.node(node).is_none() {
            return Err(EngineError::Replay(format!("unknown node {node}")));
        }

        let old_ctx = handle.ctx.read().clone();
        let evidence = old_ctx.evidence();
        let record = match iteration {
            Some(index) => evidence.iteration_for(node, index),
            None => evidence.latest_for(node),
        }
        .ok_or_else(|| {
            EngineError::Replay(format!("no evidence recorded for node {node}"))
        })?
        .clone();

        // Foreach resume: seed earlier iterations from the original
        // aggregate (collect mode keeps them as an array).
        let resume = iteration.map(|index| {
            let seed = old_ctx
                .step_output(node)
                .map(|result| match result.data {
                    Value::Array(items) => items.into_iter().take(index).collect(),
                    _ => Vec::new(),
                })
                .unwrap_or_default();
            ForeachResume {
                start_iteration: index,
                seed,
            }
        });

        let generation = handle.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let params = ExecutionContext::snapshot_params(&record.context_before);
        let ctx = Arc::new(
            ExecutionContext::new(
                execution_id,
                old_ctx.workflow_id.clone(),
                old_ctx.workflow_name.clone(),
            )
            .with_params(params)
            .with_env(old_ctx.env().clone())
            .with_aliases(alias_map(&workflow))
            .with_trace_generation(generation),
        );
        ctx.restore(&record.context_before)?;

        // Erase the target and its downstream so they re-execute.
        let mut erase: Vec<NodeId> = graph.downstream_of(node).into_iter().collect();
        erase.push(node.clone());
        ctx.erase_step_outputs(erase.iter());

        handle.past_traces.write().push(old_ctx.trace());
        *handle.ctx.write() = ctx.clone();

        info!(execution = %execution_id, target = %node, generation, "replay starting");
        let started = Instant::now();
        ctx.transition_status(ExecutionStatus::Running)?;

        let invoker = Arc::new(ModuleInvoker::new(self.registry.snapshot()));
        let scheduler = Scheduler::new(
            self,
            workflow.clone(),
            graph,
            ctx.clone(),
            invoker,
            EventSink::trace_only(),
            handle.control.clone(),
            ReplaySeed {
                target: Some(node.clone()),
                resume,
            },
        );

        let outcome = run_with_deadline(scheduler, &workflow, &ctx).await;
        let result = build_result(&workflow, &ctx, execution_id, outcome, started.elapsed());
        *handle.result.write() = Some(result.clone());
        Ok(result)
    }

    // ── Hot reload ──────────────────────────────────────────────────

    /// Hot-reload the module catalog: drain plugin processes, clear the
    /// registry, re-register (builtins included), and bump the catalog
    /// version. Executions started earlier keep their snapshots.
    pub async fn hot_reload<F>(
        &self,
        plugin_manager: &aster_plugin::PluginManager,
        register: F,
    ) -> Result<u64, EngineError>
    where
        F: FnOnce(&ModuleRegistry) -> Result<(), RegistryError>,
    {
        plugin_manager.unload_all("hot reload").await;
        self.registry.clear();
        register_flow_builtins(&self.registry)?;
        register(&self.registry)?;
        let version = self.registry.bump_catalog_version();
        info!(version, "module catalog reloaded");
        Ok(version)
    }

    fn handle(&self, execution_id: ExecutionId) -> Result<Arc<ExecutionHandle>, EngineError> {
        self.executions
            .get(&execution_id)
            .map(|entry| entry.value().clone())
            .ok_or(EngineError::ExecutionNotFound(execution_id))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("modules", &self.registry.len())
            .field("executions", &self.executions.len())
            .finish()
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn alias_map(workflow: &Workflow) -> HashMap<String, NodeId> {
    workflow
        .nodes()
        .iter()
        .filter_map(|n| n.output.clone().map(|alias| (alias, n.id.clone())))
        .collect()
}

fn resolve_inputs(
    workflow: &Workflow,
    inputs: &serde_json::Map<String, Value>,
) -> Result<serde_json::Map<String, Value>, EngineError> {
    let mut params = serde_json::Map::new();
    for decl in &workflow.params {
        let value = decl
            .check(inputs.get(&decl.name))
            .map_err(EngineError::InvalidInputs)?;
        if !value.is_null() {
            params.insert(decl.name.clone(), value);
        }
    }
    // Undeclared inputs pass through untouched.
    for (name, value) in inputs {
        if !params.contains_key(name) && !workflow.params.iter().any(|d| &d.name == name) {
            params.insert(name.clone(), value.clone());
        }
    }
    Ok(params)
}

fn build_context(
    workflow: &Workflow,
    execution_id: ExecutionId,
    params: serde_json::Map<String, Value>,
    options: &ExecuteOptions,
) -> ExecutionContext {
    let workflow_id = workflow
        .id
        .clone()
        .unwrap_or_else(|| format!("wf-{execution_id}"));
    let env: BTreeMap<String, String> = std::env::vars()
        .filter(|(name, _)| workflow.config.env_allowlist.iter().any(|a| a == name))
        .collect();

    let mut ctx = ExecutionContext::new(execution_id, workflow_id, workflow.name.clone())
        .with_params(params)
        .with_env(env)
        .with_aliases(alias_map(workflow));
    if let Some(parent) = options.parent {
        ctx = ctx.with_parent(parent);
    }
    for (handle, secret) in &options.secrets {
        ctx.put_secret(handle.clone(), secret.clone());
    }
    ctx
}

async fn run_with_deadline(
    scheduler: Scheduler<'_>,
    workflow: &Workflow,
    ctx: &Arc<ExecutionContext>,
) -> crate::scheduler::SchedulerOutcome {
    let run = scheduler.run();
    tokio::pin!(run);
    match workflow.config.timeout_ms {
        Some(deadline_ms) => {
            tokio::select! {
                outcome = &mut run => outcome,
                () = tokio::time::sleep(Duration::from_millis(deadline_ms)) => {
                    ctx.cancellation.cancel();
                    run.await
                }
            }
        }
        None => run.await,
    }
}

fn build_result(
    workflow: &Workflow,
    ctx: &Arc<ExecutionContext>,
    execution_id: ExecutionId,
    outcome: crate::scheduler::SchedulerOutcome,
    duration: Duration,
) -> ExecutionResult {
    let step_outputs: BTreeMap<String, StepResult> = ctx
        .completed_nodes()
        .into_iter()
        .filter_map(|node| ctx.step_output(&node).map(|r| (node.to_string(), r)))
        .collect();

    let output = if outcome.status == ExecutionStatus::Completed {
        evaluate_output_mapping(workflow, ctx)
    } else {
        serde_json::Map::new()
    };

    ExecutionResult {
        execution_id,
        status: outcome.status,
        output,
        step_outputs,
        failure: outcome.failure,
        duration,
    }
}

fn evaluate_output_mapping(
    workflow: &Workflow,
    ctx: &Arc<ExecutionContext>,
) -> serde_json::Map<String, Value> {
    let outputs_view = ctx.outputs_view();
    let eval = EvalContext::new(
        ctx.params(),
        ctx.env(),
        &ctx.workflow_id,
        &ctx.workflow_name,
        &outputs_view,
    );
    let mut output = serde_json::Map::new();
    for (name, expr) in &workflow.output {
        let value = Template::parse(expr.as_str())
            .and_then(|t| t.resolve(&eval))
            .unwrap_or(Value::Null);
        output.insert(name.clone(), value);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_builds_with_builtins() {
        let registry = Arc::new(ModuleRegistry::new());
        let engine = Engine::new(registry).unwrap();
        assert!(engine
            .registry()
            .get(&"flow.branch".parse().unwrap())
            .is_ok());
    }

    #[test]
    fn unknown_module_fails_validation() {
        let engine = Engine::new(Arc::new(ModuleRegistry::new())).unwrap();
        let workflow = Workflow::from_yaml(
            "name: w\nsteps:\n  - {id: a, module: ghost.module}\n",
        )
        .unwrap();
        let report = engine.validate(&workflow);
        assert!(!report.is_ok());
        assert_eq!(report.with_code(ErrorCode::NotFound).len(), 1);
    }

    #[test]
    fn unknown_execution_lookups_fail() {
        let engine = Engine::new(Arc::new(ModuleRegistry::new())).unwrap();
        let ghost = ExecutionId::v4();
        assert!(matches!(
            engine.cancel(ghost),
            Err(EngineError::ExecutionNotFound(_))
        ));
        assert!(engine.trace(ghost).is_err());
    }
}
