//! Step executor.
//!
//! For one ready step: resolve parameters against the public context,
//! short-circuit on a falsy guard, validate against the module schema,
//! enforce the timeout budget, drive retry with backoff, and run foreach
//! iterations. The scheduler owns the evidence bracket and output
//! recording around this.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use aster_core::ModuleId;
use aster_error::StepError;
use aster_execution::{EngineEvent, EventKind, Evidence, ExecutionContext, StepResult};
use aster_expression::{resolve_value, EvalContext, Template};
use aster_registry::{
    redact_secret_params, validate_params, InvokeContext, ModuleCall, ModuleMetadata,
};
use aster_workflow::{OnError, OutputMode, StepDef, Workflow};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::debug;

use crate::builtins::condition;
use crate::events::EventSink;
use crate::invoker::ModuleInvoker;

/// Engine-default step timeout when nothing narrower is configured.
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 300_000;

/// Resume point for replaying a foreach from a specific iteration.
#[derive(Debug, Clone, Default)]
pub struct ForeachResume {
    /// First iteration to actually run.
    pub start_iteration: usize,
    /// Seeded per-iteration aggregate entries for skipped iterations.
    pub seed: Vec<Value>,
}

/// Executes individual steps for one execution.
pub struct StepExecutor<'a> {
    workflow: &'a Workflow,
    ctx: &'a ExecutionContext,
    invoker: &'a ModuleInvoker,
    events: &'a EventSink,
}

impl<'a> StepExecutor<'a> {
    /// Build an executor bound to one execution.
    #[must_use]
    pub fn new(
        workflow: &'a Workflow,
        ctx: &'a ExecutionContext,
        invoker: &'a ModuleInvoker,
        events: &'a EventSink,
    ) -> Self {
        Self {
            workflow,
            ctx,
            invoker,
            events,
        }
    }

    /// Execute one step to its final outcome (guard, retries and foreach
    /// included).
    pub async fn execute(&self, step: &StepDef) -> StepResult {
        self.execute_with_resume(step, None).await
    }

    /// Execute one step, optionally resuming a foreach mid-way (replay).
    pub async fn execute_with_resume(
        &self,
        step: &StepDef,
        resume: Option<ForeachResume>,
    ) -> StepResult {
        // 1. Guard.
        match self.guard_allows(step) {
            Ok(true) => {}
            Ok(false) => {
                debug!(node = %step.id, "guard skipped step");
                return StepResult::skipped();
            }
            Err(err) => return StepResult::failure(err),
        }

        let started = Instant::now();
        let mut result = if step.foreach.is_some() {
            self.run_foreach(step, resume.unwrap_or_default()).await
        } else {
            self.run_with_retry(step, &BTreeMap::new()).await
        };
        result.meta.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    fn eval_context<'b>(
        &'b self,
        outputs: &'b serde_json::Map<String, Value>,
        locals: &BTreeMap<String, Value>,
    ) -> EvalContext<'b> {
        let workflow_id = self.ctx.workflow_id.as_str();
        let mut eval = EvalContext::new(
            self.ctx.params(),
            self.ctx.env(),
            workflow_id,
            &self.ctx.workflow_name,
            outputs,
        );
        if self.workflow.config.strict_variables {
            eval = eval.strict();
        }
        for (name, value) in locals {
            eval = eval.with_local(name.clone(), value.clone());
        }
        eval
    }

    fn guard_allows(&self, step: &StepDef) -> Result<bool, StepError> {
        let Some(when) = &step.when else {
            return Ok(true);
        };
        let outputs = self.ctx.outputs_view();
        let eval = self.eval_context(&outputs, &BTreeMap::new());
        let template =
            Template::parse(when.as_str()).map_err(|e| StepError::validation(e.to_string()))?;
        let value = template
            .resolve(&eval)
            .map_err(|e| StepError::validation(e.to_string()))?;
        Ok(condition::evaluate(&value))
    }

    // ── foreach ─────────────────────────────────────────────────────

    async fn run_foreach(&self, step: &StepDef, resume: ForeachResume) -> StepResult {
        let iterable = match self.resolve_iterable(step) {
            Ok(items) => items,
            Err(err) => return StepResult::failure(err),
        };

        let mut aggregate: Vec<Value> = resume.seed;
        let mut last: Option<Value> = None;
        let total = iterable.len();

        for (index, item) in iterable.into_iter().enumerate() {
            if index < resume.start_iteration {
                continue;
            }
            if self.ctx.check_cancelled().is_err() {
                return StepResult::cancelled();
            }

            let mut locals = BTreeMap::new();
            locals.insert(step.iter_var.clone(), item);
            locals.insert("index".to_owned(), json!(index));

            let before = self.ctx.snapshot();
            let iteration_started = Utc::now();
            let result = self.run_with_retry(step, &locals).await;
            self.ctx.append_evidence(
                Evidence::new(
                    step.id.clone(),
                    before,
                    self.ctx.snapshot(),
                    iteration_started,
                    Utc::now(),
                )
                .for_iteration(index),
            );
            self.events.emit(
                self.ctx,
                EngineEvent::now(EventKind::PartialOutput, self.ctx.execution_id)
                    .with_node(step.id.clone())
                    .with_payload(json!({
                        "iteration": index,
                        "of": total,
                        "ok": result.ok,
                    })),
            );

            if !result.ok {
                match step.on_error {
                    OnError::Fail | OnError::Goto => {
                        // Goto is resolved by the scheduler from the final
                        // outcome; inside the loop it ends iteration.
                        return result;
                    }
                    OnError::Continue => {
                        aggregate.push(json!({
                            "ok": false,
                            "error": result.error,
                            "error_code": result.error_code,
                        }));
                        continue;
                    }
                    OnError::Skip => continue,
                }
            }

            last = Some(result.data.clone());
            aggregate.push(json!({"ok": true, "data": result.data}));
        }

        let data = match step.output_mode {
            OutputMode::Collect => Value::Array(aggregate),
            OutputMode::Last => last.unwrap_or(Value::Null),
            OutputMode::None => Value::Null,
        };
        StepResult::success(data)
    }

    fn resolve_iterable(&self, step: &StepDef) -> Result<Vec<Value>, StepError> {
        let expr = step.foreach.as_deref().unwrap_or_default();
        let outputs = self.ctx.outputs_view();
        let eval = self.eval_context(&outputs, &BTreeMap::new());
        let template =
            Template::parse(expr).map_err(|e| StepError::validation(e.to_string()))?;
        let value = template
            .resolve(&eval)
            .map_err(|e| StepError::validation(e.to_string()))?;
        match value {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            other => Err(StepError::validation(format!(
                "foreach expects an array, got {other}"
            ))
            .with_field("foreach")),
        }
    }

    // ── single step with retry ──────────────────────────────────────

    async fn run_with_retry(
        &self,
        step: &StepDef,
        locals: &BTreeMap<String, Value>,
    ) -> StepResult {
        let metadata = self
            .invoker
            .snapshot()
            .metadata(&step.module)
            .unwrap_or_else(|_| placeholder_metadata(&step.module));

        // Resolve and validate once; the public context does not change
        // between attempts.
        let resolved = match self.resolve_params(step, locals) {
            Ok(resolved) => resolved,
            Err(err) => return StepResult::failure(err),
        };
        let canonical = match validate_params(&metadata.params_schema, &resolved) {
            Ok(canonical) => canonical,
            Err(err) => return StepResult::failure(err),
        };
        debug!(
            node = %step.id,
            module = %step.module,
            params = ?redact_secret_params(&metadata.params_schema, &canonical),
            "invoking module"
        );

        let budget = effective_timeout(step, &metadata, self.workflow);
        let retry_on = step
            .retry
            .as_ref()
            .map(|r| r.retry_on.clone())
            .unwrap_or_default();
        let extra_attempts = step
            .retry
            .as_ref()
            .map(|r| r.count.min(metadata.execution.max_retries))
            .unwrap_or(0);

        let mut attempts = 0;
        loop {
            attempts += 1;
            if self.ctx.check_cancelled().is_err() {
                let mut result = StepResult::cancelled();
                result.meta.attempts = attempts;
                return result;
            }

            let call = self.build_call(&metadata, canonical.clone(), budget);
            let attempt_started = Instant::now();
            let mut result = self.invoke_bounded(&step.module, call, budget).await;
            result.meta.attempts = attempts;
            result.meta.duration_ms = attempt_started.elapsed().as_millis() as u64;

            if result.ok {
                return result;
            }

            let retryable = result
                .as_error()
                .is_some_and(|e| e.is_retryable(metadata.execution.retryable, &retry_on));
            if !retryable || attempts > extra_attempts {
                return result;
            }

            let delay = step
                .retry
                .as_ref()
                .map(|r| r.delay_before_retry(attempts - 1))
                .unwrap_or_default();
            debug!(node = %step.id, attempt = attempts, ?delay, "retrying step");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.ctx.cancellation.cancelled() => {
                    let mut result = StepResult::cancelled();
                    result.meta.attempts = attempts;
                    return result;
                }
            }
        }
    }

    fn resolve_params(
        &self,
        step: &StepDef,
        locals: &BTreeMap<String, Value>,
    ) -> Result<serde_json::Map<String, Value>, StepError> {
        let outputs = self.ctx.outputs_view();
        let eval = self.eval_context(&outputs, locals);
        let mut resolved = serde_json::Map::new();
        for (name, value) in &step.params {
            let value = resolve_value(value, &eval).map_err(|e| {
                StepError::validation(e.to_string()).with_field(name.clone())
            })?;
            resolved.insert(name.clone(), value);
        }
        Ok(resolved)
    }

    fn build_call(
        &self,
        metadata: &ModuleMetadata,
        params: serde_json::Map<String, Value>,
        budget: Option<Duration>,
    ) -> ModuleCall {
        let mut context = InvokeContext::new(
            self.ctx.execution_id,
            self.ctx.workflow_id.clone(),
            self.ctx.workflow_name.clone(),
        )
        .with_public(self.ctx.snapshot().public);

        // Resolved secrets travel only to modules that declared the need.
        if metadata.security.requires_credentials {
            for handle in self.ctx.secret_handles() {
                if let Some(value) = self.ctx.reveal_secret(&handle) {
                    context = context.with_credential(handle, value);
                }
            }
        }

        ModuleCall::new(params, context)
            .with_timeout_ms(budget.map_or(0, |d| d.as_millis() as u64))
    }

    async fn invoke_bounded(
        &self,
        module: &ModuleId,
        call: ModuleCall,
        budget: Option<Duration>,
    ) -> StepResult {
        let invocation = self.invoker.invoke(module, call);
        tokio::select! {
            () = self.ctx.cancellation.cancelled() => StepResult::cancelled(),
            result = async {
                match budget {
                    Some(limit) => match tokio::time::timeout(limit, invocation).await {
                        Ok(result) => result,
                        Err(_) => StepResult::failure(StepError::timeout(format!(
                            "step exceeded its {}ms budget",
                            limit.as_millis()
                        ))),
                    },
                    None => invocation.await,
                }
            } => result,
        }
    }
}

/// The executor's per-attempt time budget:
/// `min(step.timeout, module.timeout_ms, workflow.config.timeout_ms, 300s)`,
/// with `timeout: 0` disabling the executor-level limit entirely.
#[must_use]
pub fn effective_timeout(
    step: &StepDef,
    metadata: &ModuleMetadata,
    workflow: &Workflow,
) -> Option<Duration> {
    if step.timeout == Some(0) {
        return None;
    }
    let mut budget = DEFAULT_STEP_TIMEOUT_MS;
    if let Some(step_timeout) = step.timeout {
        budget = budget.min(step_timeout);
    }
    if metadata.execution.timeout_ms > 0 {
        budget = budget.min(metadata.execution.timeout_ms);
    }
    if let Some(workflow_timeout) = workflow.config.timeout_ms {
        budget = budget.min(workflow_timeout);
    }
    Some(Duration::from_millis(budget))
}

fn placeholder_metadata(module: &ModuleId) -> ModuleMetadata {
    ModuleMetadata::new(module.as_str(), module.as_str(), "unregistered module")
}
