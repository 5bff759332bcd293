//! Event-driven scheduler and edge router.
//!
//! The scheduler walks the workflow graph by reacting to step completion
//! events. Every node's outgoing edges are in one of three states —
//! pending, delivered, or dead — and a node becomes ready when none of
//! its inputs are pending and at least one was delivered. Control-flow
//! constructs that emit more than once over time (loop, foreach, goto,
//! merge, join, breakpoint, invoke, error trigger) are driven here
//! directly; everything else dispatches through the executor and invoker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use aster_core::{NodeId, PortSemantics};
use aster_error::{ErrorCode, StepError};
use aster_execution::{
    ContextSnapshot, EngineEvent, EventKind, Evidence, ExecutionContext, ExecutionStatus,
    StepResult,
};
use aster_expression::{resolve_value, EvalContext};
use aster_workflow::{DependencyGraph, OnError, OutputMode, StepDef, Workflow};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::builtins::{is_scheduler_managed, META_PORT, META_PORTS};
use crate::control::ControlState;
use crate::engine::Engine;
use crate::events::EventSink;
use crate::executor::{ForeachResume, StepExecutor};
use crate::invoker::ModuleInvoker;

/// Edge delivery state.
#[derive(Debug, Clone)]
enum EdgeState {
    Pending,
    Delivered(Value),
    Dead,
}

impl EdgeState {
    fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    fn delivered(&self) -> Option<&Value> {
        match self {
            Self::Delivered(value) => Some(value),
            _ => None,
        }
    }
}

/// Node scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeRun {
    Waiting,
    Enqueued,
    Running,
    Done,
    Dead,
}

#[derive(Debug)]
struct Ready {
    node: NodeId,
    payload: Value,
}

struct Finished {
    node: NodeId,
    payload: Value,
    before: ContextSnapshot,
    started: DateTime<Utc>,
    result: StepResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeStrategy {
    All,
    Any,
    Race,
    Count(usize),
}

impl MergeStrategy {
    fn parse(value: Option<&Value>) -> Self {
        match value.and_then(Value::as_str) {
            Some("any") => Self::Any,
            Some("race") => Self::Race,
            Some(other) => other
                .strip_prefix("count:")
                .and_then(|k| k.parse().ok())
                .map_or(Self::All, Self::Count),
            None => Self::All,
        }
    }
}

struct MergeState {
    strategy: MergeStrategy,
    received: Vec<Value>,
    before: Option<ContextSnapshot>,
    started_at: Option<DateTime<Utc>>,
    deadline: Option<tokio::time::Instant>,
    fired: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    Times(usize),
    Foreach,
}

struct LoopState {
    kind: LoopKind,
    items: Vec<Value>,
    index: usize,
    collected: Vec<Value>,
    iter_var: String,
    output_mode: OutputMode,
    before: ContextSnapshot,
    started_at: DateTime<Utc>,
}

/// How a run ended, before output mapping.
#[derive(Debug)]
pub struct SchedulerOutcome {
    /// Terminal status reached.
    pub status: ExecutionStatus,
    /// The failure that terminated the run, if any.
    pub failure: Option<StepError>,
}

/// Seed for resuming from a replay target.
#[derive(Debug, Clone, Default)]
pub struct ReplaySeed {
    /// The node to resume from.
    pub target: Option<NodeId>,
    /// Foreach resume point for the target.
    pub resume: Option<ForeachResume>,
}

pub(crate) struct Scheduler<'e> {
    engine: &'e Engine,
    workflow: Arc<Workflow>,
    graph: DependencyGraph,
    ctx: Arc<ExecutionContext>,
    invoker: Arc<ModuleInvoker>,
    events: EventSink,
    control: Arc<ControlState>,
    edge_states: Vec<EdgeState>,
    node_states: HashMap<NodeId, NodeRun>,
    merge_states: HashMap<NodeId, MergeState>,
    loop_states: HashMap<NodeId, LoopState>,
    goto_count: u32,
    queue: VecDeque<Ready>,
    join_set: JoinSet<Finished>,
    semaphore: Arc<Semaphore>,
    replay: ReplaySeed,
    failure: Option<StepError>,
    cancelled: bool,
}

impl<'e> Scheduler<'e> {
    pub(crate) fn new(
        engine: &'e Engine,
        workflow: Arc<Workflow>,
        graph: DependencyGraph,
        ctx: Arc<ExecutionContext>,
        invoker: Arc<ModuleInvoker>,
        events: EventSink,
        control: Arc<ControlState>,
        replay: ReplaySeed,
    ) -> Self {
        let edge_states = vec![EdgeState::Pending; workflow.edges().len()];
        let node_states = workflow
            .nodes()
            .iter()
            .map(|n| (n.id.clone(), NodeRun::Waiting))
            .collect();
        let max_parallel = workflow.config.max_parallel.max(1);
        Self {
            engine,
            workflow,
            graph,
            ctx,
            invoker,
            events,
            control,
            edge_states,
            node_states,
            merge_states: HashMap::new(),
            loop_states: HashMap::new(),
            goto_count: 0,
            queue: VecDeque::new(),
            join_set: JoinSet::new(),
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            replay,
            failure: None,
            cancelled: false,
        }
    }

    // ── Main loop ───────────────────────────────────────────────────

    pub(crate) async fn run(mut self) -> SchedulerOutcome {
        self.events.emit(
            &self.ctx,
            EngineEvent::now(EventKind::EngineStart, self.ctx.execution_id),
        );

        if self.replay.target.is_some() {
            self.seed_replay();
        } else {
            self.seed_entries();
        }

        loop {
            if self.ctx.cancellation.is_cancelled() {
                self.cancelled = true;
                break;
            }
            if self.control.is_paused() {
                self.enter_pause().await;
                if self.cancelled {
                    break;
                }
            }

            while let Some(ready) = self.queue.pop_front() {
                self.dispatch(ready).await;
                if self.failure.is_some() || self.cancelled {
                    break;
                }
            }
            if self.failure.is_some() || self.cancelled {
                break;
            }

            let deadline = self.next_merge_deadline();
            if self.join_set.is_empty() && self.queue.is_empty() && deadline.is_none() {
                break;
            }
            if !self.queue.is_empty() {
                continue;
            }

            enum Wake {
                Finished(Option<Result<Finished, tokio::task::JoinError>>),
                MergeDeadline,
                Cancelled,
            }
            let wake = tokio::select! {
                joined = self.join_set.join_next(), if !self.join_set.is_empty() => {
                    Wake::Finished(joined)
                }
                () = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                }, if deadline.is_some() => Wake::MergeDeadline,
                () = self.ctx.cancellation.cancelled() => Wake::Cancelled,
            };
            match wake {
                Wake::Finished(Some(Ok(finished))) => self.process_finished(finished).await,
                Wake::Finished(Some(Err(join_err))) => {
                    warn!(?join_err, "step task panicked");
                    self.failure = Some(StepError::internal("step task panicked"));
                }
                Wake::Finished(None) => {}
                Wake::MergeDeadline => self.fire_merge_timeouts().await,
                Wake::Cancelled => {
                    self.cancelled = true;
                    break;
                }
            }
            if self.failure.is_some() {
                break;
            }
        }

        self.finalize().await
    }

    async fn enter_pause(&mut self) {
        if self
            .ctx
            .transition_status(ExecutionStatus::Paused)
            .is_ok()
        {
            self.events.emit(
                &self.ctx,
                EngineEvent::now(EventKind::Log, self.ctx.execution_id)
                    .with_payload(json!({"message": "execution paused"})),
            );
        }
        let resumed = tokio::select! {
            () = self.control.wait_resumed() => true,
            () = self.ctx.cancellation.cancelled() => false,
        };
        if resumed {
            let _ = self.ctx.transition_status(ExecutionStatus::Running);
        } else {
            self.cancelled = true;
        }
    }

    async fn finalize(mut self) -> SchedulerOutcome {
        self.join_set.abort_all();
        while self.join_set.join_next().await.is_some() {}

        let cancelled = self.cancelled
            || self
                .failure
                .as_ref()
                .is_some_and(|f| f.code == ErrorCode::Cancelled);
        let status = if cancelled {
            ExecutionStatus::Cancelled
        } else if self.failure.is_some() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };

        let _ = self.ctx.transition_status(status);
        let payload = match &self.failure {
            Some(error) => json!({"status": status, "error": error.message, "error_code": error.code}),
            None => json!({"status": status}),
        };
        if self.failure.is_some() {
            self.events.emit(
                &self.ctx,
                EngineEvent::now(EventKind::Error, self.ctx.execution_id)
                    .with_payload(payload.clone()),
            );
        }
        self.events.emit(
            &self.ctx,
            EngineEvent::now(EventKind::EngineEnd, self.ctx.execution_id).with_payload(payload),
        );

        SchedulerOutcome {
            status,
            failure: self.failure,
        }
    }

    // ── Seeding ─────────────────────────────────────────────────────

    fn seed_entries(&mut self) {
        for node in self.graph.entry_nodes() {
            let step = self.step(&node);
            // Error-subgraph entry points only activate on failure.
            if step.is_some_and(|s| s.module.as_str() == "flow.error_workflow_trigger") {
                continue;
            }
            self.enqueue(node, Value::Null);
        }
    }

    /// Reconstruct edge and node states from restored step outputs, then
    /// enqueue the replay target.
    fn seed_replay(&mut self) {
        let Some(target) = self.replay.target.clone() else {
            return;
        };
        let completed: HashSet<NodeId> = self.ctx.completed_nodes().into_iter().collect();

        for node in &completed {
            self.node_states.insert(node.clone(), NodeRun::Done);
        }

        let edges: Vec<(usize, NodeId, String, Option<PortSemantics>)> = self
            .workflow
            .edges()
            .iter()
            .enumerate()
            .map(|(i, e)| {
                (
                    i,
                    e.source_node.clone(),
                    e.source_port.clone(),
                    e.semantics.clone(),
                )
            })
            .collect();

        for (index, source, port, semantics) in edges {
            if !completed.contains(&source) {
                continue;
            }
            let result = self.ctx.step_output(&source);
            let Some(result) = result else { continue };
            let hint = result
                .meta
                .extra
                .get(META_PORT)
                .and_then(Value::as_str)
                .map(ToOwned::to_owned);
            let fan_out = result
                .meta
                .extra
                .get(META_PORTS)
                .and_then(Value::as_str)
                .is_some();
            let matches = match &hint {
                Some(hinted) => {
                    port == *hinted
                        || semantics.as_ref().is_some_and(|s| s.to_string() == *hinted)
                }
                None => fan_out || port == aster_core::DEFAULT_OUTPUT_PORT,
            };
            self.edge_states[index] = if matches {
                EdgeState::Delivered(result.data.clone())
            } else {
                EdgeState::Dead
            };
        }

        let payload = self.gather_input_payload(&target);
        self.enqueue(target, payload);
    }

    // ── Dispatch ────────────────────────────────────────────────────

    fn step(&self, node: &NodeId) -> Option<&StepDef> {
        self.workflow.node(node)
    }

    fn enqueue(&mut self, node: NodeId, payload: Value) {
        self.node_states.insert(node.clone(), NodeRun::Enqueued);
        self.queue.push_back(Ready { node, payload });
    }

    async fn dispatch(&mut self, ready: Ready) {
        let Some(step) = self.step(&ready.node).cloned() else {
            return;
        };
        self.node_states.insert(ready.node.clone(), NodeRun::Running);

        if is_scheduler_managed(&step.module) {
            self.dispatch_managed(&step, ready.payload).await;
            return;
        }

        let workflow = self.workflow.clone();
        let ctx = self.ctx.clone();
        let invoker = self.invoker.clone();
        let events = self.events.clone();
        let semaphore = self.semaphore.clone();
        let resume = (self.replay.target.as_ref() == Some(&step.id))
            .then(|| self.replay.resume.clone())
            .flatten();
        let payload = ready.payload;

        self.join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            let before = ctx.snapshot();
            let started = Utc::now();
            events.emit(
                &ctx,
                EngineEvent::now(EventKind::NodeStart, ctx.execution_id)
                    .with_node(step.id.clone()),
            );
            let executor = StepExecutor::new(&workflow, &ctx, &invoker, &events);
            let result = executor.execute_with_resume(&step, resume).await;
            Finished {
                node: step.id.clone(),
                payload,
                before,
                started,
                result,
            }
        });
    }

    async fn dispatch_managed(&mut self, step: &StepDef, payload: Value) {
        match step.module.as_str() {
            "flow.merge" | "flow.join" => {
                // Reached only when enqueued via plain readiness (single
                // input); treat as an immediate single-payload merge.
                self.merge_delivery(&step.id.clone(), payload).await;
            }
            "flow.loop" | "flow.foreach" => {
                self.loop_entry(step, payload).await;
            }
            "flow.goto" => self.run_goto(step, payload).await,
            "flow.breakpoint" => self.run_breakpoint(step, payload).await,
            "flow.invoke" | "flow.subflow" => self.run_subflow(step, payload).await,
            // Error triggers only run through route_error.
            _ => {}
        }
    }

    // ── Completion processing ───────────────────────────────────────

    async fn process_finished(&mut self, finished: Finished) {
        let step = match self.step(&finished.node) {
            Some(step) => step.clone(),
            None => return,
        };
        let mut result = finished.result;

        // flow.end without an explicit mapping forwards its input payload.
        if step.module.as_str() == "flow.end" && result.ok && result.data.is_null() {
            result.data = finished.payload.clone();
        }

        self.finish_node(
            &step,
            result,
            finished.payload,
            finished.before,
            finished.started,
        )
        .await;
    }

    /// Record an outcome and route its consequences.
    async fn finish_node(
        &mut self,
        step: &StepDef,
        result: StepResult,
        input_payload: Value,
        before: ContextSnapshot,
        started: DateTime<Utc>,
    ) {
        let node = step.id.clone();
        self.node_states.insert(node.clone(), NodeRun::Done);

        // Loop bodies and goto targets may legitimately re-execute.
        if self.ctx.step_output(&node).is_some() {
            self.ctx.erase_step_outputs([&node]);
        }
        if let Err(err) = self.ctx.insert_step_output(node.clone(), result.clone()) {
            warn!(node = %node, "failed to record step output: {err}");
        }

        self.ctx.append_evidence(Evidence::new(
            node.clone(),
            before,
            self.ctx.snapshot(),
            started,
            Utc::now(),
        ));
        self.events.emit(
            &self.ctx,
            EngineEvent::now(EventKind::NodeEnd, self.ctx.execution_id)
                .with_node(node.clone())
                .with_payload(serde_json::to_value(&result).unwrap_or(Value::Null)),
        );

        if result.ok {
            let emissions = emissions_for(step, &result, &input_payload);
            self.route(&node, emissions).await;
            return;
        }

        // Failure path: honor on_error.
        match step.on_error {
            OnError::Fail => {
                if !self.route_error(&node, &result).await {
                    self.failure = result
                        .as_error()
                        .or_else(|| Some(StepError::internal("step failed")));
                    self.ctx.cancellation.cancel();
                }
            }
            OnError::Continue => {
                let payload = json!({
                    "error": result.error,
                    "error_code": result.error_code,
                });
                self.route(&node, Emissions::Default(payload)).await;
            }
            OnError::Skip => {
                self.route(&node, Emissions::None).await;
            }
            OnError::Goto => {
                if let Some(target) = step.on_error_goto.clone() {
                    self.jump_to(&target, Value::Null).await;
                }
            }
        }
    }

    // ── Routing ─────────────────────────────────────────────────────

    async fn route(&mut self, node: &NodeId, emissions: Emissions) {
        let edge_indices: Vec<usize> = self
            .workflow
            .edges()
            .iter()
            .enumerate()
            .filter(|(_, e)| &e.source_node == node)
            .map(|(i, _)| i)
            .collect();

        let mut matched_any_case = false;
        let mut deliveries: Vec<(usize, Value)> = Vec::new();
        let mut deaths: Vec<usize> = Vec::new();

        for &index in &edge_indices {
            let edge = &self.workflow.edges()[index];
            match &emissions {
                Emissions::All(payload) => deliveries.push((index, payload.clone())),
                Emissions::Default(payload) => {
                    if edge.source_port == aster_core::DEFAULT_OUTPUT_PORT {
                        deliveries.push((index, payload.clone()));
                    } else {
                        deaths.push(index);
                    }
                }
                Emissions::Port(port, payload) => {
                    let matches = edge.source_port == *port
                        || edge
                            .semantics
                            .as_ref()
                            .is_some_and(|s| s.to_string() == *port);
                    if matches {
                        matched_any_case = true;
                        deliveries.push((index, payload.clone()));
                    } else {
                        deaths.push(index);
                    }
                }
                Emissions::None => deaths.push(index),
            }
        }

        // A switch whose case matched no edge falls back to `default`.
        if let Emissions::Port(port, payload) = &emissions {
            if port.starts_with("case:") && !matched_any_case {
                deaths.clear();
                for &index in &edge_indices {
                    let edge = &self.workflow.edges()[index];
                    if edge.source_port == "default" {
                        deliveries.push((index, payload.clone()));
                    } else {
                        deaths.push(index);
                    }
                }
            }
        }

        for (index, payload) in deliveries {
            self.deliver(index, payload).await;
        }
        for index in deaths {
            self.mark_edge_dead(index).await;
        }
    }

    async fn deliver(&mut self, edge_index: usize, payload: Value) {
        let target = self.workflow.edges()[edge_index].target_node.clone();
        self.edge_states[edge_index] = EdgeState::Delivered(payload.clone());
        debug!(edge = edge_index, target = %target, "delivered");

        let Some(step) = self.step(&target).cloned() else {
            return;
        };
        match step.module.as_str() {
            "flow.merge" | "flow.join" => self.merge_delivery(&target, payload).await,
            "flow.loop" | "flow.foreach" => self.loop_delivery(&step, edge_index, payload).await,
            _ => self.check_ready(&target).await,
        }
    }

    async fn mark_edge_dead(&mut self, edge_index: usize) {
        self.edge_states[edge_index] = EdgeState::Dead;
        let target = self.workflow.edges()[edge_index].target_node.clone();
        let Some(step) = self.step(&target).cloned() else {
            return;
        };
        match step.module.as_str() {
            "flow.merge" | "flow.join" => self.check_merge(&target).await,
            "flow.loop" | "flow.foreach" => {}
            _ => self.check_ready(&target).await,
        }
    }

    fn incoming_edges(&self, node: &NodeId) -> Vec<usize> {
        self.workflow
            .edges()
            .iter()
            .enumerate()
            .filter(|(_, e)| &e.target_node == node)
            .map(|(i, _)| i)
            .collect()
    }

    fn gather_input_payload(&self, node: &NodeId) -> Value {
        let delivered: Vec<(usize, &Value)> = self
            .incoming_edges(node)
            .into_iter()
            .filter_map(|i| self.edge_states[i].delivered().map(|v| (i, v)))
            .collect();
        match delivered.as_slice() {
            [] => Value::Null,
            [(_, single)] => (*single).clone(),
            many => {
                let mut merged = serde_json::Map::new();
                for (index, payload) in many {
                    let source = self.workflow.edges()[*index].source_node.to_string();
                    merged.insert(source, (*payload).clone());
                }
                Value::Object(merged)
            }
        }
    }

    async fn check_ready(&mut self, node: &NodeId) {
        if self.node_states.get(node) != Some(&NodeRun::Waiting) {
            return;
        }
        let incoming = self.incoming_edges(node);
        if incoming
            .iter()
            .any(|&i| self.edge_states[i].is_pending())
        {
            return;
        }
        let has_delivery = incoming
            .iter()
            .any(|&i| self.edge_states[i].delivered().is_some());
        if has_delivery {
            let payload = self.gather_input_payload(node);
            self.enqueue(node.clone(), payload);
        } else {
            self.mark_node_dead(node.clone()).await;
        }
    }

    async fn mark_node_dead(&mut self, node: NodeId) {
        self.node_states.insert(node.clone(), NodeRun::Dead);
        debug!(node = %node, "node dead (no live inputs)");
        let outgoing: Vec<usize> = self
            .workflow
            .edges()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.source_node == node)
            .map(|(i, _)| i)
            .collect();
        for index in outgoing {
            Box::pin(self.mark_edge_dead(index)).await;
        }
    }

    // ── Merge / join ────────────────────────────────────────────────

    async fn merge_delivery(&mut self, node: &NodeId, payload: Value) {
        let step = match self.step(node) {
            Some(step) => step.clone(),
            None => return,
        };
        let deadline_ms = step
            .params
            .get("timeout_ms")
            .and_then(Value::as_u64);
        let state = self.merge_states.entry(node.clone()).or_insert_with(|| {
            MergeState {
                strategy: MergeStrategy::parse(step.params.get("strategy")),
                received: Vec::new(),
                before: None,
                started_at: None,
                deadline: None,
                fired: false,
            }
        });
        if state.fired {
            return; // race semantics: late arrivals are dropped
        }
        if state.before.is_none() {
            state.before = Some(self.ctx.snapshot());
            state.started_at = Some(Utc::now());
            if let Some(ms) = deadline_ms {
                state.deadline =
                    Some(tokio::time::Instant::now() + std::time::Duration::from_millis(ms));
            }
            self.events.emit(
                &self.ctx,
                EngineEvent::now(EventKind::NodeStart, self.ctx.execution_id)
                    .with_node(node.clone()),
            );
        }
        state.received.push(payload);
        self.check_merge(node).await;
    }

    async fn check_merge(&mut self, node: &NodeId) {
        let incoming = self.incoming_edges(node);
        let pending = incoming
            .iter()
            .filter(|&&i| self.edge_states[i].is_pending())
            .count();

        let Some(state) = self.merge_states.get(node) else {
            // All inputs died before any delivery: the merge never runs.
            if pending == 0 {
                let all_dead = incoming
                    .iter()
                    .all(|&i| matches!(self.edge_states[i], EdgeState::Dead));
                if all_dead {
                    self.mark_node_dead(node.clone()).await;
                }
            }
            return;
        };
        if state.fired {
            return;
        }

        let received = state.received.len();
        let ready = match state.strategy {
            MergeStrategy::All => pending == 0,
            MergeStrategy::Any | MergeStrategy::Race => received >= 1,
            MergeStrategy::Count(k) => received >= k || pending == 0,
        };
        if ready {
            self.fire_merge(node, None).await;
        }
    }

    async fn fire_merge(&mut self, node: &NodeId, timeout_error: Option<StepError>) {
        let Some(state) = self.merge_states.get_mut(node) else {
            return;
        };
        if state.fired {
            return;
        }
        state.fired = true;

        let data = match state.strategy {
            MergeStrategy::All | MergeStrategy::Count(_) => {
                Value::Array(state.received.clone())
            }
            MergeStrategy::Any | MergeStrategy::Race => {
                state.received.first().cloned().unwrap_or(Value::Null)
            }
        };
        let before = state.before.clone().unwrap_or_default();
        let started = state.started_at.unwrap_or_else(Utc::now);

        let result = match timeout_error {
            Some(error) => StepResult::failure(error),
            None => StepResult::success(data.clone()),
        };
        let step = match self.step(node) {
            Some(step) => step.clone(),
            None => return,
        };
        Box::pin(self.finish_node(&step, result, data, before, started)).await;
    }

    fn next_merge_deadline(&self) -> Option<tokio::time::Instant> {
        self.merge_states
            .values()
            .filter(|s| !s.fired)
            .filter_map(|s| s.deadline)
            .min()
    }

    async fn fire_merge_timeouts(&mut self) {
        let now = tokio::time::Instant::now();
        let due: Vec<NodeId> = self
            .merge_states
            .iter()
            .filter(|(_, s)| !s.fired && s.deadline.is_some_and(|d| d <= now))
            .map(|(node, _)| node.clone())
            .collect();
        for node in due {
            warn!(node = %node, "merge timed out");
            self.fire_merge(
                &node,
                Some(StepError::timeout("merge did not gather its inputs in time")),
            )
            .await;
        }
    }

    // ── Loop / foreach constructs ───────────────────────────────────

    fn back_edges(&self, node: &NodeId) -> HashSet<usize> {
        let downstream = self.graph.downstream_of(node);
        self.incoming_edges(node)
            .into_iter()
            .filter(|&i| downstream.contains(&self.workflow.edges()[i].source_node))
            .collect()
    }

    async fn loop_entry(&mut self, step: &StepDef, _payload: Value) {
        let node = step.id.clone();
        let before = self.ctx.snapshot();
        let started = Utc::now();
        self.events.emit(
            &self.ctx,
            EngineEvent::now(EventKind::NodeStart, self.ctx.execution_id)
                .with_node(node.clone()),
        );

        let (kind, items, iter_var) = match step.module.as_str() {
            "flow.loop" => {
                let times = match self.resolve_param(step, "times") {
                    Ok(Some(value)) => value.as_u64().unwrap_or(0) as usize,
                    Ok(None) => 0,
                    Err(err) => {
                        let result = StepResult::failure(err);
                        Box::pin(self.finish_node(step, result, Value::Null, before, started))
                            .await;
                        return;
                    }
                };
                (LoopKind::Times(times), Vec::new(), step.iter_var.clone())
            }
            _ => {
                let items = match self.resolve_param(step, "items") {
                    Ok(Some(Value::Array(items))) => items,
                    Ok(Some(Value::Null)) | Ok(None) => Vec::new(),
                    Ok(Some(other)) => {
                        let result = StepResult::failure(
                            StepError::validation(format!(
                                "foreach expects an array, got {other}"
                            ))
                            .with_field("items"),
                        );
                        Box::pin(self.finish_node(step, result, Value::Null, before, started))
                            .await;
                        return;
                    }
                    Err(err) => {
                        let result = StepResult::failure(err);
                        Box::pin(self.finish_node(step, result, Value::Null, before, started))
                            .await;
                        return;
                    }
                };
                (LoopKind::Foreach, items, step.iter_var.clone())
            }
        };

        let total = match kind {
            LoopKind::Times(n) => n,
            LoopKind::Foreach => items.len(),
        };
        self.loop_states.insert(
            node.clone(),
            LoopState {
                kind,
                items,
                index: 0,
                collected: Vec::new(),
                iter_var,
                output_mode: step.output_mode,
                before,
                started_at: started,
            },
        );

        if total == 0 {
            self.finish_loop(&node).await;
        } else {
            self.emit_iterate(&node).await;
        }
    }

    async fn emit_iterate(&mut self, node: &NodeId) {
        let Some(state) = self.loop_states.get(node) else {
            return;
        };
        let payload = match state.kind {
            LoopKind::Times(_) => json!({"iteration": state.index}),
            LoopKind::Foreach => {
                let item = state.items.get(state.index).cloned().unwrap_or(Value::Null);
                let mut map = serde_json::Map::new();
                map.insert(state.iter_var.clone(), item);
                map.insert("index".to_owned(), json!(state.index));
                Value::Object(map)
            }
        };

        // Interim output so body steps can reference `{{<loop>.item}}`;
        // the terminal aggregate replaces it at `done`.
        if self.ctx.step_output(node).is_some() {
            self.ctx.erase_step_outputs([node]);
        }
        let _ = self
            .ctx
            .insert_step_output(node.clone(), StepResult::success(payload.clone()));

        self.reset_loop_body(node).await;

        let iterate_edges: Vec<usize> = self
            .workflow
            .edges()
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.source_node == *node
                    && (e.source_port == "iterate"
                        || matches!(e.semantics, Some(PortSemantics::Iterate)))
            })
            .map(|(i, _)| i)
            .collect();
        for index in iterate_edges {
            Box::pin(self.deliver(index, payload.clone())).await;
        }
    }

    async fn reset_loop_body(&mut self, node: &NodeId) {
        let body = self.loop_body(node);
        for member in &body {
            self.node_states.insert(member.clone(), NodeRun::Waiting);
            if self.ctx.step_output(member).is_some() {
                self.ctx.erase_step_outputs([member]);
            }
        }
        let edges: Vec<usize> = self
            .workflow
            .edges()
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                (body.contains(&e.source_node) || e.source_node == *node)
                    && (body.contains(&e.target_node) || e.target_node == *node)
            })
            .map(|(i, _)| i)
            .collect();
        for index in edges {
            self.edge_states[index] = EdgeState::Pending;
        }
    }

    /// Nodes between a loop's iterate edges and its back-edges, excluding
    /// the done-side subgraph.
    fn loop_body(&self, node: &NodeId) -> HashSet<NodeId> {
        let mut iterate_roots = Vec::new();
        let mut done_roots = Vec::new();
        for edge in self.workflow.edges() {
            if edge.source_node != *node {
                continue;
            }
            if edge.source_port == "iterate"
                || matches!(edge.semantics, Some(PortSemantics::Iterate))
            {
                iterate_roots.push(edge.target_node.clone());
            } else {
                done_roots.push(edge.target_node.clone());
            }
        }
        let body = self.reach_without(node, &iterate_roots);
        let done_side = self.reach_without(node, &done_roots);
        body.difference(&done_side).cloned().collect()
    }

    fn reach_without(&self, barrier: &NodeId, roots: &[NodeId]) -> HashSet<NodeId> {
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut queue: VecDeque<NodeId> = roots.iter().cloned().collect();
        while let Some(current) = queue.pop_front() {
            if current == *barrier || !seen.insert(current.clone()) {
                continue;
            }
            for next in self.graph.successors(&current) {
                queue.push_back(next);
            }
        }
        seen
    }

    async fn loop_delivery(&mut self, step: &StepDef, edge_index: usize, payload: Value) {
        let node = step.id.clone();
        let back = self.back_edges(&node);

        if back.contains(&edge_index) {
            // A body iteration completed.
            let advance = {
                let Some(state) = self.loop_states.get_mut(&node) else {
                    return;
                };
                state.collected.push(payload);
                state.index += 1;
                let total = match state.kind {
                    LoopKind::Times(n) => n,
                    LoopKind::Foreach => state.items.len(),
                };
                state.index < total
            };
            if advance {
                self.emit_iterate(&node).await;
            } else {
                self.finish_loop(&node).await;
            }
            return;
        }

        // Entry delivery: wait for every non-back input to resolve.
        if self.node_states.get(&node) != Some(&NodeRun::Waiting) {
            return;
        }
        let entry_pending = self
            .incoming_edges(&node)
            .into_iter()
            .filter(|i| !back.contains(i))
            .any(|i| self.edge_states[i].is_pending());
        if !entry_pending {
            let payload = self.gather_input_payload(&node);
            self.enqueue(node, payload);
        }
    }

    async fn finish_loop(&mut self, node: &NodeId) {
        let Some(state) = self.loop_states.remove(node) else {
            return;
        };
        let data = match state.kind {
            LoopKind::Times(n) => json!({
                "iterations": n,
                "results": state.collected,
            }),
            LoopKind::Foreach => match state.output_mode {
                OutputMode::Collect => Value::Array(state.collected.clone()),
                OutputMode::Last => state.collected.last().cloned().unwrap_or(Value::Null),
                OutputMode::None => Value::Null,
            },
        };
        let result = StepResult::success(data.clone());
        let before = state.before;
        let started = state.started_at;

        self.node_states.insert(node.clone(), NodeRun::Done);
        if self.ctx.step_output(node).is_some() {
            self.ctx.erase_step_outputs([node]);
        }
        let _ = self.ctx.insert_step_output(node.clone(), result.clone());
        self.ctx.append_evidence(Evidence::new(
            node.clone(),
            before,
            self.ctx.snapshot(),
            started,
            Utc::now(),
        ));
        self.events.emit(
            &self.ctx,
            EngineEvent::now(EventKind::NodeEnd, self.ctx.execution_id)
                .with_node(node.clone())
                .with_payload(serde_json::to_value(&result).unwrap_or(Value::Null)),
        );

        // Emit terminally on the done edges; iterate edges die.
        let done_edges: Vec<(usize, bool)> = self
            .workflow
            .edges()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.source_node == *node)
            .map(|(i, e)| {
                let is_iterate = e.source_port == "iterate"
                    || matches!(e.semantics, Some(PortSemantics::Iterate));
                (i, is_iterate)
            })
            .collect();
        for (index, is_iterate) in done_edges {
            if is_iterate {
                Box::pin(self.mark_edge_dead(index)).await;
            } else {
                Box::pin(self.deliver(index, data.clone())).await;
            }
        }
    }

    // ── Goto ────────────────────────────────────────────────────────

    async fn run_goto(&mut self, step: &StepDef, payload: Value) {
        let node = step.id.clone();
        let before = self.ctx.snapshot();
        let started = Utc::now();
        self.events.emit(
            &self.ctx,
            EngineEvent::now(EventKind::NodeStart, self.ctx.execution_id)
                .with_node(node.clone()),
        );

        self.goto_count += 1;
        if self.goto_count > self.workflow.config.goto_ceiling {
            let result = StepResult::failure(StepError::new(
                ErrorCode::ExecutionError,
                format!(
                    "goto iteration ceiling ({}) exceeded",
                    self.workflow.config.goto_ceiling
                ),
            ));
            Box::pin(self.finish_node(step, result, payload, before, started)).await;
            return;
        }

        let target_name = match self.resolve_param(step, "to") {
            Ok(Some(Value::String(name))) => name,
            Ok(_) => {
                let result = StepResult::failure(
                    StepError::validation("goto requires a `to` parameter").with_field("to"),
                );
                Box::pin(self.finish_node(step, result, payload, before, started)).await;
                return;
            }
            Err(err) => {
                let result = StepResult::failure(err);
                Box::pin(self.finish_node(step, result, payload, before, started)).await;
                return;
            }
        };
        let Some(target) = self
            .workflow
            .node_by_reference(&target_name)
            .map(|s| s.id.clone())
        else {
            let result = StepResult::failure(
                StepError::validation(format!("unknown goto target {target_name:?}"))
                    .with_field("to"),
            );
            Box::pin(self.finish_node(step, result, payload, before, started)).await;
            return;
        };

        // Record the jump itself.
        self.node_states.insert(node.clone(), NodeRun::Done);
        if self.ctx.step_output(&node).is_some() {
            self.ctx.erase_step_outputs([&node]);
        }
        let result = StepResult::success(json!({"to": target.to_string(), "jump": self.goto_count}));
        let _ = self.ctx.insert_step_output(node.clone(), result.clone());
        self.ctx.append_evidence(Evidence::new(
            node.clone(),
            before,
            self.ctx.snapshot(),
            started,
            Utc::now(),
        ));
        self.events.emit(
            &self.ctx,
            EngineEvent::now(EventKind::NodeEnd, self.ctx.execution_id)
                .with_node(node.clone())
                .with_payload(serde_json::to_value(&result).unwrap_or(Value::Null)),
        );

        self.jump_to(&target, payload).await;
    }

    async fn jump_to(&mut self, target: &NodeId, payload: Value) {
        // Reset the target and everything downstream of it so the region
        // can execute again.
        let mut region = self.graph.downstream_of(target);
        region.insert(target.clone());
        for member in &region {
            if self.node_states.get(member) == Some(&NodeRun::Done)
                || self.node_states.get(member) == Some(&NodeRun::Dead)
            {
                self.node_states.insert(member.clone(), NodeRun::Waiting);
            }
            if member != target && self.ctx.step_output(member).is_some() {
                self.ctx.erase_step_outputs([member]);
            }
        }
        let edges: Vec<usize> = self
            .workflow
            .edges()
            .iter()
            .enumerate()
            .filter(|(_, e)| region.contains(&e.source_node) && region.contains(&e.target_node))
            .map(|(i, _)| i)
            .collect();
        for index in edges {
            self.edge_states[index] = EdgeState::Pending;
        }
        if self.ctx.step_output(target).is_some() {
            self.ctx.erase_step_outputs([target]);
        }
        self.enqueue(target.clone(), payload);
    }

    // ── Breakpoint ──────────────────────────────────────────────────

    async fn run_breakpoint(&mut self, step: &StepDef, payload: Value) {
        let node = step.id.clone();
        let before = self.ctx.snapshot();
        let started = Utc::now();
        self.events.emit(
            &self.ctx,
            EngineEvent::now(EventKind::NodeStart, self.ctx.execution_id)
                .with_node(node.clone()),
        );

        let timeout_ms = step.params.get("timeout_ms").and_then(Value::as_u64);
        let (tx, rx) = oneshot::channel();
        self.control.arm_breakpoint(tx);
        let _ = self.ctx.transition_status(ExecutionStatus::Paused);
        self.events.emit(
            &self.ctx,
            EngineEvent::now(EventKind::Log, self.ctx.execution_id)
                .with_node(node.clone())
                .with_payload(json!({"message": "awaiting breakpoint resolution"})),
        );

        enum BreakpointWake {
            Resolved(Option<Value>),
            TimedOut,
            Cancelled,
        }
        let wake = tokio::select! {
            resolved = rx => BreakpointWake::Resolved(resolved.ok()),
            () = async {
                match timeout_ms {
                    Some(ms) => tokio::time::sleep(std::time::Duration::from_millis(ms)).await,
                    None => std::future::pending().await,
                }
            }, if timeout_ms.is_some() => BreakpointWake::TimedOut,
            () = self.ctx.cancellation.cancelled() => BreakpointWake::Cancelled,
        };
        let resolution = match wake {
            BreakpointWake::Resolved(value) => value,
            BreakpointWake::TimedOut => None,
            BreakpointWake::Cancelled => {
                self.cancelled = true;
                None
            }
        };
        let _ = self.ctx.transition_status(ExecutionStatus::Running);

        if self.cancelled {
            let result = StepResult::cancelled();
            Box::pin(self.finish_node(step, result, payload, before, started)).await;
            return;
        }

        let result = match resolution {
            Some(value) => {
                let approved = value
                    .get("approved")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                if approved {
                    StepResult::success(value)
                } else {
                    StepResult::failure(StepError::new(
                        ErrorCode::ExecutionError,
                        "breakpoint rejected",
                    ))
                }
            }
            None => StepResult::failure(StepError::timeout(
                "breakpoint was not resolved within its timeout",
            )),
        };
        Box::pin(self.finish_node(step, result, payload, before, started)).await;
    }

    // ── Subflow ─────────────────────────────────────────────────────

    async fn run_subflow(&mut self, step: &StepDef, payload: Value) {
        let node = step.id.clone();
        let before = self.ctx.snapshot();
        let started = Utc::now();
        self.events.emit(
            &self.ctx,
            EngineEvent::now(EventKind::NodeStart, self.ctx.execution_id)
                .with_node(node.clone()),
        );

        // The child document is taken verbatim — its own `{{...}}`
        // references must resolve in the child's context, not this one.
        let document = step.params.get("workflow").cloned();
        let result = match document {
            Some(document) => {
                let parsed = serde_json::from_value::<Workflow>(document)
                    .map_err(|e| e.to_string())
                    .and_then(|w| w.normalized().map_err(|e| e.to_string()));
                match parsed {
                    Ok(child) => {
                        let inputs = match self.resolve_param(step, "params") {
                            Ok(Some(Value::Object(map))) => map,
                            _ => serde_json::Map::new(),
                        };
                        let outcome = Box::pin(self.engine.execute_child(
                            child,
                            inputs,
                            self.ctx.execution_id,
                        ))
                        .await;
                        match outcome {
                            Ok(child_result) => {
                                if child_result.status == ExecutionStatus::Completed {
                                    StepResult::success(json!({
                                        "execution_id": child_result.execution_id.to_string(),
                                        "status": child_result.status,
                                        "output": child_result.output,
                                    }))
                                } else {
                                    StepResult::failure(
                                        child_result.failure.unwrap_or_else(|| {
                                            StepError::new(
                                                ErrorCode::ExecutionError,
                                                "subflow did not complete",
                                            )
                                        }),
                                    )
                                }
                            }
                            Err(err) => StepResult::failure(StepError::new(
                                ErrorCode::ExecutionError,
                                err.to_string(),
                            )),
                        }
                    }
                    Err(err) => StepResult::failure(
                        StepError::validation(format!("invalid subflow document: {err}"))
                            .with_field("workflow"),
                    ),
                }
            }
            None => StepResult::failure(
                StepError::validation("subflow requires a `workflow` parameter")
                    .with_field("workflow"),
            ),
        };

        Box::pin(self.finish_node(step, result, payload, before, started)).await;
    }

    // ── Error subgraph ──────────────────────────────────────────────

    /// Route a would-be-terminal failure into the error subgraph.
    /// Returns `false` when the workflow has no error trigger.
    async fn route_error(&mut self, failed: &NodeId, result: &StepResult) -> bool {
        let triggers: Vec<StepDef> = self
            .workflow
            .nodes()
            .iter()
            .filter(|n| n.module.as_str() == "flow.error_workflow_trigger")
            .cloned()
            .collect();
        if triggers.is_empty() {
            return false;
        }

        let payload = json!({
            "node_id": failed.to_string(),
            "error_code": result.error_code,
            "error": result.error,
            "context_snapshot": self.ctx.snapshot().public,
        });

        for trigger in triggers {
            debug!(trigger = %trigger.id, "routing failure to error subgraph");
            let before = self.ctx.snapshot();
            let started = Utc::now();
            self.node_states.insert(trigger.id.clone(), NodeRun::Done);
            let outcome = StepResult::success(payload.clone());
            let _ = self
                .ctx
                .insert_step_output(trigger.id.clone(), outcome.clone());
            self.ctx.append_evidence(Evidence::new(
                trigger.id.clone(),
                before,
                self.ctx.snapshot(),
                started,
                Utc::now(),
            ));
            self.events.emit(
                &self.ctx,
                EngineEvent::now(EventKind::NodeEnd, self.ctx.execution_id)
                    .with_node(trigger.id.clone())
                    .with_payload(serde_json::to_value(&outcome).unwrap_or(Value::Null)),
            );
            Box::pin(self.route(&trigger.id.clone(), Emissions::Default(payload.clone()))).await;
        }
        true
    }

    // ── Param resolution for scheduler-managed nodes ────────────────

    fn resolve_param(&self, step: &StepDef, name: &str) -> Result<Option<Value>, StepError> {
        let Some(raw) = step.params.get(name) else {
            return Ok(None);
        };
        let outputs = self.ctx.outputs_view();
        let mut eval = EvalContext::new(
            self.ctx.params(),
            self.ctx.env(),
            &self.ctx.workflow_id,
            &self.ctx.workflow_name,
            &outputs,
        );
        if self.workflow.config.strict_variables {
            eval = eval.strict();
        }
        resolve_value(raw, &eval)
            .map(Some)
            .map_err(|e| StepError::validation(e.to_string()).with_field(name.to_owned()))
    }
}

/// What a completed node sends downstream.
#[derive(Debug)]
enum Emissions {
    /// Deliver this payload on the default output edges.
    Default(Value),
    /// Deliver on the edges matching one named port.
    Port(String, Value),
    /// Deliver the payload on every outgoing edge (fork).
    All(Value),
    /// Deliver nothing; every outgoing edge dies.
    None,
}

fn emissions_for(step: &StepDef, result: &StepResult, input_payload: &Value) -> Emissions {
    if result.skipped {
        return Emissions::Default(Value::Null);
    }
    if result
        .meta
        .extra
        .get(META_PORTS)
        .and_then(Value::as_str)
        .is_some()
    {
        return Emissions::All(input_payload.clone());
    }
    if let Some(port) = result.meta.extra.get(META_PORT).and_then(Value::as_str) {
        // Decision nodes pass their input through on the selected port.
        let passthrough = matches!(
            step.module.as_str(),
            "flow.branch" | "flow.switch" | "flow.goto"
        );
        let payload = if passthrough {
            input_payload.clone()
        } else {
            result.data.clone()
        };
        return Emissions::Port(port.to_owned(), payload);
    }
    Emissions::Default(result.data.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aster_execution::StepMeta;

    #[test]
    fn merge_strategy_parsing() {
        assert_eq!(MergeStrategy::parse(None), MergeStrategy::All);
        assert_eq!(
            MergeStrategy::parse(Some(&json!("any"))),
            MergeStrategy::Any
        );
        assert_eq!(
            MergeStrategy::parse(Some(&json!("race"))),
            MergeStrategy::Race
        );
        assert_eq!(
            MergeStrategy::parse(Some(&json!("count:2"))),
            MergeStrategy::Count(2)
        );
        assert_eq!(
            MergeStrategy::parse(Some(&json!("count:garbage"))),
            MergeStrategy::All
        );
        assert_eq!(MergeStrategy::parse(Some(&json!("all"))), MergeStrategy::All);
    }

    #[test]
    fn emissions_skipped_is_default_null() {
        let step = StepDef::new(
            "a".parse().unwrap(),
            "string.trim".parse().unwrap(),
        );
        let emissions = emissions_for(&step, &StepResult::skipped(), &json!("input"));
        match emissions {
            Emissions::Default(value) => assert_eq!(value, Value::Null),
            other => panic!("expected Default, got {other:?}"),
        }
    }

    #[test]
    fn emissions_branch_passes_input_through() {
        let step = StepDef::new("c".parse().unwrap(), "flow.branch".parse().unwrap());
        let mut result = StepResult::success(json!({"condition": true}));
        result.meta = StepMeta::default();
        result
            .meta
            .extra
            .insert(META_PORT.into(), json!("true"));
        let emissions = emissions_for(&step, &result, &json!({"payload": 1}));
        match emissions {
            Emissions::Port(port, value) => {
                assert_eq!(port, "true");
                assert_eq!(value["payload"], 1);
            }
            other => panic!("expected Port, got {other:?}"),
        }
    }

    #[test]
    fn emissions_plain_node_sends_data() {
        let step = StepDef::new("a".parse().unwrap(), "string.trim".parse().unwrap());
        let result = StepResult::success(json!({"result": "x"}));
        let emissions = emissions_for(&step, &result, &Value::Null);
        match emissions {
            Emissions::Default(value) => assert_eq!(value["result"], "x"),
            other => panic!("expected Default, got {other:?}"),
        }
    }
}
