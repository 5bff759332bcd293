//! Layered runtime execution context.
//!
//! The context is shared across scheduler tasks behind an `Arc`; interior
//! mutability is per-layer. Layer visibility is enforced by type, not by
//! convention:
//!
//! - **params / public** — reachable by the variable resolver and included
//!   in snapshots
//! - **private** — engine-internal (user id, tenant id, request id); no
//!   resolver namespace exists for it and snapshots skip it
//! - **secrets** — [`SecretString`] handles; the type does not implement
//!   `Serialize`, so a snapshot or trace containing one is a compile error

use std::collections::{BTreeMap, HashMap};

use aster_core::{ExecutionId, NodeId};
use indexmap::IndexMap;
use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::ExecutionError;
use crate::evidence::{ContextSnapshot, Evidence, EvidenceLog};
use crate::result::StepResult;
use crate::status::ExecutionStatus;
use crate::trace::{EngineEvent, TraceLog};

/// Runtime context for one executing workflow.
///
/// Not serializable as a whole — persistence goes through
/// [`ContextSnapshot`], [`EvidenceLog`] and [`TraceLog`].
#[derive(Debug)]
pub struct ExecutionContext {
    /// Unique identifier for this execution.
    pub execution_id: ExecutionId,
    /// Workflow document id (or generated id when the document has none).
    pub workflow_id: String,
    /// Workflow display name.
    pub workflow_name: String,
    /// Parent execution for `flow.invoke` / `flow.subflow` children.
    pub parent_execution_id: Option<ExecutionId>,
    /// Token for cooperative cancellation.
    pub cancellation: CancellationToken,

    params: serde_json::Map<String, Value>,
    env: BTreeMap<String, String>,
    public: RwLock<serde_json::Map<String, Value>>,
    private: RwLock<serde_json::Map<String, Value>>,
    secrets: RwLock<HashMap<String, SecretString>>,
    step_outputs: RwLock<IndexMap<NodeId, StepResult>>,
    aliases: HashMap<String, NodeId>,
    evidence: RwLock<EvidenceLog>,
    trace: RwLock<TraceLog>,
    status: RwLock<ExecutionStatus>,
}

impl ExecutionContext {
    /// Create a fresh context in [`ExecutionStatus::Pending`].
    #[must_use]
    pub fn new(
        execution_id: ExecutionId,
        workflow_id: impl Into<String>,
        workflow_name: impl Into<String>,
    ) -> Self {
        Self {
            execution_id,
            workflow_id: workflow_id.into(),
            workflow_name: workflow_name.into(),
            parent_execution_id: None,
            cancellation: CancellationToken::new(),
            params: serde_json::Map::new(),
            env: BTreeMap::new(),
            public: RwLock::new(serde_json::Map::new()),
            private: RwLock::new(serde_json::Map::new()),
            secrets: RwLock::new(HashMap::new()),
            step_outputs: RwLock::new(IndexMap::new()),
            aliases: HashMap::new(),
            evidence: RwLock::new(EvidenceLog::new()),
            trace: RwLock::new(TraceLog::new()),
            status: RwLock::new(ExecutionStatus::Pending),
        }
    }

    /// Set the resolved workflow parameters.
    #[must_use]
    pub fn with_params(mut self, params: serde_json::Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    /// Set the allowlisted environment snapshot.
    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Register output aliases (`alias → node id`).
    #[must_use]
    pub fn with_aliases(mut self, aliases: HashMap<String, NodeId>) -> Self {
        self.aliases = aliases;
        self
    }

    /// Link to a parent execution.
    #[must_use]
    pub fn with_parent(mut self, parent: ExecutionId) -> Self {
        self.parent_execution_id = Some(parent);
        self
    }

    /// Replace the cancellation token (to chain from a parent).
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Use a trace log for a specific replay generation.
    #[must_use]
    pub fn with_trace_generation(self, generation: u32) -> Self {
        *self.trace.write() = TraceLog::for_generation(generation);
        self
    }

    // ── Layers ──────────────────────────────────────────────────────

    /// The resolved workflow parameters.
    #[must_use]
    pub fn params(&self) -> &serde_json::Map<String, Value> {
        &self.params
    }

    /// The allowlisted environment snapshot.
    #[must_use]
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Set a public variable.
    pub fn set_public(&self, key: impl Into<String>, value: Value) {
        self.public.write().insert(key.into(), value);
    }

    /// Get a public variable.
    #[must_use]
    pub fn get_public(&self, key: &str) -> Option<Value> {
        self.public.read().get(key).cloned()
    }

    /// Set a private (engine-internal) value. Never resolvable, never
    /// snapshotted.
    pub fn set_private(&self, key: impl Into<String>, value: Value) {
        self.private.write().insert(key.into(), value);
    }

    /// Get a private value.
    #[must_use]
    pub fn get_private(&self, key: &str) -> Option<Value> {
        self.private.read().get(key).cloned()
    }

    /// Store a secret under a handle.
    pub fn put_secret(&self, handle: impl Into<String>, secret: SecretString) {
        self.secrets.write().insert(handle.into(), secret);
    }

    /// Reveal a secret's value.
    ///
    /// Only the module invoker calls this, and only for modules declaring
    /// `requires_credentials`; the value goes straight into the invoke
    /// payload and is never stored back into any serializable layer.
    #[must_use]
    pub fn reveal_secret(&self, handle: &str) -> Option<String> {
        self.secrets
            .read()
            .get(handle)
            .map(|s| s.expose_secret().to_owned())
    }

    /// Whether a secret handle exists.
    #[must_use]
    pub fn has_secret(&self, handle: &str) -> bool {
        self.secrets.read().contains_key(handle)
    }

    /// The stored secret handles (names only), sorted.
    #[must_use]
    pub fn secret_handles(&self) -> Vec<String> {
        let mut handles: Vec<String> = self.secrets.read().keys().cloned().collect();
        handles.sort();
        handles
    }

    // ── Step outputs ────────────────────────────────────────────────

    /// Record a step's outcome. Outputs are append-only: recording the
    /// same node twice is an error (replay must erase first).
    pub fn insert_step_output(
        &self,
        node_id: NodeId,
        result: StepResult,
    ) -> Result<(), ExecutionError> {
        let mut outputs = self.step_outputs.write();
        if outputs.contains_key(&node_id) {
            return Err(ExecutionError::DuplicateStepOutput(node_id.to_string()));
        }
        outputs.insert(node_id, result);
        Ok(())
    }

    /// A step's recorded outcome.
    #[must_use]
    pub fn step_output(&self, node_id: &NodeId) -> Option<StepResult> {
        self.step_outputs.read().get(node_id).cloned()
    }

    /// Node ids with recorded outcomes, in completion order.
    #[must_use]
    pub fn completed_nodes(&self) -> Vec<NodeId> {
        self.step_outputs.read().keys().cloned().collect()
    }

    /// Erase outcomes for the given nodes (replay preparation).
    pub fn erase_step_outputs<'a>(&self, nodes: impl IntoIterator<Item = &'a NodeId>) {
        let mut outputs = self.step_outputs.write();
        for node in nodes {
            outputs.shift_remove(node);
        }
    }

    /// The resolver's view of step outputs: `node id → data`, with output
    /// aliases resolving to the same data.
    #[must_use]
    pub fn outputs_view(&self) -> serde_json::Map<String, Value> {
        let outputs = self.step_outputs.read();
        let mut view = serde_json::Map::new();
        for (node_id, result) in outputs.iter() {
            view.insert(node_id.to_string(), result.data.clone());
        }
        for (alias, node_id) in &self.aliases {
            if let Some(result) = outputs.get(node_id) {
                view.insert(alias.clone(), result.data.clone());
            }
        }
        view
    }

    // ── Snapshots ───────────────────────────────────────────────────

    /// Snapshot the public layer and completed outputs.
    ///
    /// Workflow parameters appear under the `"params"` key so a restored
    /// context can rebuild its params namespace.
    #[must_use]
    pub fn snapshot(&self) -> ContextSnapshot {
        let mut public = self.public.read().clone();
        public.insert("params".to_owned(), Value::Object(self.params.clone()));
        let step_outputs = self
            .step_outputs
            .read()
            .iter()
            .map(|(id, result)| (id.to_string(), result.clone()))
            .collect();
        ContextSnapshot::new(public, step_outputs)
    }

    /// Rebuild the public layer and outputs from a snapshot (replay).
    pub fn restore(&self, snapshot: &ContextSnapshot) -> Result<(), ExecutionError> {
        let mut public = snapshot.public.clone();
        public.remove("params");
        *self.public.write() = public;

        let mut outputs = IndexMap::new();
        for (name, result) in &snapshot.step_outputs {
            let node_id = NodeId::new(name)
                .map_err(|e| ExecutionError::SnapshotCorrupt(e.to_string()))?;
            outputs.insert(node_id, result.clone());
        }
        *self.step_outputs.write() = outputs;
        Ok(())
    }

    /// Extract the params map recorded in a snapshot.
    #[must_use]
    pub fn snapshot_params(snapshot: &ContextSnapshot) -> serde_json::Map<String, Value> {
        snapshot
            .public
            .get("params")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    // ── Evidence & trace ────────────────────────────────────────────

    /// Append an evidence record.
    pub fn append_evidence(&self, record: Evidence) {
        self.evidence.write().append(record);
    }

    /// Clone the evidence log.
    #[must_use]
    pub fn evidence(&self) -> EvidenceLog {
        self.evidence.read().clone()
    }

    /// Append a trace event.
    pub fn append_event(&self, event: EngineEvent) {
        self.trace.write().append(event);
    }

    /// Clone the trace log.
    #[must_use]
    pub fn trace(&self) -> TraceLog {
        self.trace.read().clone()
    }

    // ── Status ──────────────────────────────────────────────────────

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ExecutionStatus {
        *self.status.read()
    }

    /// Transition to a new status; invalid transitions are rejected.
    pub fn transition_status(&self, target: ExecutionStatus) -> Result<(), ExecutionError> {
        let mut status = self.status.write();
        if !status.can_transition_to(target) {
            return Err(ExecutionError::InvalidTransition {
                from: status.to_string(),
                to: target.to_string(),
            });
        }
        *status = target;
        Ok(())
    }

    /// Check the cancellation flag.
    pub fn check_cancelled(&self) -> Result<(), ExecutionError> {
        if self.cancellation.is_cancelled() {
            Err(ExecutionError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn nid(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    fn test_context() -> ExecutionContext {
        ExecutionContext::new(ExecutionId::v4(), "wf-1", "demo").with_params(
            json!({"n": 5}).as_object().unwrap().clone(),
        )
    }

    #[test]
    fn new_context_is_pending_and_empty() {
        let ctx = test_context();
        assert_eq!(ctx.status(), ExecutionStatus::Pending);
        assert!(ctx.completed_nodes().is_empty());
        assert!(!ctx.cancellation.is_cancelled());
    }

    #[test]
    fn step_outputs_are_append_only() {
        let ctx = test_context();
        ctx.insert_step_output(nid("a"), StepResult::success(json!(1)))
            .unwrap();
        let err = ctx
            .insert_step_output(nid("a"), StepResult::success(json!(2)))
            .unwrap_err();
        assert!(matches!(err, ExecutionError::DuplicateStepOutput(_)));
        assert_eq!(ctx.step_output(&nid("a")).unwrap().data, json!(1));
    }

    #[test]
    fn erase_allows_replay_insert() {
        let ctx = test_context();
        ctx.insert_step_output(nid("a"), StepResult::success(json!(1)))
            .unwrap();
        ctx.erase_step_outputs([&nid("a")]);
        ctx.insert_step_output(nid("a"), StepResult::success(json!(2)))
            .unwrap();
        assert_eq!(ctx.step_output(&nid("a")).unwrap().data, json!(2));
    }

    #[test]
    fn outputs_view_includes_aliases() {
        let ctx = ExecutionContext::new(ExecutionId::v4(), "wf", "wf").with_aliases(
            HashMap::from([("response".to_owned(), nid("fetch"))]),
        );
        ctx.insert_step_output(nid("fetch"), StepResult::success(json!({"body": "ok"})))
            .unwrap();
        let view = ctx.outputs_view();
        assert_eq!(view["fetch"]["body"], "ok");
        assert_eq!(view["response"]["body"], "ok");
    }

    #[test]
    fn private_layer_not_in_snapshot() {
        let ctx = test_context();
        ctx.set_private("tenant_id", json!("t-42"));
        ctx.set_public("visible", json!(true));
        let snap = ctx.snapshot();
        assert_eq!(snap.public.get("visible"), Some(&json!(true)));
        assert!(!snap.public.contains_key("tenant_id"));
    }

    #[test]
    fn snapshot_carries_params_and_outputs() {
        let ctx = test_context();
        ctx.insert_step_output(nid("a"), StepResult::success(json!("HI")))
            .unwrap();
        let snap = ctx.snapshot();
        assert_eq!(snap.public["params"]["n"], 5);
        assert_eq!(snap.step_outputs["a"].data, json!("HI"));
        assert_eq!(ExecutionContext::snapshot_params(&snap)["n"], 5);
    }

    #[test]
    fn restore_rebuilds_state() {
        let ctx = test_context();
        ctx.set_public("cursor", json!(10));
        ctx.insert_step_output(nid("a"), StepResult::success(json!(1)))
            .unwrap();
        let snap = ctx.snapshot();

        let restored = ExecutionContext::new(ExecutionId::v4(), "wf-1", "demo")
            .with_params(ExecutionContext::snapshot_params(&snap));
        restored.restore(&snap).unwrap();
        assert_eq!(restored.get_public("cursor"), Some(json!(10)));
        assert!(restored.get_public("params").is_none());
        assert_eq!(restored.step_output(&nid("a")).unwrap().data, json!(1));
    }

    #[test]
    fn secrets_reveal_and_containment() {
        let ctx = test_context();
        ctx.put_secret("api_key", SecretString::from("s3cr3t"));
        assert!(ctx.has_secret("api_key"));
        assert_eq!(ctx.reveal_secret("api_key").as_deref(), Some("s3cr3t"));
        assert!(ctx.reveal_secret("other").is_none());
        // Snapshots have no path to the secrets layer.
        let snap = ctx.snapshot();
        assert!(!serde_json::to_string(&snap).unwrap().contains("s3cr3t"));
    }

    #[test]
    fn status_transitions_enforced() {
        let ctx = test_context();
        ctx.transition_status(ExecutionStatus::Running).unwrap();
        ctx.transition_status(ExecutionStatus::Paused).unwrap();
        ctx.transition_status(ExecutionStatus::Running).unwrap();
        ctx.transition_status(ExecutionStatus::Completed).unwrap();
        let err = ctx
            .transition_status(ExecutionStatus::Running)
            .unwrap_err();
        assert!(err.to_string().contains("invalid transition"));
    }

    #[test]
    fn check_cancelled() {
        let ctx = test_context();
        assert!(ctx.check_cancelled().is_ok());
        ctx.cancellation.cancel();
        assert!(matches!(
            ctx.check_cancelled(),
            Err(ExecutionError::Cancelled)
        ));
    }

    #[test]
    fn trace_generation_builder() {
        let ctx = test_context().with_trace_generation(2);
        assert_eq!(ctx.trace().generation, 2);
    }

    #[test]
    fn evidence_appends() {
        let ctx = test_context();
        let now = chrono::Utc::now();
        ctx.append_evidence(Evidence::new(
            nid("a"),
            ContextSnapshot::default(),
            ContextSnapshot::default(),
            now,
            now,
        ));
        assert_eq!(ctx.evidence().records().len(), 1);
    }
}
