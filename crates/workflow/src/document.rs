//! The workflow document model.
//!
//! A document arrives in one of two isomorphic shapes: the legacy linear
//! form (`steps:` — a straight chain, with consecutive `parallel: true`
//! steps fanning out) or the graph form (`nodes:` + `edges:`). Parsing
//! normalizes to the graph form; serialization always emits the graph form.

use aster_core::{Constraints, DataType, NodeId};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::edge::EdgeDef;
use crate::error::WorkflowError;
use crate::step::StepDef;

/// A declared workflow input parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDecl {
    /// Parameter name.
    pub name: String,
    /// Declared type; defaults to `any`.
    #[serde(default = "default_param_type", rename = "type")]
    pub param_type: DataType,
    /// Whether the caller must supply a value.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
    /// Default applied when the caller omits the parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Value constraints.
    #[serde(default, skip_serializing_if = "Constraints::is_empty")]
    pub constraints: Constraints,
}

fn default_param_type() -> DataType {
    DataType::Any
}

impl ParamDecl {
    /// A minimal declaration.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type: DataType::Any,
            required: false,
            default: None,
            constraints: Constraints::none(),
        }
    }

    /// Check a supplied value (or absence) against this declaration.
    ///
    /// Returns the effective value — the supplied one, the default, or
    /// `Null` — or a human-readable violation.
    pub fn check(&self, supplied: Option<&Value>) -> Result<Value, String> {
        let effective = match supplied {
            Some(value) => value.clone(),
            None => match &self.default {
                Some(default) => default.clone(),
                None if self.required => {
                    return Err(format!("required parameter {:?} is missing", self.name));
                }
                None => return Ok(Value::Null),
            },
        };
        if !effective.is_null() && !self.param_type.matches_value(&effective) {
            return Err(format!(
                "parameter {:?} expects {:?}",
                self.name, self.param_type
            ));
        }
        if let Some(violation) = self.constraints.check(&effective) {
            return Err(format!("parameter {:?}: {violation}", self.name));
        }
        Ok(effective)
    }
}

/// Per-workflow execution configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Workflow-level deadline in milliseconds; `None` means unbounded.
    pub timeout_ms: Option<u64>,
    /// Concurrency cap inside one execution.
    pub max_parallel: usize,
    /// Iteration ceiling for `flow.goto` jumps.
    pub goto_ceiling: u32,
    /// Environment variables the resolver may expose.
    pub env_allowlist: Vec<String>,
    /// Treat unresolved variable references as errors.
    pub strict_variables: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            max_parallel: 8,
            goto_ceiling: 100,
            env_allowlist: Vec::new(),
            strict_variables: false,
        }
    }
}

/// A parsed, normalized workflow document.
///
/// Immutable once accepted: the engine clones an `Arc<Workflow>` per
/// execution and never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Document id; generated ids are assigned by callers when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Display name.
    pub name: String,
    /// Document version string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Free-form tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Document author.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Declared input parameters, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<ParamDecl>,
    /// Execution configuration.
    #[serde(default, skip_serializing_if = "is_default_config")]
    pub config: WorkflowConfig,
    /// Legacy linear form; emptied by normalization.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    steps: Vec<StepDef>,
    /// Graph-form nodes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    nodes: Vec<StepDef>,
    /// Graph-form edges.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    edges: Vec<EdgeDef>,
    /// Output mapping, evaluated after completion.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub output: IndexMap<String, String>,
}

fn is_default_config(config: &WorkflowConfig) -> bool {
    *config == WorkflowConfig::default()
}

impl Workflow {
    /// Start an empty graph-form workflow (builder entry point for tests
    /// and programmatic construction).
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            version: None,
            description: None,
            tags: Vec::new(),
            author: None,
            params: Vec::new(),
            config: WorkflowConfig::default(),
            steps: Vec::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
            output: IndexMap::new(),
        }
    }

    /// Parse a YAML document and normalize it.
    pub fn from_yaml(source: &str) -> Result<Self, WorkflowError> {
        let workflow: Self =
            serde_yaml::from_str(source).map_err(|e| WorkflowError::Parse(e.to_string()))?;
        workflow.normalized()
    }

    /// Parse a JSON document and normalize it.
    pub fn from_json(source: &str) -> Result<Self, WorkflowError> {
        let workflow: Self =
            serde_json::from_str(source).map_err(|e| WorkflowError::Parse(e.to_string()))?;
        workflow.normalized()
    }

    /// Serialize to YAML (always graph form).
    pub fn to_yaml(&self) -> Result<String, WorkflowError> {
        serde_yaml::to_string(self).map_err(|e| WorkflowError::Parse(e.to_string()))
    }

    /// Serialize to JSON (always graph form).
    pub fn to_json(&self) -> Result<String, WorkflowError> {
        serde_json::to_string_pretty(self).map_err(|e| WorkflowError::Parse(e.to_string()))
    }

    /// Add a node (builder).
    #[must_use]
    pub fn with_node(mut self, step: StepDef) -> Self {
        self.nodes.push(step);
        self
    }

    /// Add an edge (builder).
    #[must_use]
    pub fn with_edge(mut self, edge: EdgeDef) -> Self {
        self.edges.push(edge);
        self
    }

    /// Add an output mapping entry (builder).
    #[must_use]
    pub fn with_output(mut self, name: impl Into<String>, expr: impl Into<String>) -> Self {
        self.output.insert(name.into(), expr.into());
        self
    }

    /// Add a parameter declaration (builder).
    #[must_use]
    pub fn with_param(mut self, decl: ParamDecl) -> Self {
        self.params.push(decl);
        self
    }

    /// Replace the configuration (builder).
    #[must_use]
    pub fn with_config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    /// The nodes of the normalized graph.
    #[must_use]
    pub fn nodes(&self) -> &[StepDef] {
        &self.nodes
    }

    /// The edges of the normalized graph.
    #[must_use]
    pub fn edges(&self) -> &[EdgeDef] {
        &self.edges
    }

    /// Look up a node by id.
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&StepDef> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Look up a node by id or output alias.
    #[must_use]
    pub fn node_by_reference(&self, name: &str) -> Option<&StepDef> {
        self.nodes
            .iter()
            .find(|n| n.id == *name || n.output.as_deref() == Some(name))
    }

    /// Normalize into graph form.
    ///
    /// A document must carry `steps` or `nodes`, not both. The linear form
    /// becomes a chain of default-port edges; maximal runs of consecutive
    /// `parallel: true` steps form one group, wired fully from the previous
    /// group and into the next.
    pub fn normalized(mut self) -> Result<Self, WorkflowError> {
        match (self.steps.is_empty(), self.nodes.is_empty()) {
            (true, true) => return Err(WorkflowError::Shape("workflow has no steps".into())),
            (false, false) => {
                return Err(WorkflowError::Shape(
                    "workflow declares both `steps` and `nodes`".into(),
                ));
            }
            (true, false) => return Ok(self),
            (false, true) => {}
        }

        let steps = std::mem::take(&mut self.steps);
        let groups = group_consecutive_parallel(&steps);
        let mut edges = Vec::new();
        for window in groups.windows(2) {
            for &source in &window[0] {
                for &target in &window[1] {
                    edges.push(EdgeDef::new(
                        steps[source].id.clone(),
                        steps[target].id.clone(),
                    ));
                }
            }
        }
        self.nodes = steps;
        self.edges = edges;
        Ok(self)
    }
}

/// Partition step indices into chain groups: each non-parallel step is its
/// own group; maximal runs of `parallel: true` steps share one.
fn group_consecutive_parallel(steps: &[StepDef]) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (i, step) in steps.iter().enumerate() {
        if step.parallel {
            if let Some(last) = groups.last_mut() {
                if steps[last[0]].parallel {
                    last.push(i);
                    continue;
                }
            }
        }
        groups.push(vec![i]);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use aster_core::ModuleId;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn node_id(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    fn module(id: &str) -> ModuleId {
        ModuleId::new(id).unwrap()
    }

    const LINEAR: &str = r#"
name: chain
steps:
  - id: a
    module: string.uppercase
    params: {text: hi}
  - id: b
    module: string.reverse
    params: {text: "{{a.result}}"}
output:
  answer: "{{b.result}}"
"#;

    #[test]
    fn parse_linear_form_builds_chain() {
        let wf = Workflow::from_yaml(LINEAR).unwrap();
        assert_eq!(wf.nodes().len(), 2);
        assert_eq!(wf.edges().len(), 1);
        assert_eq!(wf.edges()[0].source_node, "a");
        assert_eq!(wf.edges()[0].target_node, "b");
        assert_eq!(wf.output["answer"], "{{b.result}}");
    }

    #[test]
    fn parse_graph_form() {
        let wf = Workflow::from_yaml(
            r#"
name: graph
nodes:
  - {id: s, module: flow.start}
  - {id: e, module: flow.end}
edges:
  - {source_node: s, target_node: e}
"#,
        )
        .unwrap();
        assert_eq!(wf.nodes().len(), 2);
        assert_eq!(wf.edges().len(), 1);
    }

    #[test]
    fn both_forms_rejected() {
        let err = Workflow::from_yaml(
            r#"
name: bad
steps:
  - {id: a, module: string.trim}
nodes:
  - {id: b, module: string.trim}
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("both"));
    }

    #[test]
    fn empty_rejected() {
        assert!(Workflow::from_yaml("name: empty\n").is_err());
    }

    #[test]
    fn parallel_run_fans_out_and_in() {
        let wf = Workflow::from_yaml(
            r#"
name: fan
steps:
  - {id: pre, module: string.trim}
  - {id: p1, module: http.get, parallel: true}
  - {id: p2, module: http.get, parallel: true}
  - {id: post, module: flow.end}
"#,
        )
        .unwrap();
        // pre→p1, pre→p2, p1→post, p2→post
        assert_eq!(wf.edges().len(), 4);
        let from_pre: Vec<_> = wf
            .edges()
            .iter()
            .filter(|e| e.source_node == "pre")
            .map(|e| e.target_node.as_str())
            .collect();
        assert_eq!(from_pre, vec!["p1", "p2"]);
        let into_post = wf
            .edges()
            .iter()
            .filter(|e| e.target_node == "post")
            .count();
        assert_eq!(into_post, 2);
    }

    #[test]
    fn roundtrip_normalized_forms_are_equal() {
        let wf = Workflow::from_yaml(LINEAR).unwrap();
        let yaml = wf.to_yaml().unwrap();
        let back = Workflow::from_yaml(&yaml).unwrap();
        assert_eq!(back, wf);
    }

    #[test]
    fn json_roundtrip() {
        let wf = Workflow::from_yaml(LINEAR).unwrap();
        let json = wf.to_json().unwrap();
        let back = Workflow::from_json(&json).unwrap();
        assert_eq!(back, wf);
    }

    #[test]
    fn builder_form() {
        let wf = Workflow::new("built")
            .with_node(StepDef::new(node_id("a"), module("string.trim")))
            .with_node(StepDef::new(node_id("b"), module("flow.end")))
            .with_edge(EdgeDef::new(node_id("a"), node_id("b")))
            .with_output("answer", "{{a.result}}");
        assert_eq!(wf.nodes().len(), 2);
        assert!(wf.node(&node_id("a")).is_some());
    }

    #[test]
    fn node_by_reference_resolves_alias() {
        let wf = Workflow::new("aliased").with_node(
            StepDef::new(node_id("fetch"), module("http.request")).with_output("response"),
        );
        assert!(wf.node_by_reference("response").is_some());
        assert!(wf.node_by_reference("fetch").is_some());
        assert!(wf.node_by_reference("nope").is_none());
    }

    #[test]
    fn config_defaults() {
        let wf = Workflow::from_yaml(LINEAR).unwrap();
        assert_eq!(wf.config.goto_ceiling, 100);
        assert_eq!(wf.config.max_parallel, 8);
        assert_eq!(wf.config.timeout_ms, None);
    }

    #[test]
    fn config_overrides() {
        let wf = Workflow::from_yaml(
            r#"
name: tuned
config:
  timeout_ms: 60000
  max_parallel: 2
  goto_ceiling: 10
steps:
  - {id: a, module: string.trim}
"#,
        )
        .unwrap();
        assert_eq!(wf.config.timeout_ms, Some(60_000));
        assert_eq!(wf.config.max_parallel, 2);
        assert_eq!(wf.config.goto_ceiling, 10);
    }

    // ── ParamDecl ───────────────────────────────────────────────────

    #[test]
    fn param_required_missing() {
        let decl = ParamDecl {
            required: true,
            ..ParamDecl::new("n")
        };
        assert!(decl.check(None).is_err());
    }

    #[test]
    fn param_default_applies() {
        let decl = ParamDecl {
            default: Some(json!(10)),
            ..ParamDecl::new("n")
        };
        assert_eq!(decl.check(None).unwrap(), json!(10));
    }

    #[test]
    fn param_type_mismatch() {
        let decl = ParamDecl {
            param_type: DataType::Number,
            ..ParamDecl::new("n")
        };
        assert!(decl.check(Some(&json!("five"))).is_err());
        assert_eq!(decl.check(Some(&json!(5))).unwrap(), json!(5));
    }

    #[test]
    fn param_constraint_violation() {
        let decl = ParamDecl {
            param_type: DataType::Number,
            constraints: Constraints {
                min: Some(1.0),
                ..Constraints::none()
            },
            ..ParamDecl::new("n")
        };
        assert!(decl.check(Some(&json!(0))).is_err());
    }

    #[test]
    fn param_optional_missing_is_null() {
        let decl = ParamDecl::new("n");
        assert_eq!(decl.check(None).unwrap(), Value::Null);
    }

    #[test]
    fn params_parse_in_order() {
        let wf = Workflow::from_yaml(
            r#"
name: with-params
params:
  - {name: n, type: number, required: true}
  - {name: label, type: string, default: "untitled"}
steps:
  - {id: a, module: string.trim}
"#,
        )
        .unwrap();
        assert_eq!(wf.params.len(), 2);
        assert_eq!(wf.params[0].name, "n");
        assert!(wf.params[0].required);
        assert_eq!(wf.params[1].default, Some(json!("untitled")));
    }
}
