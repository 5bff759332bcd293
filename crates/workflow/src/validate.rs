//! Graph-level workflow validation.
//!
//! `validate` is a pure function over a normalized document: it never
//! touches the module registry. Registry-aware checks (start-capability,
//! port type compatibility) are layered on top by the engine, which has
//! both the document and the registry in scope.

use std::collections::{HashMap, HashSet};

use aster_core::{NodeId, RESERVED_STEP_IDS};
use aster_error::ErrorCode;
use aster_expression::{references_in_value, Template};
use serde_json::Value;

use crate::document::Workflow;
use crate::graph::DependencyGraph;
use crate::step::{OnError, StepDef};

/// One validation finding.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ValidationIssue {
    /// Stable error code.
    pub code: ErrorCode,
    /// Location inside the document (e.g. `nodes[2].id`).
    pub path: String,
    /// Human-readable explanation.
    pub message: String,
}

impl ValidationIssue {
    fn new(code: ErrorCode, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            path: path.into(),
            message: message.into(),
        }
    }
}

/// The outcome of validating one workflow document.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize)]
pub struct ValidationReport {
    /// Every finding, in discovery order.
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// Whether the document passed.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }

    /// Findings carrying a specific code.
    #[must_use]
    pub fn with_code(&self, code: ErrorCode) -> Vec<&ValidationIssue> {
        self.issues.iter().filter(|i| i.code == code).collect()
    }
}

/// Validate a normalized workflow document.
#[must_use]
pub fn validate(workflow: &Workflow) -> ValidationReport {
    let mut report = ValidationReport::default();

    check_step_ids(workflow, &mut report);
    check_goto_targets(workflow, &mut report);
    check_templates(workflow, &mut report);

    // Graph checks only make sense once edges resolve.
    match DependencyGraph::from_workflow(workflow) {
        Ok(graph) => {
            check_start_rules(workflow, &graph, &mut report);
            check_cycles(workflow, &graph, &mut report);
            check_orphans(workflow, &graph, &mut report);
            check_future_references(workflow, &graph, &mut report);
        }
        Err(err) => {
            report.issues.push(ValidationIssue::new(
                ErrorCode::ValidationError,
                "edges",
                err.to_string(),
            ));
        }
    }

    report
}

fn check_step_ids(workflow: &Workflow, report: &mut ValidationReport) {
    let mut seen: HashSet<&NodeId> = HashSet::new();
    for (i, node) in workflow.nodes().iter().enumerate() {
        if RESERVED_STEP_IDS.contains(&node.id.as_str()) {
            report.issues.push(ValidationIssue::new(
                ErrorCode::ValidationError,
                format!("nodes[{i}].id"),
                format!("step id {:?} is reserved", node.id.as_str()),
            ));
        }
        if !seen.insert(&node.id) {
            report.issues.push(ValidationIssue::new(
                ErrorCode::ValidationError,
                format!("nodes[{i}].id"),
                format!("duplicate step id {:?}", node.id.as_str()),
            ));
        }
    }
}

fn check_goto_targets(workflow: &Workflow, report: &mut ValidationReport) {
    for (i, node) in workflow.nodes().iter().enumerate() {
        if node.on_error == OnError::Goto {
            match &node.on_error_goto {
                None => report.issues.push(ValidationIssue::new(
                    ErrorCode::ValidationError,
                    format!("nodes[{i}].on_error_goto"),
                    "on_error: goto requires on_error_goto",
                )),
                Some(target) if workflow.node(target).is_none() => {
                    report.issues.push(ValidationIssue::new(
                        ErrorCode::ValidationError,
                        format!("nodes[{i}].on_error_goto"),
                        format!("unknown goto target {:?}", target.as_str()),
                    ));
                }
                Some(_) => {}
            }
        }

        // A literal flow.goto target must exist; templated targets resolve
        // at runtime.
        if node.module.as_str() == "flow.goto" {
            if let Some(Value::String(target)) = node.params.get("to") {
                if !target.contains("{{") && workflow.node_by_reference(target).is_none() {
                    report.issues.push(ValidationIssue::new(
                        ErrorCode::ValidationError,
                        format!("nodes[{i}].params.to"),
                        format!("unknown goto target {target:?}"),
                    ));
                }
            }
        }
    }
}

fn check_templates(workflow: &Workflow, report: &mut ValidationReport) {
    for (i, node) in workflow.nodes().iter().enumerate() {
        for (name, value) in &node.params {
            check_template_strings(value, &format!("nodes[{i}].params.{name}"), report);
        }
        if let Some(when) = &node.when {
            if let Err(err) = Template::parse(when.as_str()) {
                report.issues.push(ValidationIssue::new(
                    ErrorCode::ValidationError,
                    format!("nodes[{i}].when"),
                    err.to_string(),
                ));
            }
        }
        if let Some(foreach) = &node.foreach {
            if let Err(err) = Template::parse(foreach.as_str()) {
                report.issues.push(ValidationIssue::new(
                    ErrorCode::ValidationError,
                    format!("nodes[{i}].foreach"),
                    err.to_string(),
                ));
            }
        }
    }
    for (name, expr) in &workflow.output {
        if let Err(err) = Template::parse(expr.as_str()) {
            report.issues.push(ValidationIssue::new(
                ErrorCode::ValidationError,
                format!("output.{name}"),
                err.to_string(),
            ));
        }
    }
}

fn check_template_strings(value: &Value, path: &str, report: &mut ValidationReport) {
    match value {
        Value::String(s) => {
            if let Err(err) = Template::parse(s.as_str()) {
                report.issues.push(ValidationIssue::new(
                    ErrorCode::ValidationError,
                    path,
                    err.to_string(),
                ));
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                check_template_strings(item, &format!("{path}[{i}]"), report);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                check_template_strings(item, &format!("{path}.{key}"), report);
            }
        }
        _ => {}
    }
}

fn check_start_rules(workflow: &Workflow, graph: &DependencyGraph, report: &mut ValidationReport) {
    let explicit_starts: Vec<&StepDef> = workflow
        .nodes()
        .iter()
        .filter(|n| n.module.as_str() == "flow.start" || n.module.as_str() == "flow.trigger")
        .collect();

    // An explicit start with incoming edges cannot start the graph.
    for start in &explicit_starts {
        if !graph.predecessors(&start.id).is_empty() {
            report.issues.push(ValidationIssue::new(
                ErrorCode::InvalidStartNode,
                format!("nodes.{}", start.id),
                "start node has incoming edges",
            ));
        }
    }

    // At most one explicit start per connected component.
    if explicit_starts.len() > 1 {
        let components = connected_components(workflow);
        let mut per_component: HashMap<usize, Vec<&NodeId>> = HashMap::new();
        for start in &explicit_starts {
            if let Some(&component) = components.get(&start.id) {
                per_component.entry(component).or_default().push(&start.id);
            }
        }
        for starts in per_component.values() {
            if starts.len() > 1 {
                let names: Vec<&str> = starts.iter().map(|id| id.as_str()).collect();
                report.issues.push(ValidationIssue::new(
                    ErrorCode::MultipleStartNodes,
                    "nodes",
                    format!("multiple start nodes in one component: {}", names.join(", ")),
                ));
            }
        }
    }

    if graph.entry_nodes().is_empty() {
        report.issues.push(ValidationIssue::new(
            ErrorCode::NoStartNode,
            "nodes",
            "no node is free of incoming edges",
        ));
    }
}

fn check_cycles(workflow: &Workflow, graph: &DependencyGraph, report: &mut ValidationReport) {
    if let Some(cycle) = graph.find_unmediated_cycle(workflow) {
        let path: Vec<&str> = cycle.iter().map(NodeId::as_str).collect();
        report.issues.push(ValidationIssue::new(
            ErrorCode::CycleDetected,
            path.join(" -> "),
            "cycle is not mediated by flow.loop / flow.foreach / flow.goto",
        ));
    }
}

fn check_orphans(workflow: &Workflow, graph: &DependencyGraph, report: &mut ValidationReport) {
    let mut reachable: HashSet<NodeId> = HashSet::new();
    for entry in graph.entry_nodes() {
        reachable.insert(entry.clone());
        reachable.extend(graph.downstream_of(&entry));
    }
    if reachable.is_empty() {
        // NO_START_NODE was already reported; every node being an orphan
        // would only add noise.
        return;
    }
    for node in workflow.nodes() {
        if !reachable.contains(&node.id) {
            report.issues.push(ValidationIssue::new(
                ErrorCode::OrphanNode,
                format!("nodes.{}", node.id),
                "node is unreachable from any start node",
            ));
        }
    }
}

fn check_future_references(
    workflow: &Workflow,
    graph: &DependencyGraph,
    report: &mut ValidationReport,
) {
    // Names that resolve to a step (by id or alias).
    let mut step_names: HashMap<&str, &NodeId> = HashMap::new();
    for node in workflow.nodes() {
        step_names.insert(node.id.as_str(), &node.id);
        if let Some(alias) = &node.output {
            step_names.insert(alias.as_str(), &node.id);
        }
    }

    for (i, node) in workflow.nodes().iter().enumerate() {
        let ancestors = graph.ancestors_of(&node.id);
        let params_value = Value::Object(
            node.params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        let mut refs = references_in_value(&params_value);
        if let Some(when) = &node.when {
            if let Ok(template) = Template::parse(when.as_str()) {
                refs.extend(template.references());
            }
        }
        if let Some(foreach) = &node.foreach {
            if let Ok(template) = Template::parse(foreach.as_str()) {
                refs.extend(template.references());
            }
        }

        for reference in refs {
            if reference == node.iter_var {
                continue;
            }
            let Some(&target) = step_names.get(reference.as_str()) else {
                continue; // unknown names resolve to null at runtime
            };
            if target == &node.id || !ancestors.contains(target) {
                report.issues.push(ValidationIssue::new(
                    ErrorCode::ValidationError,
                    format!("nodes[{i}].params"),
                    format!(
                        "step {:?} references {:?}, which is not an ancestor",
                        node.id.as_str(),
                        reference
                    ),
                ));
            }
        }
    }
}

/// Undirected connected components over the workflow's edges.
fn connected_components(workflow: &Workflow) -> HashMap<NodeId, usize> {
    let mut component: HashMap<NodeId, usize> = HashMap::new();
    let mut adjacency: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
    for edge in workflow.edges() {
        adjacency
            .entry(&edge.source_node)
            .or_default()
            .push(&edge.target_node);
        adjacency
            .entry(&edge.target_node)
            .or_default()
            .push(&edge.source_node);
    }

    let mut next_component = 0;
    for node in workflow.nodes() {
        if component.contains_key(&node.id) {
            continue;
        }
        let id = next_component;
        next_component += 1;
        let mut stack = vec![&node.id];
        while let Some(current) = stack.pop() {
            if component.insert(current.clone(), id).is_some() {
                continue;
            }
            if let Some(neighbors) = adjacency.get(current) {
                for &neighbor in neighbors {
                    if !component.contains_key(neighbor) {
                        stack.push(neighbor);
                    }
                }
            }
        }
    }
    component
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::EdgeDef;
    use aster_core::ModuleId;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn nid(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    fn step(id: &str, module: &str) -> StepDef {
        StepDef::new(nid(id), ModuleId::new(module).unwrap())
    }

    #[test]
    fn valid_linear_workflow_passes() {
        let wf = Workflow::from_yaml(
            r#"
name: ok
steps:
  - {id: a, module: string.uppercase, params: {text: hi}}
  - {id: b, module: string.reverse, params: {text: "{{a.result}}"}}
"#,
        )
        .unwrap();
        let report = validate(&wf);
        assert!(report.is_ok(), "unexpected issues: {:?}", report.issues);
    }

    #[test]
    fn duplicate_ids_rejected() {
        let wf = Workflow::new("dup")
            .with_node(step("a", "string.trim"))
            .with_node(step("a", "string.trim"));
        let report = validate(&wf);
        assert!(!report.is_ok());
        assert_eq!(report.with_code(ErrorCode::ValidationError).len(), 1);
        assert!(report.issues[0].message.contains("duplicate"));
    }

    #[test]
    fn reserved_id_rejected() {
        let wf = Workflow::new("reserved").with_node(step("params", "string.trim"));
        let report = validate(&wf);
        assert!(report.issues[0].message.contains("reserved"));
    }

    #[test]
    fn cycle_detected() {
        let wf = Workflow::new("cyclic")
            .with_node(step("a", "string.trim"))
            .with_node(step("b", "string.trim"))
            .with_node(step("c", "string.trim"))
            .with_edge(EdgeDef::new(nid("a"), nid("b")))
            .with_edge(EdgeDef::new(nid("b"), nid("c")))
            .with_edge(EdgeDef::new(nid("c"), nid("a")));
        let report = validate(&wf);
        let cycles = report.with_code(ErrorCode::CycleDetected);
        assert_eq!(cycles.len(), 1);
        assert!(cycles[0].path.contains("->"));
        // All three nodes sit on the cycle; NO_START_NODE fires too.
        assert_eq!(report.with_code(ErrorCode::NoStartNode).len(), 1);
    }

    #[test]
    fn loop_mediated_cycle_passes() {
        let wf = Workflow::new("looped")
            .with_node(step("entry", "string.trim"))
            .with_node(step("loop", "flow.loop").with_param("times", json!(3)))
            .with_node(step("body", "string.trim"))
            .with_edge(EdgeDef::new(nid("entry"), nid("loop")))
            .with_edge(
                EdgeDef::new(nid("loop"), nid("body"))
                    .with_semantics(aster_core::PortSemantics::Iterate),
            )
            .with_edge(EdgeDef::new(nid("body"), nid("loop")));
        let report = validate(&wf);
        assert!(report.with_code(ErrorCode::CycleDetected).is_empty());
    }

    #[test]
    fn orphan_node_detected() {
        let wf = Workflow::new("orphans")
            .with_node(step("a", "string.trim"))
            .with_node(step("x", "string.trim"))
            .with_node(step("y", "string.trim"))
            .with_edge(EdgeDef::new(nid("x"), nid("y")))
            .with_edge(EdgeDef::new(nid("y"), nid("x")));
        let report = validate(&wf);
        // x and y form an unreachable cycle island.
        assert_eq!(report.with_code(ErrorCode::OrphanNode).len(), 2);
        assert_eq!(report.with_code(ErrorCode::CycleDetected).len(), 1);
    }

    #[test]
    fn multiple_starts_in_one_component() {
        let wf = Workflow::new("starts")
            .with_node(step("s1", "flow.start"))
            .with_node(step("s2", "flow.start"))
            .with_node(step("join", "flow.end"))
            .with_edge(EdgeDef::new(nid("s1"), nid("join")))
            .with_edge(EdgeDef::new(nid("s2"), nid("join")));
        let report = validate(&wf);
        assert_eq!(report.with_code(ErrorCode::MultipleStartNodes).len(), 1);
    }

    #[test]
    fn starts_in_separate_components_are_fine() {
        let wf = Workflow::new("two-flows")
            .with_node(step("s1", "flow.start"))
            .with_node(step("e1", "flow.end"))
            .with_node(step("s2", "flow.start"))
            .with_node(step("e2", "flow.end"))
            .with_edge(EdgeDef::new(nid("s1"), nid("e1")))
            .with_edge(EdgeDef::new(nid("s2"), nid("e2")));
        let report = validate(&wf);
        assert!(report.with_code(ErrorCode::MultipleStartNodes).is_empty());
    }

    #[test]
    fn start_with_incoming_edge_invalid() {
        let wf = Workflow::new("bad-start")
            .with_node(step("a", "string.trim"))
            .with_node(step("s", "flow.start"))
            .with_edge(EdgeDef::new(nid("a"), nid("s")));
        let report = validate(&wf);
        assert_eq!(report.with_code(ErrorCode::InvalidStartNode).len(), 1);
    }

    #[test]
    fn goto_without_target_rejected() {
        let wf = Workflow::new("goto").with_node(
            StepDef::new(nid("a"), ModuleId::new("db.query").unwrap())
                .with_on_error(OnError::Goto),
        );
        let report = validate(&wf);
        assert!(report.issues[0].message.contains("on_error_goto"));
    }

    #[test]
    fn goto_unknown_target_rejected() {
        let mut bad = step("a", "db.query").with_on_error(OnError::Goto);
        bad.on_error_goto = Some(nid("ghost"));
        let wf = Workflow::new("goto").with_node(bad);
        let report = validate(&wf);
        assert!(report.issues[0].message.contains("ghost"));
    }

    #[test]
    fn flow_goto_literal_target_checked() {
        let wf = Workflow::new("jump")
            .with_node(step("a", "string.trim"))
            .with_node(step("jump", "flow.goto").with_param("to", json!("ghost")))
            .with_edge(EdgeDef::new(nid("a"), nid("jump")));
        let report = validate(&wf);
        assert!(report
            .issues
            .iter()
            .any(|i| i.path == "nodes[1].params.to"));
    }

    #[test]
    fn future_reference_rejected() {
        let wf = Workflow::new("future")
            .with_node(step("a", "string.trim").with_param("text", json!("{{b.result}}")))
            .with_node(step("b", "string.trim"))
            .with_edge(EdgeDef::new(nid("a"), nid("b")));
        let report = validate(&wf);
        assert!(report
            .issues
            .iter()
            .any(|i| i.message.contains("not an ancestor")));
    }

    #[test]
    fn self_reference_rejected() {
        let wf = Workflow::new("selfref")
            .with_node(step("a", "string.trim").with_param("text", json!("{{a.result}}")));
        let report = validate(&wf);
        assert!(!report.is_ok());
    }

    #[test]
    fn iteration_variable_is_not_a_future_reference() {
        let wf = Workflow::new("foreach")
            .with_node(step("items", "data.list"))
            .with_node(
                step("each", "math.divide")
                    .with_foreach("{{items.result}}")
                    .with_param("b", json!("{{item}}")),
            )
            .with_edge(EdgeDef::new(nid("items"), nid("each")));
        let report = validate(&wf);
        assert!(report.is_ok(), "unexpected issues: {:?}", report.issues);
    }

    #[test]
    fn alias_reference_is_resolved() {
        let wf = Workflow::new("alias")
            .with_node(step("fetch", "http.request").with_output("response"))
            .with_node(step("use", "string.trim").with_param("text", json!("{{response.body}}")))
            .with_edge(EdgeDef::new(nid("fetch"), nid("use")));
        let report = validate(&wf);
        assert!(report.is_ok(), "unexpected issues: {:?}", report.issues);
    }

    #[test]
    fn malformed_template_reported() {
        let wf = Workflow::new("bad-template")
            .with_node(step("a", "string.trim").with_param("text", json!("{{unterminated")));
        let report = validate(&wf);
        assert!(report
            .issues
            .iter()
            .any(|i| i.path == "nodes[0].params.text"));
    }

    #[test]
    fn unknown_reference_name_is_allowed() {
        // Missing paths resolve to null at runtime; only references to
        // known-but-not-ancestor steps are errors.
        let wf = Workflow::new("unknown-ref")
            .with_node(step("a", "string.trim").with_param("text", json!("{{nonexistent.x}}")));
        let report = validate(&wf);
        assert!(report.is_ok());
    }
}
