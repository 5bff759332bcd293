//! Variable-catalog introspection.
//!
//! Answers the editor/planner question "what can `{{...}}` reach from this
//! node?": every reachable ancestor with its output fields, typed from the
//! module's output schema in edit mode and decorated with trace-observed
//! values in runtime mode.

use aster_core::{DataType, NodeId};
use aster_execution::ExecutionContext;
use aster_registry::{RegistrySnapshot, VarCatalog, VarEntry, VarField};
use aster_workflow::{DependencyGraph, Workflow};
use serde_json::Value;

/// Build the edit-mode catalog: types inferred from output schemas.
pub fn edit_catalog(
    workflow: &Workflow,
    graph: &DependencyGraph,
    snapshot: &RegistrySnapshot,
    node: &NodeId,
) -> VarCatalog {
    build(workflow, graph, snapshot, node, None)
}

/// Build the runtime-mode catalog: observed values from an execution.
pub fn runtime_catalog(
    workflow: &Workflow,
    graph: &DependencyGraph,
    snapshot: &RegistrySnapshot,
    node: &NodeId,
    ctx: &ExecutionContext,
) -> VarCatalog {
    build(workflow, graph, snapshot, node, Some(ctx))
}

fn build(
    workflow: &Workflow,
    graph: &DependencyGraph,
    snapshot: &RegistrySnapshot,
    node: &NodeId,
    ctx: Option<&ExecutionContext>,
) -> VarCatalog {
    let ancestors = graph.ancestors_of(node);

    // Walk nodes in declaration order; the document keeps a stable,
    // human-meaningful ordering for editors.
    let mut entries = Vec::new();
    for step in workflow.nodes() {
        if !ancestors.contains(&step.id) {
            continue;
        }
        let observed_data = ctx
            .and_then(|c| c.step_output(&step.id))
            .map(|result| result.data);

        let mut fields = Vec::new();
        if let Ok(metadata) = snapshot.metadata(&step.module) {
            for (name, spec) in &metadata.output_schema {
                fields.push(VarField {
                    name: name.clone(),
                    data_type: spec.field_type,
                    observed: observed_data
                        .as_ref()
                        .and_then(|data| data.get(name))
                        .cloned(),
                });
            }
        }
        // Runtime mode may observe fields the schema never declared.
        if fields.is_empty() {
            if let Some(Value::Object(map)) = &observed_data {
                for (name, value) in map {
                    fields.push(VarField {
                        name: name.clone(),
                        data_type: DataType::Any,
                        observed: Some(value.clone()),
                    });
                }
            }
        }

        entries.push(VarEntry {
            node_id: step.id.clone(),
            reference_name: step.reference_name().to_owned(),
            module_id: step.module.clone(),
            fields,
        });
    }

    VarCatalog {
        node_id: Some(node.clone()),
        entries,
        params: workflow.params.iter().map(|p| p.name.clone()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aster_core::ExecutionId;
    use aster_execution::StepResult;
    use aster_registry::{ModuleMetadata, ModuleRegistry, OutputField, ParamSpec};
    use aster_workflow::{EdgeDef, ParamDecl, StepDef};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    struct Stub;

    #[async_trait::async_trait]
    impl aster_registry::ModuleHandler for Stub {
        async fn invoke(
            &self,
            _call: aster_registry::ModuleCall,
        ) -> Result<aster_registry::ModuleResponse, aster_error::StepError> {
            Ok(aster_registry::ModuleResponse::success(Value::Null))
        }
    }

    fn nid(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    fn fixture() -> (Workflow, DependencyGraph, RegistrySnapshot) {
        let registry = ModuleRegistry::new();
        registry
            .register(
                ModuleMetadata::new("http.request", "HTTP", "Fetches")
                    .with_param("url", ParamSpec::string().required())
                    .with_output_field("body", OutputField::of(DataType::String))
                    .with_output_field("status", OutputField::of(DataType::Number)),
                Arc::new(Stub),
            )
            .unwrap();
        registry
            .register(
                ModuleMetadata::new("string.trim", "Trim", "Trims"),
                Arc::new(Stub),
            )
            .unwrap();

        let workflow = Workflow::new("demo")
            .with_param(ParamDecl::new("n"))
            .with_node(
                StepDef::new(nid("fetch"), "http.request".parse().unwrap())
                    .with_output("response"),
            )
            .with_node(StepDef::new(nid("use"), "string.trim".parse().unwrap()))
            .with_node(StepDef::new(nid("other"), "string.trim".parse().unwrap()))
            .with_edge(EdgeDef::new(nid("fetch"), nid("use")))
            .with_edge(EdgeDef::new(nid("fetch"), nid("other")));
        let graph = DependencyGraph::from_workflow(&workflow).unwrap();
        (workflow, graph, registry.snapshot())
    }

    #[test]
    fn edit_mode_lists_ancestor_fields() {
        let (workflow, graph, snapshot) = fixture();
        let catalog = edit_catalog(&workflow, &graph, &snapshot, &nid("use"));

        assert_eq!(catalog.node_id, Some(nid("use")));
        assert_eq!(catalog.params, vec!["n"]);
        assert_eq!(catalog.entries.len(), 1);
        let entry = &catalog.entries[0];
        assert_eq!(entry.reference_name, "response");
        assert_eq!(entry.fields.len(), 2);
        assert_eq!(entry.fields[0].name, "body");
        assert_eq!(entry.fields[0].data_type, DataType::String);
        assert!(entry.fields[0].observed.is_none());
    }

    #[test]
    fn siblings_are_not_ancestors() {
        let (workflow, graph, snapshot) = fixture();
        let catalog = edit_catalog(&workflow, &graph, &snapshot, &nid("other"));
        // Only `fetch`; `use` is a sibling, not an ancestor.
        assert_eq!(catalog.entries.len(), 1);
        assert_eq!(catalog.entries[0].node_id, nid("fetch"));
    }

    #[test]
    fn runtime_mode_attaches_observed_values() {
        let (workflow, graph, snapshot) = fixture();
        let ctx = ExecutionContext::new(ExecutionId::v4(), "wf", "demo");
        ctx.insert_step_output(
            nid("fetch"),
            StepResult::success(json!({"body": "<html>", "status": 200})),
        )
        .unwrap();

        let catalog = runtime_catalog(&workflow, &graph, &snapshot, &nid("use"), &ctx);
        let entry = &catalog.entries[0];
        assert_eq!(entry.fields[0].observed, Some(json!("<html>")));
        assert_eq!(entry.fields[1].observed, Some(json!(200)));
    }

    #[test]
    fn runtime_mode_derives_undeclared_fields() {
        let (workflow, _graph, snapshot) = fixture();
        let ctx = ExecutionContext::new(ExecutionId::v4(), "wf", "demo");
        // `string.trim` declares no output schema; fields come from data.
        let workflow = workflow
            .with_node(StepDef::new(nid("tail"), "string.trim".parse().unwrap()))
            .with_edge(EdgeDef::new(nid("use"), nid("tail")));
        let graph2 = DependencyGraph::from_workflow(&workflow).unwrap();
        ctx.insert_step_output(nid("use"), StepResult::success(json!({"result": "x"})))
            .unwrap();

        let catalog = runtime_catalog(&workflow, &graph2, &snapshot, &nid("tail"), &ctx);
        let use_entry = catalog
            .entries
            .iter()
            .find(|e| e.node_id == nid("use"))
            .unwrap();
        assert_eq!(use_entry.fields.len(), 1);
        assert_eq!(use_entry.fields[0].name, "result");
        assert_eq!(use_entry.fields[0].data_type, DataType::Any);
    }
}
