//! Evaluation context — the resolver's view of execution state.
//!
//! The engine constructs one [`EvalContext`] per resolution site from the
//! public context layer only. There is deliberately no way to hand the
//! resolver a private or secrets layer; those namespaces simply do not
//! exist here, so references into them resolve as missing.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::path::{Path, Segment};

/// Source of completed step outputs, keyed by node id or output alias.
pub trait OutputSource {
    /// The resolved `data` of a completed step, or `None` if the step has
    /// not completed (or the name is unknown).
    fn output(&self, name: &str) -> Option<Value>;
}

/// An [`OutputSource`] with no outputs; useful for validation and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOutputs;

impl OutputSource for NoOutputs {
    fn output(&self, _name: &str) -> Option<Value> {
        None
    }
}

impl OutputSource for serde_json::Map<String, Value> {
    fn output(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// The layered lookup state a template renders against.
pub struct EvalContext<'a> {
    params: &'a serde_json::Map<String, Value>,
    env: &'a BTreeMap<String, String>,
    workflow_id: &'a str,
    workflow_name: &'a str,
    outputs: &'a dyn OutputSource,
    locals: serde_json::Map<String, Value>,
    strict: bool,
}

impl<'a> EvalContext<'a> {
    /// Create a context over the public view of an execution.
    ///
    /// `env` must already be filtered down to the configured allowlist.
    #[must_use]
    pub fn new(
        params: &'a serde_json::Map<String, Value>,
        env: &'a BTreeMap<String, String>,
        workflow_id: &'a str,
        workflow_name: &'a str,
        outputs: &'a dyn OutputSource,
    ) -> Self {
        Self {
            params,
            env,
            workflow_id,
            workflow_name,
            outputs,
            locals: serde_json::Map::new(),
            strict: false,
        }
    }

    /// Add an iteration-scoped variable (e.g. foreach `item` / `index`).
    ///
    /// Locals take precedence over every namespace.
    #[must_use]
    pub fn with_local(mut self, name: impl Into<String>, value: Value) -> Self {
        self.locals.insert(name.into(), value);
        self
    }

    /// Enable strict mode: unresolved references become errors instead of
    /// `null`.
    #[must_use]
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Whether strict mode is enabled.
    #[must_use]
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Resolve a parsed path to a value, or `None` if any part is missing.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> Option<Value> {
        let head = path.head();
        let tail = path.tail();

        if let Some(local) = self.locals.get(head) {
            return Path::walk(local, tail).cloned();
        }

        match head {
            "params" => {
                let root = Value::Object(self.params.clone());
                Path::walk(&root, tail).cloned()
            }
            "env" => match tail {
                [Segment::Field(name)] | [Segment::Key(name)] => {
                    self.env.get(name).map(|v| Value::String(v.clone()))
                }
                [] => Some(Value::Object(
                    self.env
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                        .collect(),
                )),
                _ => None,
            },
            "timestamp" if tail.is_empty() => Some(unix_timestamp()),
            "workflow" => {
                let root = serde_json::json!({
                    "id": self.workflow_id,
                    "name": self.workflow_name,
                });
                Path::walk(&root, tail).cloned()
            }
            step => {
                let data = self.outputs.output(step)?;
                Path::walk(&data, tail).cloned()
            }
        }
    }
}

fn unix_timestamp() -> Value {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    serde_json::Number::from_f64(secs).map_or(Value::Null, Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn params() -> serde_json::Map<String, Value> {
        json!({"n": 5, "user": {"name": "ada"}})
            .as_object()
            .unwrap()
            .clone()
    }

    fn env() -> BTreeMap<String, String> {
        BTreeMap::from([("HOME".to_owned(), "/home/ada".to_owned())])
    }

    fn outputs() -> serde_json::Map<String, Value> {
        json!({"a": {"result": "HI"}, "items": [1, 2, 3]})
            .as_object()
            .unwrap()
            .clone()
    }

    fn resolve(path: &str) -> Option<Value> {
        let params = params();
        let env = env();
        let outputs = outputs();
        let ctx = EvalContext::new(&params, &env, "wf-1", "demo", &outputs);
        ctx.resolve(&Path::parse(path).unwrap())
    }

    #[test]
    fn params_namespace() {
        assert_eq!(resolve("params.n"), Some(json!(5)));
        assert_eq!(resolve("params.user.name"), Some(json!("ada")));
    }

    #[test]
    fn whole_params_object() {
        assert_eq!(resolve("params"), Some(json!({"n": 5, "user": {"name": "ada"}})));
    }

    #[test]
    fn env_namespace() {
        assert_eq!(resolve("env.HOME"), Some(json!("/home/ada")));
        assert_eq!(resolve("env.MISSING"), None);
    }

    #[test]
    fn workflow_builtins() {
        assert_eq!(resolve("workflow.id"), Some(json!("wf-1")));
        assert_eq!(resolve("workflow.name"), Some(json!("demo")));
    }

    #[test]
    fn timestamp_is_number() {
        let value = resolve("timestamp").unwrap();
        assert!(value.as_f64().unwrap() > 1_500_000_000.0);
    }

    #[test]
    fn step_outputs() {
        assert_eq!(resolve("a.result"), Some(json!("HI")));
        assert_eq!(resolve("items[2]"), Some(json!(3)));
    }

    #[test]
    fn unknown_step_is_missing() {
        assert_eq!(resolve("nope.result"), None);
    }

    #[test]
    fn locals_take_precedence() {
        let params = params();
        let env = env();
        let outputs = outputs();
        let ctx = EvalContext::new(&params, &env, "wf-1", "demo", &outputs)
            .with_local("item", json!(42))
            // Shadows the `a` step output.
            .with_local("a", json!({"result": "local"}));
        assert_eq!(
            ctx.resolve(&Path::parse("item").unwrap()),
            Some(json!(42))
        );
        assert_eq!(
            ctx.resolve(&Path::parse("a.result").unwrap()),
            Some(json!("local"))
        );
    }

    #[test]
    fn private_and_secrets_do_not_exist() {
        // There is no namespace for either layer; lookups miss.
        assert_eq!(resolve("secrets.api_key"), None);
        assert_eq!(resolve("private.tenant_id"), None);
    }
}
