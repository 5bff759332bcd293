//! Step (node) definitions.

use aster_core::{ModuleId, NodeId};
use aster_error::ErrorCode;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// What to do when a step fails terminally (after retries).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Abort the execution with the step's error.
    #[default]
    Fail,
    /// Keep scheduling; downstream receives the error payload.
    Continue,
    /// Keep scheduling; downstream receives no payload from this step.
    Skip,
    /// Jump to the node named by `on_error_goto`.
    Goto,
}

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Constant delay.
    #[default]
    None,
    /// `delay_ms * attempt` (1-based).
    Linear,
    /// `delay_ms * 2^(attempt-1)`.
    Exponential,
}

/// Retry policy for a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of *additional* attempts after the first; `0` means exactly
    /// one attempt.
    pub count: u32,
    /// Base delay between attempts, in milliseconds.
    #[serde(default)]
    pub delay_ms: u64,
    /// Backoff strategy applied to `delay_ms`.
    #[serde(default)]
    pub backoff: Backoff,
    /// Extra error codes retryable for this step, beyond the default set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_on: Vec<ErrorCode>,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based: the delay after the
    /// first failed attempt is `retry = 0`).
    #[must_use]
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        let ms = match self.backoff {
            Backoff::None => self.delay_ms,
            Backoff::Linear => self.delay_ms.saturating_mul(u64::from(retry) + 1),
            Backoff::Exponential => self
                .delay_ms
                .saturating_mul(1u64.checked_shl(retry).unwrap_or(u64::MAX)),
        };
        Duration::from_millis(ms)
    }
}

/// How foreach aggregates its per-iteration results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Aggregate every iteration's result into an array.
    #[default]
    Collect,
    /// Keep only the final iteration's result.
    Last,
    /// Discard iteration results.
    None,
}

fn default_iter_var() -> String {
    "item".to_owned()
}

fn iter_var_is_default(value: &str) -> bool {
    value == "item"
}

/// One step of a workflow: a module invocation with its wiring attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
    /// Unique id within the workflow.
    pub id: NodeId,
    /// The module this step invokes.
    pub module: ModuleId,
    /// Literal values or `{{expr}}` references, resolved at execution time.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub params: IndexMap<String, Value>,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Output alias: downstream steps may reference this name instead of
    /// the step id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Guard expression; falsy skips the step.
    #[serde(default, alias = "if", skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Terminal-failure policy.
    #[serde(default, skip_serializing_if = "is_default_on_error")]
    pub on_error: OnError,
    /// Jump target when `on_error` is [`OnError::Goto`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error_goto: Option<NodeId>,
    /// Step timeout in milliseconds; `0` disables the executor timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Retry policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Iterable expression; when set, the step runs once per element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreach: Option<String>,
    /// Name of the iteration variable inside `foreach` bodies.
    #[serde(
        default = "default_iter_var",
        rename = "as",
        skip_serializing_if = "iter_var_is_default"
    )]
    pub iter_var: String,
    /// Aggregation mode for foreach results.
    #[serde(default, skip_serializing_if = "is_default_output_mode")]
    pub output_mode: OutputMode,
    /// Membership in a consecutive parallel group.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub parallel: bool,
}

fn is_default_on_error(value: &OnError) -> bool {
    *value == OnError::Fail
}

fn is_default_output_mode(value: &OutputMode) -> bool {
    *value == OutputMode::Collect
}

impl StepDef {
    /// Create a minimal step.
    #[must_use]
    pub fn new(id: NodeId, module: ModuleId) -> Self {
        Self {
            id,
            module,
            params: IndexMap::new(),
            description: None,
            output: None,
            when: None,
            on_error: OnError::Fail,
            on_error_goto: None,
            timeout: None,
            retry: None,
            foreach: None,
            iter_var: default_iter_var(),
            output_mode: OutputMode::Collect,
            parallel: false,
        }
    }

    /// Set a parameter.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    /// Set the guard expression.
    #[must_use]
    pub fn with_when(mut self, expr: impl Into<String>) -> Self {
        self.when = Some(expr.into());
        self
    }

    /// Set the terminal-failure policy.
    #[must_use]
    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set the foreach iterable.
    #[must_use]
    pub fn with_foreach(mut self, iterable: impl Into<String>) -> Self {
        self.foreach = Some(iterable.into());
        self
    }

    /// Mark as a parallel-group member.
    #[must_use]
    pub fn with_parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    /// Set the output alias.
    #[must_use]
    pub fn with_output(mut self, alias: impl Into<String>) -> Self {
        self.output = Some(alias.into());
        self
    }

    /// The name downstream references resolve against: the alias if set,
    /// otherwise the step id.
    #[must_use]
    pub fn reference_name(&self) -> &str {
        self.output.as_deref().unwrap_or(self.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    fn step(yaml: &str) -> StepDef {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn minimal_step_from_yaml() {
        let s = step("id: a\nmodule: string.uppercase\nparams:\n  text: hi\n");
        assert_eq!(s.id, "a");
        assert_eq!(s.module.as_str(), "string.uppercase");
        assert_eq!(s.params["text"], json!("hi"));
        assert_eq!(s.on_error, OnError::Fail);
        assert_eq!(s.iter_var, "item");
        assert!(!s.parallel);
    }

    #[test]
    fn if_is_alias_for_when() {
        let s = step("id: a\nmodule: flow.end\nif: \"{{params.go}}\"\n");
        assert_eq!(s.when.as_deref(), Some("{{params.go}}"));
    }

    #[test]
    fn foreach_with_as() {
        let s = step(
            "id: a\nmodule: math.divide\nforeach: \"{{params.items}}\"\nas: elem\noutput_mode: last\n",
        );
        assert_eq!(s.foreach.as_deref(), Some("{{params.items}}"));
        assert_eq!(s.iter_var, "elem");
        assert_eq!(s.output_mode, OutputMode::Last);
    }

    #[test]
    fn retry_policy_from_yaml() {
        let s = step(
            "id: a\nmodule: http.get\nretry:\n  count: 3\n  delay_ms: 100\n  backoff: exponential\n  retry_on: [NETWORK_ERROR]\n",
        );
        let retry = s.retry.unwrap();
        assert_eq!(retry.count, 3);
        assert_eq!(retry.backoff, Backoff::Exponential);
        assert_eq!(retry.retry_on, vec![ErrorCode::NetworkError]);
    }

    #[rstest]
    #[case(Backoff::None, 0, 100)]
    #[case(Backoff::None, 3, 100)]
    #[case(Backoff::Linear, 0, 100)]
    #[case(Backoff::Linear, 2, 300)]
    #[case(Backoff::Exponential, 0, 100)]
    #[case(Backoff::Exponential, 1, 200)]
    #[case(Backoff::Exponential, 3, 800)]
    fn retry_delays(#[case] backoff: Backoff, #[case] retry: u32, #[case] expect_ms: u64) {
        let policy = RetryPolicy {
            count: 5,
            delay_ms: 100,
            backoff,
            retry_on: vec![],
        };
        assert_eq!(
            policy.delay_before_retry(retry),
            Duration::from_millis(expect_ms)
        );
    }

    #[test]
    fn exponential_delay_saturates() {
        let policy = RetryPolicy {
            count: 200,
            delay_ms: u64::MAX / 2,
            backoff: Backoff::Exponential,
            retry_on: vec![],
        };
        // Must not overflow.
        let _ = policy.delay_before_retry(90);
    }

    #[test]
    fn reference_name_prefers_alias() {
        let s = StepDef::new(
            NodeId::new("fetch").unwrap(),
            ModuleId::new("http.request").unwrap(),
        )
        .with_output("response");
        assert_eq!(s.reference_name(), "response");
    }

    #[test]
    fn serde_roundtrip_skips_defaults() {
        let s = StepDef::new(
            NodeId::new("a").unwrap(),
            ModuleId::new("string.reverse").unwrap(),
        )
        .with_param("text", json!("{{a.result}}"));
        let json = serde_json::to_value(&s).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 3); // id, module, params
        let back: StepDef = serde_json::from_value(json).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn goto_policy() {
        let s = step("id: a\nmodule: db.query\non_error: goto\non_error_goto: cleanup\n");
        assert_eq!(s.on_error, OnError::Goto);
        assert_eq!(s.on_error_goto.as_ref().unwrap(), "cleanup");
    }
}
