//! Declarative value constraints.
//!
//! Shared by workflow parameter declarations and module parameter schemas.
//! A constraint set narrows an already type-checked value: numeric bounds,
//! an allowed-values list, or a regex pattern for strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Constraints applied to a parameter value after type checking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    /// Minimum numeric value (inclusive), or minimum string/array length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Maximum numeric value (inclusive), or maximum string/array length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Exhaustive list of allowed values.
    #[serde(
        default,
        rename = "enum",
        skip_serializing_if = "Option::is_none"
    )]
    pub one_of: Option<Vec<Value>>,
    /// Regex the string form must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl Constraints {
    /// An unconstrained set.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether no constraint is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none() && self.one_of.is_none() && self.pattern.is_none()
    }

    /// Check a value, returning a human-readable violation if any.
    ///
    /// `min`/`max` bound numbers by value and strings/arrays by length.
    /// A malformed `pattern` is reported as a violation rather than a panic.
    #[must_use]
    pub fn check(&self, value: &Value) -> Option<String> {
        if let Some(allowed) = &self.one_of {
            if !allowed.contains(value) {
                return Some(format!("value {value} is not one of the allowed values"));
            }
        }

        let magnitude = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => Some(s.chars().count() as f64),
            Value::Array(items) => Some(items.len() as f64),
            _ => None,
        };
        if let Some(m) = magnitude {
            if let Some(min) = self.min {
                if m < min {
                    return Some(format!("value {m} is below the minimum {min}"));
                }
            }
            if let Some(max) = self.max {
                if m > max {
                    return Some(format!("value {m} exceeds the maximum {max}"));
                }
            }
        }

        if let (Some(pattern), Value::String(s)) = (&self.pattern, value) {
            match regex::Regex::new(pattern) {
                Ok(re) => {
                    if !re.is_match(s) {
                        return Some(format!("value {s:?} does not match pattern {pattern:?}"));
                    }
                }
                Err(_) => return Some(format!("invalid constraint pattern {pattern:?}")),
            }
        }

        None
    }
}
