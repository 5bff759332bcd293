//! Parameter and output schemas, and resolved-parameter validation.
//!
//! Validation runs after variable resolution: alias names are normalized
//! to their canonical form, required presence is enforced, then type and
//! constraint checks apply. Failures surface as `VALIDATION_ERROR` with
//! the offending field attached.

use aster_core::{Constraints, DataType};
use aster_error::StepError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Schema for one module parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Declared type.
    #[serde(rename = "type", default = "default_type")]
    pub param_type: DataType,
    /// Whether the parameter must be present (after defaults).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
    /// Default applied when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Value constraints.
    #[serde(default, skip_serializing_if = "Constraints::is_empty")]
    pub constraints: Constraints,
    /// Editor hint: render a multiline input.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub multiline: bool,
    /// Editor hint: fixed choice list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<Value>,
    /// Alternate names normalized to this parameter's canonical name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    /// Format hint; `"password"` values are redacted in logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Description (English fallback).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_type() -> DataType {
    DataType::Any
}

impl ParamSpec {
    /// A parameter of the given type.
    #[must_use]
    pub fn of(param_type: DataType) -> Self {
        Self {
            param_type,
            required: false,
            default: None,
            constraints: Constraints::none(),
            multiline: false,
            options: Vec::new(),
            aliases: Vec::new(),
            format: None,
            description: None,
        }
    }

    /// A string parameter.
    #[must_use]
    pub fn string() -> Self {
        Self::of(DataType::String)
    }

    /// A number parameter.
    #[must_use]
    pub fn number() -> Self {
        Self::of(DataType::Number)
    }

    /// A boolean parameter.
    #[must_use]
    pub fn boolean() -> Self {
        Self::of(DataType::Boolean)
    }

    /// Mark required.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Set a default.
    #[must_use]
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Set constraints.
    #[must_use]
    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Add an alias.
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// Set the format hint.
    #[must_use]
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Whether log output must redact this parameter's value.
    #[must_use]
    pub fn is_secret(&self) -> bool {
        self.format.as_deref() == Some("password")
    }
}

/// Schema for one output field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputField {
    /// Declared type.
    #[serde(rename = "type", default = "default_type")]
    pub field_type: DataType,
    /// Description (English fallback).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// i18n key for the description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_key: Option<String>,
}

impl OutputField {
    /// A field of the given type.
    #[must_use]
    pub fn of(field_type: DataType) -> Self {
        Self {
            field_type,
            description: None,
            description_key: None,
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Normalize aliases to canonical names, apply defaults, and validate.
///
/// Returns the canonicalized parameter map. Unknown parameters pass
/// through untouched — modules may accept open-ended extras.
pub fn validate_params(
    schema: &IndexMap<String, ParamSpec>,
    supplied: &serde_json::Map<String, Value>,
) -> Result<serde_json::Map<String, Value>, StepError> {
    let mut canonical = serde_json::Map::new();

    // Alias normalization: copy values under their canonical names.
    for (name, value) in supplied {
        let canonical_name = schema
            .iter()
            .find_map(|(canon, spec)| {
                (canon == name || spec.aliases.iter().any(|a| a == name)).then_some(canon.clone())
            })
            .unwrap_or_else(|| name.clone());
        canonical.insert(canonical_name, value.clone());
    }

    for (name, spec) in schema {
        let present = canonical.get(name).filter(|v| !v.is_null()).cloned();
        let effective = match present {
            Some(value) => value,
            None => match &spec.default {
                Some(default) => default.clone(),
                None if spec.required => {
                    return Err(StepError::validation(format!(
                        "required parameter {name:?} is missing"
                    ))
                    .with_field(name.clone()));
                }
                None => continue,
            },
        };

        if !effective.is_null() && !spec.param_type.matches_value(&effective) {
            return Err(StepError::validation(format!(
                "parameter {name:?} expects {:?}",
                spec.param_type
            ))
            .with_field(name.clone()));
        }
        if let Some(violation) = spec.constraints.check(&effective) {
            return Err(StepError::validation(violation).with_field(name.clone()));
        }
        if !spec.options.is_empty() && !spec.options.contains(&effective) {
            return Err(StepError::validation(format!(
                "parameter {name:?} is not one of the allowed options"
            ))
            .with_field(name.clone()));
        }
        canonical.insert(name.clone(), effective);
    }

    Ok(canonical)
}

/// Redact values of `format: "password"` parameters for logging.
#[must_use]
pub fn redact_secret_params(
    schema: &IndexMap<String, ParamSpec>,
    params: &serde_json::Map<String, Value>,
) -> serde_json::Map<String, Value> {
    let mut redacted = params.clone();
    for (name, spec) in schema {
        if spec.is_secret() && redacted.contains_key(name) {
            redacted.insert(name.clone(), Value::String("[redacted]".into()));
        }
    }
    redacted
}
