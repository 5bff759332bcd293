//! Metadata lint.
//!
//! Runs at registration time. Findings at [`Severity::Error`] block
//! registration; warnings and notes surface through the catalog for
//! tooling to display.

use serde::{Deserialize, Serialize};

use crate::metadata::{ModuleMetadata, Stability};

/// Finding severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational.
    Note,
    /// Should be fixed; does not block registration.
    Warning,
    /// Blocks registration.
    Error,
}

/// One lint finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintFinding {
    /// Finding severity.
    pub severity: Severity,
    /// Which metadata field the finding concerns.
    pub field: String,
    /// What is wrong.
    pub message: String,
}

impl LintFinding {
    fn error(field: &str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            field: field.to_owned(),
            message: message.into(),
        }
    }

    fn warning(field: &str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            field: field.to_owned(),
            message: message.into(),
        }
    }
}

/// Lint a metadata literal.
#[must_use]
pub fn lint(meta: &ModuleMetadata) -> Vec<LintFinding> {
    let mut findings = Vec::new();

    if meta.label.trim().is_empty() {
        findings.push(LintFinding::error("label", "label must not be empty"));
    }
    if meta.description.trim().is_empty() {
        findings.push(LintFinding::error(
            "description",
            "description must not be empty",
        ));
    }
    if meta.category != meta.module_id.namespace() {
        findings.push(LintFinding::warning(
            "category",
            format!(
                "category {:?} does not match namespace {:?}",
                meta.category,
                meta.module_id.namespace()
            ),
        ));
    }
    if meta.execution.timeout_ms == 0 {
        findings.push(LintFinding::warning(
            "execution.timeout_ms",
            "module declares no timeout; the engine default applies",
        ));
    }
    // Port lists may legitimately be empty (entry and terminal nodes),
    // but duplicate keys are always author mistakes.
    for (field, ports) in [
        ("input_ports", &meta.input_ports),
        ("output_ports", &meta.output_ports),
    ] {
        let mut seen = std::collections::HashSet::new();
        for port in ports {
            if !seen.insert(port.key.as_str()) {
                findings.push(LintFinding::error(
                    field,
                    format!("duplicate port key {:?}", port.key),
                ));
            }
        }
    }

    // Defaults must satisfy their own declared type.
    for (name, spec) in &meta.params_schema {
        if let Some(default) = &spec.default {
            if !default.is_null() && !spec.param_type.matches_value(default) {
                findings.push(LintFinding::error(
                    "params_schema",
                    format!("default for {name:?} does not match its declared type"),
                ));
            }
        }
        if spec.required && spec.default.is_some() {
            findings.push(LintFinding::warning(
                "params_schema",
                format!("{name:?} is required but also has a default"),
            ));
        }
    }

    // Examples must at least name declared parameters.
    for example in &meta.examples {
        for param in example.params.keys() {
            let known = meta.params_schema.contains_key(param)
                || meta
                    .params_schema
                    .values()
                    .any(|s| s.aliases.iter().any(|a| a == param));
            if !known {
                findings.push(LintFinding::warning(
                    "examples",
                    format!(
                        "example {:?} uses undeclared parameter {param:?}",
                        example.id
                    ),
                ));
            }
        }
    }

    if meta.stability == Stability::Deprecated && meta.tier != crate::metadata::Tier::Internal {
        findings.push(LintFinding::warning(
            "stability",
            "deprecated modules should move to the internal tier",
        ));
    }

    if meta.security.requires_credentials
        && !meta
            .security
            .capabilities
            .contains(&crate::metadata::Capability::CredentialsAccess)
    {
        findings.push(LintFinding::error(
            "security",
            "requires_credentials without the credentials_access capability",
        ));
    }

    findings
}

/// Whether any finding blocks registration.
#[must_use]
pub fn has_blocking(findings: &[LintFinding]) -> bool {
    findings.iter().any(|f| f.severity == Severity::Error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Capability, ModuleMetadata, SecurityContract, Tier};
    use crate::schema::ParamSpec;
    use serde_json::json;

    #[test]
    fn clean_metadata_passes() {
        let meta = ModuleMetadata::new("string.uppercase", "Uppercase", "Uppercases text");
        let findings = lint(&meta);
        assert!(!has_blocking(&findings), "unexpected findings: {findings:?}");
    }

    #[test]
    fn empty_label_blocks() {
        let meta = ModuleMetadata::new("string.uppercase", "", "desc");
        let findings = lint(&meta);
        assert!(has_blocking(&findings));
    }

    #[test]
    fn mismatched_default_blocks() {
        let meta = ModuleMetadata::new("math.divide", "Divide", "Divides").with_param(
            "a",
            ParamSpec::number().with_default(json!("not a number")),
        );
        let findings = lint(&meta);
        assert!(has_blocking(&findings));
    }

    #[test]
    fn required_with_default_warns() {
        let meta = ModuleMetadata::new("math.divide", "Divide", "Divides")
            .with_param("a", ParamSpec::number().required().with_default(json!(1)));
        let findings = lint(&meta);
        assert!(!has_blocking(&findings));
        assert!(findings.iter().any(|f| f.severity == Severity::Warning));
    }

    #[test]
    fn undeclared_example_param_warns() {
        let meta = ModuleMetadata::new("math.divide", "Divide", "Divides").with_example(
            crate::metadata::ModuleExample {
                id: "ex".into(),
                title: "Example".into(),
                params: indexmap::IndexMap::from([("mystery".to_owned(), json!(1))]),
                expected: None,
            },
        );
        let findings = lint(&meta);
        assert!(findings.iter().any(|f| f.field == "examples"));
        assert!(!has_blocking(&findings));
    }

    #[test]
    fn credentials_without_capability_blocks() {
        let meta = ModuleMetadata::new("db.query", "Query", "Runs a query").with_security(
            SecurityContract {
                requires_credentials: true,
                ..SecurityContract::default()
            },
        );
        assert!(has_blocking(&lint(&meta)));

        let fixed = ModuleMetadata::new("db.query", "Query", "Runs a query").with_security(
            SecurityContract {
                requires_credentials: true,
                capabilities: vec![Capability::CredentialsAccess],
                ..SecurityContract::default()
            },
        );
        assert!(!has_blocking(&lint(&fixed)));
    }

    #[test]
    fn deprecated_outside_internal_warns() {
        let meta = ModuleMetadata::new("legacy.op", "Legacy", "Old op")
            .with_stability(Stability::Deprecated)
            .with_tier(Tier::Standard);
        let findings = lint(&meta);
        assert!(findings.iter().any(|f| f.field == "stability"));
    }

    #[test]
    fn duplicate_port_keys_block() {
        let meta = ModuleMetadata::new("x.y", "X", "desc").with_output_ports(vec![
            crate::metadata::PortDecl::new("out"),
            crate::metadata::PortDecl::new("out"),
        ]);
        assert!(has_blocking(&lint(&meta)));
    }
}
