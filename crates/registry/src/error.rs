//! Registry error types.

use aster_core::ModuleId;
use thiserror::Error;

use crate::lint::LintFinding;

/// Errors raised by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A module id is already registered with different metadata.
    #[error("module {0} is already registered with different metadata")]
    Conflict(ModuleId),

    /// Lookup of an absent module.
    #[error("module {0} is not registered")]
    NotFound(ModuleId),

    /// Registration blocked by lint errors.
    #[error("metadata for {module} failed lint: {}", summarize(.findings))]
    Lint {
        /// The module being registered.
        module: ModuleId,
        /// All findings, blocking and otherwise.
        findings: Vec<LintFinding>,
    },
}

fn summarize(findings: &[LintFinding]) -> String {
    findings
        .iter()
        .filter(|f| f.severity == crate::lint::Severity::Error)
        .map(|f| f.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}
