#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Aster Expression
//!
//! The variable-reference grammar accepted by the Aster engine, and nothing
//! more:
//!
//! ```text
//! expr     := "{{" path ("|" "default" "(" literal ")")? "}}"
//! path     := segment ("." segment)*
//! segment  := ident | ident "[" (integer | quoted) "]"
//! ```
//!
//! No function calls, no arithmetic, no conditionals — those are module
//! operations. A [`Template`] is a parsed string mixing static text with
//! `{{expr}}` references; rendering against an [`EvalContext`] either
//! returns the referenced value with its original type (when the whole
//! string is a single expression) or performs string interpolation.
//!
//! Resolution walks namespaces in a fixed order: iteration locals, `params`,
//! `env` (pre-filtered allowlist), builtins (`timestamp`, `workflow.id`,
//! `workflow.name`), then step outputs and aliases. The resolver only ever
//! sees the public context view, so `private` and `secrets` lookups behave
//! as missing by construction.

pub mod context;
pub mod error;
pub mod path;
pub mod template;

pub use context::{EvalContext, NoOutputs, OutputSource};
pub use error::ExpressionError;
pub use path::{Path, Segment};
pub use template::{references_in_value, resolve_value, Template, TemplatePart};
