#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Aster Workflow
//!
//! Workflow document model, dependency graph, and validation.
//!
//! A workflow arrives as YAML or JSON in one of two isomorphic shapes — the
//! legacy linear `steps` list or the `nodes` + `edges` graph — and is
//! normalized to the graph form on parse. [`DependencyGraph`] answers the
//! structural questions (reachability, levels, cycles); [`validate`]
//! produces the full issue list a document must clear before execution.

pub mod document;
pub mod edge;
pub mod error;
pub mod graph;
pub mod step;
pub mod validate;

pub use document::{ParamDecl, Workflow, WorkflowConfig};
pub use edge::EdgeDef;
pub use error::WorkflowError;
pub use graph::DependencyGraph;
pub use step::{Backoff, OnError, OutputMode, RetryPolicy, StepDef};
pub use validate::{validate, ValidationIssue, ValidationReport};
