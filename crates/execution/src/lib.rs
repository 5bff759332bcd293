#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Aster Execution
//!
//! Runtime execution state for the Aster workflow engine.
//!
//! This crate models execution-time concepts — it does NOT contain the
//! engine orchestrator. It defines:
//!
//! - [`ExecutionStatus`] — execution-level state machine
//! - [`ExecutionContext`] — layered runtime state (params/public/private/
//!   secrets), step outputs, evidence, trace, cancellation
//! - [`StepResult`] — the normalized per-step outcome contract
//! - [`Evidence`] / [`EvidenceLog`] — before/after snapshots bracketing
//!   each step, the raw material for replay
//! - [`EngineEvent`] / [`TraceLog`] — the append-only event trace with
//!   JSONL round-trip

pub mod context;
pub mod error;
pub mod evidence;
pub mod result;
pub mod status;
pub mod trace;

pub use context::ExecutionContext;
pub use error::ExecutionError;
pub use evidence::{ContextSnapshot, Evidence, EvidenceLog};
pub use result::{StepMeta, StepResult};
pub use status::ExecutionStatus;
pub use trace::{EngineEvent, EventKind, TraceLog};
