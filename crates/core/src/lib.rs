#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Aster Core
//!
//! Core types shared by every Aster crate.
//!
//! - **Identifiers**: [`ExecutionId`] (UUID-backed, `Copy`), plus validated
//!   string keys [`NodeId`], [`ModuleId`] and [`PluginId`]
//! - **Data types**: the closed [`DataType`] set used for port compatibility
//! - **Constraints**: declarative value constraints ([`Constraints`]) shared
//!   by workflow parameter declarations and module parameter schemas
//! - **Port semantics**: the control-flow port vocabulary ([`PortSemantics`])

pub mod constraint;
pub mod datatype;
pub mod id;
pub mod key;
pub mod port;

pub use constraint::Constraints;
pub use datatype::DataType;
pub use id::ExecutionId;
pub use key::{KeyError, ModuleId, NodeId, PluginId, RESERVED_STEP_IDS};
pub use port::{PortSemantics, DEFAULT_INPUT_PORT, DEFAULT_OUTPUT_PORT};

/// Type alias for port keys (e.g. `"in"`, `"out"`, `"true"`, `"case:a"`).
pub type PortKey = String;
