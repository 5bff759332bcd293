#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Aster Plugin
//!
//! The out-of-process plugin runtime: external processes speaking
//! newline-delimited JSON-RPC 2.0 over stdio.
//!
//! - [`PluginManifest`] — per-plugin `plugin.yaml` (runtime command,
//!   implemented modules, permissions)
//! - [`protocol`] — the four-method wire contract
//!   (`handshake`/`invoke`/`ping`/`shutdown`) and its line framing
//! - [`PluginProcess`] — one subprocess with correlated request/response
//!   and a stderr→tracing pump
//! - [`PluginManager`] — lazy start, pooling to `max_instances`, ping
//!   health with a three-strike rule, exponential restart backoff, and
//!   quarantine once the backoff ceiling is hit

pub mod error;
pub mod manager;
pub mod manifest;
pub mod process;
pub mod protocol;
pub mod state;

pub use error::PluginError;
pub use manager::{
    ConnectionFactory, ManagerConfig, PluginInvoke, PluginManager, ProcessFactory,
    RestartBackoff,
};
pub use manifest::{ManifestModule, PluginManifest, RuntimeSpec};
pub use process::{PluginConnection, PluginProcess};
pub use protocol::{
    HandshakeParams, HandshakeResult, InvokeParams, PingResult, Request, Response, RpcError,
    ShutdownParams, PROTOCOL_VERSION,
};
pub use state::ProcessState;
