#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Aster Engine
//!
//! The top-level workflow execution engine: scheduler, event router, step
//! executor, and the dual-track module invoker that dispatches between
//! in-process `flow.*` builtins and plugin subprocesses.
//!
//! ```text
//! Workflow + inputs ──▶ Engine::execute
//!                         │ validate (structural + registry-aware)
//!                         ▼
//!                      Scheduler ──▶ Executor ──▶ Invoker ──▶ builtin | plugin
//!                         │ events / evidence / trace
//!                         ▼
//!                      ExecutionResult (+ replay_from at any step)
//! ```

pub mod builtins;
pub mod control;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod introspect;
pub mod invoker;
pub mod plugin_handler;
pub mod scheduler;

pub use engine::{Engine, ExecuteOptions, ExecutionResult};
pub use error::EngineError;
pub use events::EventSink;
pub use executor::{effective_timeout, ForeachResume, StepExecutor, DEFAULT_STEP_TIMEOUT_MS};
pub use invoker::ModuleInvoker;
pub use plugin_handler::{register_plugin_modules, PluginModuleHandler};
pub use scheduler::{ReplaySeed, SchedulerOutcome};
