//! The stable error code table.
//!
//! Codes cross process boundaries (plugin RPC errors, persisted traces,
//! client-visible failures), so the set is closed and each code's wire form
//! is frozen. Additions are append-only; renames are forbidden.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A stable error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Input failed schema or structural validation.
    ValidationError,
    /// Required configuration is absent.
    ConfigMissing,
    /// Authentication failed.
    AuthError,
    /// Authenticated but not permitted.
    Forbidden,
    /// A referenced entity does not exist.
    NotFound,
    /// An upstream rate limit was hit.
    RateLimited,
    /// An operation exceeded its time budget.
    Timeout,
    /// A network-level failure.
    NetworkError,
    /// The operation is not supported by any available handler.
    Unsupported,
    /// An unexpected internal failure.
    InternalError,
    /// A path escaped its allowed root.
    PathTraversal,
    /// Input matched a SQL injection pattern.
    SqlInjection,
    /// A request targeted a forbidden internal address.
    Ssrf,
    /// A plugin subprocess died mid-invoke.
    PluginCrashed,
    /// The execution or step was cancelled.
    Cancelled,
    /// A module reported a generic execution failure.
    ExecutionError,
    /// Graph validation: no start node found.
    NoStartNode,
    /// Graph validation: more than one start node in a component.
    MultipleStartNodes,
    /// Graph validation: an unmediated cycle.
    CycleDetected,
    /// Graph validation: a node unreachable from any start node.
    OrphanNode,
    /// Graph validation: the designated start node cannot start.
    InvalidStartNode,
    /// Connection validation: port data types are incompatible.
    TypeMismatch,
    /// Connection validation: a referenced port does not exist.
    PortNotFound,
}

impl ErrorCode {
    /// Codes retryable by default when a module declares `retryable: true`.
    ///
    /// A step's `retry.retry_on` list may extend this set per step.
    pub const DEFAULT_RETRYABLE: &'static [ErrorCode] = &[
        Self::Timeout,
        Self::NetworkError,
        Self::RateLimited,
        Self::PluginCrashed,
    ];

    /// The frozen wire form, e.g. `"VALIDATION_ERROR"`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::ConfigMissing => "CONFIG_MISSING",
            Self::AuthError => "AUTH_ERROR",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::RateLimited => "RATE_LIMITED",
            Self::Timeout => "TIMEOUT",
            Self::NetworkError => "NETWORK_ERROR",
            Self::Unsupported => "UNSUPPORTED",
            Self::InternalError => "INTERNAL_ERROR",
            Self::PathTraversal => "PATH_TRAVERSAL",
            Self::SqlInjection => "SQL_INJECTION",
            Self::Ssrf => "SSRF",
            Self::PluginCrashed => "PLUGIN_CRASHED",
            Self::Cancelled => "CANCELLED",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::NoStartNode => "NO_START_NODE",
            Self::MultipleStartNodes => "MULTIPLE_START_NODES",
            Self::CycleDetected => "CYCLE_DETECTED",
            Self::OrphanNode => "ORPHAN_NODE",
            Self::InvalidStartNode => "INVALID_START_NODE",
            Self::TypeMismatch => "TYPE_MISMATCH",
            Self::PortNotFound => "PORT_NOT_FOUND",
        }
    }

    /// Whether this code is in the default retryable set.
    #[must_use]
    pub fn is_retryable_by_default(self) -> bool {
        Self::DEFAULT_RETRYABLE.contains(&self)
    }

    /// Whether this code is produced by graph/connection validation.
    #[must_use]
    pub fn is_validation_class(self) -> bool {
        matches!(
            self,
            Self::ValidationError
                | Self::NoStartNode
                | Self::MultipleStartNodes
                | Self::CycleDetected
                | Self::OrphanNode
                | Self::InvalidStartNode
                | Self::TypeMismatch
                | Self::PortNotFound
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown code string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown error code {0:?}")]
pub struct UnknownErrorCode(pub String);

impl FromStr for ErrorCode {
    type Err = UnknownErrorCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_owned()))
            .map_err(|_| UnknownErrorCode(s.to_owned()))
    }
}
