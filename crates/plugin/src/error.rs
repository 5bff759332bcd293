//! Plugin runtime error types.

use aster_core::PluginId;
use aster_error::{ErrorCode, StepError};
use thiserror::Error;

/// Errors raised by the plugin runtime.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The plugin process could not be spawned.
    #[error("failed to spawn plugin {plugin}: {source}")]
    Spawn {
        /// Which plugin.
        plugin: PluginId,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Handshake failed or reported an incompatible protocol version.
    #[error("handshake with plugin {plugin} failed: {reason}")]
    Handshake {
        /// Which plugin.
        plugin: PluginId,
        /// What went wrong.
        reason: String,
    },

    /// The subprocess died while a request was in flight.
    #[error("plugin {0} crashed mid-invoke")]
    Crashed(PluginId),

    /// The request exceeded its time budget.
    #[error("plugin {plugin} did not answer within {timeout_ms}ms")]
    Timeout {
        /// Which plugin.
        plugin: PluginId,
        /// The budget that was exceeded.
        timeout_ms: u64,
    },

    /// The plugin answered with a JSON-RPC error.
    #[error("plugin returned an error: {0}")]
    Rpc(StepError),

    /// A malformed frame arrived on stdout.
    #[error("protocol violation from plugin {plugin}: {reason}")]
    Protocol {
        /// Which plugin.
        plugin: PluginId,
        /// What was malformed.
        reason: String,
    },

    /// The plugin exhausted its restart budget and is quarantined.
    #[error("plugin {0} is quarantined")]
    Quarantined(PluginId),

    /// No such plugin is loaded.
    #[error("plugin {0} is not loaded")]
    NotLoaded(PluginId),

    /// The manifest failed to parse or validate.
    #[error("invalid manifest: {0}")]
    Manifest(String),
}

impl PluginError {
    /// Convert into the engine's step-level error contract.
    #[must_use]
    pub fn into_step_error(self) -> StepError {
        match self {
            Self::Crashed(_) => {
                StepError::new(ErrorCode::PluginCrashed, self.to_string())
            }
            Self::Timeout { timeout_ms, .. } => StepError::timeout(format!(
                "plugin did not answer within {timeout_ms}ms"
            )),
            Self::Rpc(err) => err,
            Self::Quarantined(_) | Self::NotLoaded(_) => {
                StepError::new(ErrorCode::Unsupported, self.to_string())
            }
            other => StepError::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(id: &str) -> PluginId {
        PluginId::new(id).unwrap()
    }

    #[test]
    fn crash_maps_to_plugin_crashed() {
        let err = PluginError::Crashed(pid("browser-tools")).into_step_error();
        assert_eq!(err.code, ErrorCode::PluginCrashed);
        assert!(err.code.is_retryable_by_default());
    }

    #[test]
    fn timeout_maps_to_timeout() {
        let err = PluginError::Timeout {
            plugin: pid("slow"),
            timeout_ms: 5000,
        }
        .into_step_error();
        assert_eq!(err.code, ErrorCode::Timeout);
    }

    #[test]
    fn quarantine_maps_to_unsupported() {
        let err = PluginError::Quarantined(pid("flaky")).into_step_error();
        assert_eq!(err.code, ErrorCode::Unsupported);
    }

    #[test]
    fn rpc_error_passes_through() {
        let inner = StepError::new(ErrorCode::RateLimited, "429");
        let err = PluginError::Rpc(inner.clone()).into_step_error();
        assert_eq!(err, inner);
    }
}
