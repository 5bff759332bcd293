//! Subprocess spawning and stdio management.
//!
//! One [`PluginProcess`] wraps one OS subprocess speaking the line
//! protocol. Stderr is pumped through `tracing` at warn level so plugin
//! logs land in the engine trace without touching the data channel.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use aster_core::PluginId;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::warn;

use crate::error::PluginError;
use crate::manifest::PluginManifest;
use crate::protocol::{
    self, decode_line, encode_line, HandshakeParams, HandshakeResult, Request, Response,
    ShutdownParams, PROTOCOL_VERSION,
};

/// Transport seam between the manager and a live plugin.
///
/// The production implementation is [`PluginProcess`]; tests substitute
/// in-memory fakes.
#[async_trait]
pub trait PluginConnection: Send {
    /// Issue one request and wait for its correlated response.
    async fn call(
        &mut self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, PluginError>;

    /// Request a graceful shutdown, then terminate after the grace period.
    async fn shutdown(&mut self, reason: &str, grace: Duration);

    /// Whether the underlying process is still running.
    fn is_alive(&mut self) -> bool;
}

/// A spawned plugin subprocess with captured stdio.
pub struct PluginProcess {
    plugin: PluginId,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
    broken: bool,
}

impl PluginProcess {
    /// Spawn the plugin described by a manifest.
    ///
    /// The subprocess runs in the plugin's directory with the manifest's
    /// environment on top of the inherited one.
    pub async fn spawn(manifest: &PluginManifest) -> Result<Self, PluginError> {
        let plugin = manifest.name.clone();
        let mut cmd = Command::new(&manifest.runtime.entry);
        cmd.args(&manifest.runtime.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &manifest.root_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &manifest.runtime.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| PluginError::Spawn {
            plugin: plugin.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or_else(|| PluginError::Protocol {
            plugin: plugin.clone(),
            reason: "stdin unavailable".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| PluginError::Protocol {
            plugin: plugin.clone(),
            reason: "stdout unavailable".into(),
        })?;

        if let Some(stderr) = child.stderr.take() {
            let log_target = plugin.to_string();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            let text = line.trim_end();
                            if !text.is_empty() {
                                warn!(plugin = %log_target, "{text}");
                            }
                        }
                    }
                }
            });
        }

        Ok(Self {
            plugin,
            child,
            stdin,
            stdout: BufReader::new(stdout),
            next_id: 1,
            broken: false,
        })
    }

    /// Run the handshake; must be the first call after spawn.
    pub async fn handshake(
        &mut self,
        execution_id: Option<String>,
        timeout: Duration,
    ) -> Result<HandshakeResult, PluginError> {
        let params = HandshakeParams {
            protocol_version: PROTOCOL_VERSION,
            plugin_id: self.plugin.to_string(),
            execution_id,
        };
        let result = self
            .call(
                protocol::method::HANDSHAKE,
                serde_json::to_value(&params).unwrap_or(Value::Null),
                timeout,
            )
            .await
            .map_err(|e| PluginError::Handshake {
                plugin: self.plugin.clone(),
                reason: e.to_string(),
            })?;

        let handshake: HandshakeResult =
            serde_json::from_value(result).map_err(|e| PluginError::Handshake {
                plugin: self.plugin.clone(),
                reason: format!("malformed handshake result: {e}"),
            })?;

        for required in [
            protocol::method::HANDSHAKE,
            protocol::method::INVOKE,
            protocol::method::PING,
            protocol::method::SHUTDOWN,
        ] {
            if !handshake.supported_methods.iter().any(|m| m == required) {
                return Err(PluginError::Handshake {
                    plugin: self.plugin.clone(),
                    reason: format!("plugin does not implement {required:?}"),
                });
            }
        }
        Ok(handshake)
    }

    async fn call_inner(
        &mut self,
        method: &str,
        params: Value,
        id: u64,
    ) -> Result<Value, PluginError> {
        let request = Request::new(method, params, id);
        let line = encode_line(&request).map_err(|e| PluginError::Protocol {
            plugin: self.plugin.clone(),
            reason: e.to_string(),
        })?;
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|_| PluginError::Crashed(self.plugin.clone()))?;
        self.stdin
            .flush()
            .await
            .map_err(|_| PluginError::Crashed(self.plugin.clone()))?;

        let mut buf = String::new();
        loop {
            buf.clear();
            let read = self
                .stdout
                .read_line(&mut buf)
                .await
                .map_err(|_| PluginError::Crashed(self.plugin.clone()))?;
            if read == 0 {
                self.broken = true;
                return Err(PluginError::Crashed(self.plugin.clone()));
            }
            if buf.trim().is_empty() {
                continue;
            }
            let response: Response = match decode_line(&buf) {
                Ok(response) => response,
                Err(e) => {
                    return Err(PluginError::Protocol {
                        plugin: self.plugin.clone(),
                        reason: format!("undecodable frame: {e}"),
                    });
                }
            };
            if response.id != id {
                // Late answer to an abandoned request; drop it.
                warn!(plugin = %self.plugin, got = response.id, want = id, "stray response id");
                continue;
            }
            if let Some(error) = response.error {
                return Err(PluginError::Rpc(error.to_step_error()));
            }
            return Ok(response.result.unwrap_or(Value::Null));
        }
    }
}

#[async_trait]
impl PluginConnection for PluginProcess {
    async fn call(
        &mut self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, PluginError> {
        if self.broken {
            return Err(PluginError::Crashed(self.plugin.clone()));
        }
        let id = self.next_id;
        self.next_id += 1;

        match tokio::time::timeout(timeout, self.call_inner(method, params, id)).await {
            Ok(result) => result,
            Err(_) => {
                // The pending response may still arrive; the stray-id guard
                // in call_inner discards it on the next call.
                Err(PluginError::Timeout {
                    plugin: self.plugin.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn shutdown(&mut self, reason: &str, grace: Duration) {
        let params = ShutdownParams {
            reason: reason.to_owned(),
            grace_period_ms: grace.as_millis() as u64,
        };
        // Best-effort: the plugin may already be gone.
        let _ = self
            .call(
                protocol::method::SHUTDOWN,
                serde_json::to_value(&params).unwrap_or(Value::Null),
                grace,
            )
            .await;

        if tokio::time::timeout(grace, self.child.wait()).await.is_err() {
            let _ = self.child.start_kill();
            let _ = self.child.wait().await;
        }
        self.broken = true;
    }

    fn is_alive(&mut self) -> bool {
        !self.broken && matches!(self.child.try_wait(), Ok(None))
    }
}

impl std::fmt::Debug for PluginProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginProcess")
            .field("plugin", &self.plugin)
            .field("broken", &self.broken)
            .finish()
    }
}
