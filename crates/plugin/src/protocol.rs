//! Newline-delimited JSON-RPC 2.0 protocol.
//!
//! One JSON object per line on stdin/stdout; stderr carries logs. Every
//! plugin must implement four methods: `handshake`, `invoke`, `ping`,
//! `shutdown`. Errors carry the engine's stable code in `error.data.error_code`
//! alongside the JSON-RPC numeric code.

use aster_error::{ErrorCode, StepError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version spoken by this engine.
pub const PROTOCOL_VERSION: u32 = 1;

/// JSON-RPC version string.
pub const JSONRPC: &str = "2.0";

/// Method names every plugin must implement.
pub mod method {
    /// First call after spawn; gates the protocol version.
    pub const HANDSHAKE: &str = "handshake";
    /// Execute one module step.
    pub const INVOKE: &str = "invoke";
    /// Liveness probe.
    pub const PING: &str = "ping";
    /// Graceful shutdown request.
    pub const SHUTDOWN: &str = "shutdown";
}

/// A JSON-RPC request frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
    /// Correlation id.
    pub id: u64,
}

impl Request {
    /// Build a request.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Value, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC.to_owned(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// JSON-RPC numeric code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Extension data; `data.error_code` carries the engine's stable code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Build a server error carrying a stable engine code.
    #[must_use]
    pub fn from_step_error(error: &StepError) -> Self {
        Self {
            code: -32000,
            message: error.message.clone(),
            data: Some(serde_json::json!({ "error_code": error.code })),
        }
    }

    /// Recover the engine's structured error. Unknown or absent codes fall
    /// back to `EXECUTION_ERROR`.
    #[must_use]
    pub fn to_step_error(&self) -> StepError {
        let code = self
            .data
            .as_ref()
            .and_then(|d| d.get("error_code"))
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<ErrorCode>().ok())
            .unwrap_or(ErrorCode::ExecutionError);
        let mut err = StepError::new(code, self.message.clone());
        if let Some(data) = &self.data {
            err = err.with_details(data.clone());
        }
        err
    }
}

/// A JSON-RPC response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Success result; mutually exclusive with `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error object; mutually exclusive with `result`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    /// Correlation id, echoing the request.
    pub id: u64,
}

impl Response {
    /// A success response.
    #[must_use]
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC.to_owned(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// An error response.
    #[must_use]
    pub fn failure(id: u64, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC.to_owned(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

// ── Method payloads ─────────────────────────────────────────────────────────

/// `handshake` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeParams {
    /// Engine protocol version.
    pub protocol_version: u32,
    /// Which plugin the engine believes it is talking to.
    pub plugin_id: String,
    /// The execution that triggered the spawn, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
}

/// `handshake` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResult {
    /// Plugin implementation version.
    pub plugin_version: String,
    /// Methods the plugin implements.
    pub supported_methods: Vec<String>,
    /// Whether the plugin accepts multiple in-flight requests.
    #[serde(default)]
    pub multi_request: bool,
}

/// `invoke` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeParams {
    /// The module id being invoked.
    pub step: String,
    /// Canonicalized parameters.
    pub input: Value,
    /// Plugin-level configuration.
    #[serde(default)]
    pub config: Value,
    /// Sanitized context (public layer only).
    #[serde(default)]
    pub context: Value,
    /// Per-call time budget.
    pub timeout_ms: u64,
}

/// `ping` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingResult {
    /// Always `true`.
    pub pong: bool,
}

/// `shutdown` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownParams {
    /// Why the plugin is being stopped.
    pub reason: String,
    /// How long the plugin has to flush and exit.
    pub grace_period_ms: u64,
}

// ── Framing ─────────────────────────────────────────────────────────────────

/// Encode a frame as one line (including the trailing newline).
pub fn encode_line<T: Serialize>(frame: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

/// Decode one line into a frame.
pub fn decode_line<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn request_frame_shape() {
        let request = Request::new(method::PING, json!({}), 7);
        let line = encode_line(&request).unwrap();
        assert!(line.ends_with('\n'));
        let value: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "ping");
        assert_eq!(value["id"], 7);
    }

    #[test]
    fn response_roundtrip() {
        let response = Response::success(3, json!({"pong": true}));
        let line = encode_line(&response).unwrap();
        let back: Response = decode_line(&line).unwrap();
        assert_eq!(back, response);
    }

    #[test]
    fn error_response_roundtrip() {
        let error = RpcError::from_step_error(&StepError::new(
            ErrorCode::NetworkError,
            "connection refused",
        ));
        let response = Response::failure(9, error);
        let line = encode_line(&response).unwrap();
        let back: Response = decode_line(&line).unwrap();
        assert_eq!(back.id, 9);
        let recovered = back.error.unwrap().to_step_error();
        assert_eq!(recovered.code, ErrorCode::NetworkError);
        assert_eq!(recovered.message, "connection refused");
    }

    #[test]
    fn rpc_error_without_code_falls_back() {
        let error = RpcError {
            code: -32000,
            message: "boom".into(),
            data: None,
        };
        assert_eq!(error.to_step_error().code, ErrorCode::ExecutionError);
    }

    #[test]
    fn handshake_params_are_camel_case() {
        let params = HandshakeParams {
            protocol_version: PROTOCOL_VERSION,
            plugin_id: "browser-tools".into(),
            execution_id: None,
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["protocolVersion"], 1);
        assert_eq!(value["pluginId"], "browser-tools");
    }

    #[test]
    fn invoke_params_shape() {
        let params = InvokeParams {
            step: "browser.open".into(),
            input: json!({"url": "https://example.com"}),
            config: Value::Null,
            context: json!({"public": {}}),
            timeout_ms: 30_000,
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["step"], "browser.open");
        assert_eq!(value["timeoutMs"], 30_000);
    }

    #[test]
    fn handshake_result_multi_request_defaults_false() {
        let result: HandshakeResult = serde_json::from_value(json!({
            "pluginVersion": "1.0.0",
            "supportedMethods": ["handshake", "invoke", "ping", "shutdown"],
        }))
        .unwrap();
        assert!(!result.multi_request);
    }

    #[test]
    fn decode_tolerates_trailing_whitespace() {
        let response: Response = decode_line("{\"jsonrpc\":\"2.0\",\"result\":1,\"id\":1}\n").unwrap();
        assert_eq!(response.result, Some(json!(1)));
    }
}
