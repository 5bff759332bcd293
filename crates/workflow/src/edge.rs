//! Edge definitions.

use aster_core::{DataType, NodeId, PortSemantics, DEFAULT_INPUT_PORT, DEFAULT_OUTPUT_PORT};
use serde::{Deserialize, Serialize};

fn default_source_port() -> String {
    DEFAULT_OUTPUT_PORT.to_owned()
}

fn default_target_port() -> String {
    DEFAULT_INPUT_PORT.to_owned()
}

fn is_default_source_port(value: &str) -> bool {
    value == DEFAULT_OUTPUT_PORT
}

fn is_default_target_port(value: &str) -> bool {
    value == DEFAULT_INPUT_PORT
}

/// A directed link from one node's output port to another node's input port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDef {
    /// Source node id.
    pub source_node: NodeId,
    /// Source port key; defaults to `"out"`.
    #[serde(
        default = "default_source_port",
        skip_serializing_if = "is_default_source_port"
    )]
    pub source_port: String,
    /// Target node id.
    pub target_node: NodeId,
    /// Target port key; defaults to `"in"`.
    #[serde(
        default = "default_target_port",
        skip_serializing_if = "is_default_target_port"
    )]
    pub target_port: String,
    /// Declared payload type, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,
    /// Control-flow tag when the source port is a decision port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantics: Option<PortSemantics>,
}

impl EdgeDef {
    /// Create a default-port edge.
    #[must_use]
    pub fn new(source: NodeId, target: NodeId) -> Self {
        Self {
            source_node: source,
            source_port: default_source_port(),
            target_node: target,
            target_port: default_target_port(),
            data_type: None,
            semantics: None,
        }
    }

    /// Override the source port.
    #[must_use]
    pub fn from_port(mut self, port: impl Into<String>) -> Self {
        self.source_port = port.into();
        self
    }

    /// Override the target port.
    #[must_use]
    pub fn to_port(mut self, port: impl Into<String>) -> Self {
        self.target_port = port.into();
        self
    }

    /// Tag the edge with control-flow semantics; also names the source port
    /// after the tag when the port is still the default.
    #[must_use]
    pub fn with_semantics(mut self, semantics: PortSemantics) -> Self {
        if is_default_source_port(&self.source_port) {
            self.source_port = semantics.to_string();
        }
        self.semantics = Some(semantics);
        self
    }

    /// Declare the payload type.
    #[must_use]
    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = Some(data_type);
        self
    }
}
