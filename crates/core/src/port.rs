//! Control-flow port semantics.
//!
//! Edges carry a semantics tag when their source port is a control-flow
//! decision (`flow.branch` emitting on `true`/`false`, `flow.foreach`
//! emitting `iterate` then `done`, `flow.switch` emitting `case:<value>`).
//! Plain data edges have no tag.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The default input port key on a node.
pub const DEFAULT_INPUT_PORT: &str = "in";

/// The default output port key on a node.
pub const DEFAULT_OUTPUT_PORT: &str = "out";

/// Semantics tag carried by control-flow ports.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PortSemantics {
    /// The truthy branch of `flow.branch`.
    True,
    /// The falsy branch of `flow.branch`.
    False,
    /// One iteration of `flow.loop` / `flow.foreach`.
    Iterate,
    /// Terminal emission of a loop construct, carrying the aggregate.
    Done,
    /// A matched case of `flow.switch` (`case:<value>`).
    Case(String),
}

impl PortSemantics {
    /// Parse a semantics tag from its wire form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "true" => Some(Self::True),
            "false" => Some(Self::False),
            "iterate" => Some(Self::Iterate),
            "done" => Some(Self::Done),
            other => other.strip_prefix("case:").map(|v| Self::Case(v.to_owned())),
        }
    }
}

impl fmt::Display for PortSemantics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => f.write_str("true"),
            Self::False => f.write_str("false"),
            Self::Iterate => f.write_str("iterate"),
            Self::Done => f.write_str("done"),
            Self::Case(v) => write!(f, "case:{v}"),
        }
    }
}

impl Serialize for PortSemantics {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PortSemantics {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown port semantics {s:?}")))
    }
}
