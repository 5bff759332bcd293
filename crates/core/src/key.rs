//! Validated string identifiers.
//!
//! Unlike [`ExecutionId`](crate::ExecutionId), these keys are chosen by
//! users (step ids in a workflow document) or module authors (module ids,
//! plugin ids), so they are strings with domain-specific validation rather
//! than UUIDs. Each key normalizes nothing and owns its allocation; all are
//! cheap to clone (small strings) and serialize transparently.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Step ids a workflow document may not use — they collide with resolver
/// namespaces or YAML scalars.
pub const RESERVED_STEP_IDS: &[&str] = &[
    "params", "env", "timestamp", "workflow", "output", "steps", "null", "true", "false",
];

/// Errors produced when parsing a string key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// The key was empty.
    #[error("{kind} must not be empty")]
    Empty {
        /// Which key type was being parsed.
        kind: &'static str,
    },

    /// The key contained a character outside its allowed set.
    #[error("invalid character {ch:?} in {kind} {value:?}")]
    InvalidCharacter {
        /// Which key type was being parsed.
        kind: &'static str,
        /// The offending character.
        ch: char,
        /// The full input.
        value: String,
    },

    /// A module id did not have the `category.action` shape.
    #[error("module id {value:?} must have 2 or 3 dot-separated segments")]
    InvalidSegmentCount {
        /// The full input.
        value: String,
    },
}

fn check_ident(kind: &'static str, value: &str, extra: &[char]) -> Result<(), KeyError> {
    if value.is_empty() {
        return Err(KeyError::Empty { kind });
    }
    for ch in value.chars() {
        if !(ch.is_ascii_alphanumeric() || ch == '_' || extra.contains(&ch)) {
            return Err(KeyError::InvalidCharacter {
                kind,
                ch,
                value: value.to_owned(),
            });
        }
    }
    Ok(())
}

macro_rules! string_key_common {
    ($ty:ident) => {
        impl $ty {
            /// View the key as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $ty {
            type Err = KeyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<&str> for $ty {
            type Error = KeyError;

            fn try_from(s: &str) -> Result<Self, Self::Error> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $ty {
            type Error = KeyError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::new(&s)
            }
        }

        impl From<$ty> for String {
            fn from(key: $ty) -> Self {
                key.0
            }
        }

        impl PartialEq<str> for $ty {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $ty {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }
    };
}

// ── NodeId ──────────────────────────────────────────────────────────────────

/// A step/node id, unique within one workflow document.
///
/// Allowed characters: ASCII alphanumerics, `_` and `-`. Reserved words
/// ([`RESERVED_STEP_IDS`]) are a document-level rule checked by workflow
/// validation, not here — the bare string `"params"` is syntactically a
/// valid key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Parse and validate a node id.
    pub fn new(value: &str) -> Result<Self, KeyError> {
        check_ident("node id", value, &['-'])?;
        Ok(Self(value.to_owned()))
    }
}

string_key_common!(NodeId);

// ── ModuleId ────────────────────────────────────────────────────────────────

/// A module id of the form `category.action` or `category.subcategory.action`.
///
/// Segments are lowercase ASCII identifiers. The first segment is the
/// module's *namespace*; the `flow` namespace is reserved for in-process
/// builtins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModuleId(String);

impl ModuleId {
    /// Parse and validate a module id.
    pub fn new(value: &str) -> Result<Self, KeyError> {
        let segments: Vec<&str> = value.split('.').collect();
        if !(2..=3).contains(&segments.len()) {
            return Err(KeyError::InvalidSegmentCount {
                value: value.to_owned(),
            });
        }
        for segment in &segments {
            check_ident("module id segment", segment, &[])?;
            if segment.chars().any(|c| c.is_ascii_uppercase()) {
                return Err(KeyError::InvalidCharacter {
                    kind: "module id segment",
                    ch: segment
                        .chars()
                        .find(|c| c.is_ascii_uppercase())
                        .unwrap_or('?'),
                    value: value.to_owned(),
                });
            }
        }
        Ok(Self(value.to_owned()))
    }

    /// The first segment (e.g. `"http"` for `http.request`).
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }

    /// The final segment (e.g. `"request"` for `http.request`).
    #[must_use]
    pub fn action(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }

    /// Whether this module belongs to the in-process builtin family.
    #[must_use]
    pub fn is_flow(&self) -> bool {
        self.namespace() == "flow"
    }

    /// Match this id against a connection pattern: exact, `*`, or `prefix.*`.
    #[must_use]
    pub fn matches_pattern(&self, pattern: &str) -> bool {
        if pattern == "*" {
            return true;
        }
        if let Some(prefix) = pattern.strip_suffix(".*") {
            return self
                .0
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.'));
        }
        self.0 == pattern
    }
}

string_key_common!(ModuleId);

// ── PluginId ────────────────────────────────────────────────────────────────

/// A plugin id from a plugin manifest.
///
/// Allowed characters: lowercase ASCII alphanumerics, `_` and `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PluginId(String);

impl PluginId {
    /// Parse and validate a plugin id.
    pub fn new(value: &str) -> Result<Self, KeyError> {
        check_ident("plugin id", value, &['-'])?;
        if value.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(KeyError::InvalidCharacter {
                kind: "plugin id",
                ch: value
                    .chars()
                    .find(|c| c.is_ascii_uppercase())
                    .unwrap_or('?'),
                value: value.to_owned(),
            });
        }
        Ok(Self(value.to_owned()))
    }
}

string_key_common!(PluginId);
