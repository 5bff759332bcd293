//! Translation bundle resolution.
//!
//! The engine carries no bundles of its own. A [`Translator`] wraps one
//! loaded `{key → string}` bundle; `*_key` metadata fields resolve against
//! it, falling back to the English defaults already present on the
//! metadata. Bundle values are plain strings — no template syntax — and
//! capped at 500 characters.

use std::collections::HashMap;

use thiserror::Error;

/// Maximum length of one bundle value.
pub const MAX_VALUE_LENGTH: usize = 500;

/// Errors raised while loading a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BundleError {
    /// A value exceeded [`MAX_VALUE_LENGTH`].
    #[error("value for key {key:?} exceeds {MAX_VALUE_LENGTH} characters")]
    ValueTooLong {
        /// The offending key.
        key: String,
    },
}

/// A loaded translation bundle for one locale.
#[derive(Debug, Clone, Default)]
pub struct Translator {
    entries: HashMap<String, String>,
}

impl Translator {
    /// An empty translator: every lookup falls back.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load a bundle, enforcing the value-length cap.
    pub fn from_bundle(bundle: HashMap<String, String>) -> Result<Self, BundleError> {
        for (key, value) in &bundle {
            if value.chars().count() > MAX_VALUE_LENGTH {
                return Err(BundleError::ValueTooLong { key: key.clone() });
            }
        }
        Ok(Self { entries: bundle })
    }

    /// Resolve a key, falling back to the given English default.
    #[must_use]
    pub fn resolve<'a>(&'a self, key: Option<&str>, fallback: &'a str) -> &'a str {
        key.and_then(|k| self.entries.get(k))
            .map_or(fallback, String::as_str)
    }

    /// Number of loaded entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the bundle is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Build the conventional key for a module metadata field:
/// `modules.{category}.{module}.{section}.{field}`.
#[must_use]
pub fn metadata_key(category: &str, module: &str, section: &str, field: &str) -> String {
    format!("modules.{category}.{module}.{section}.{field}")
}
