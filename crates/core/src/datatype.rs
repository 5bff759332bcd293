//! The closed data-type set used for port compatibility.
//!
//! Connection compatibility between module ports is decided over this
//! vocabulary: exact match, `any` accepting everything, and a small declared
//! hierarchy (`browser_page` ⊆ `browser_instance`, `object` ⊆ `json`,
//! primitives ⊆ `any`).

use serde::{Deserialize, Serialize};

/// A declared port data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Accepts / produces anything.
    Any,
    /// UTF-8 text.
    String,
    /// Numeric value (integer or float).
    Number,
    /// Boolean value.
    Boolean,
    /// JSON object.
    Object,
    /// JSON array.
    Array,
    /// Arbitrary JSON value.
    Json,
    /// A file handle or path reference.
    File,
    /// Image data.
    Image,
    /// Raw binary data.
    Binary,
    /// HTML document or fragment.
    Html,
    /// Tabular data.
    Table,
    /// A live browser instance handle.
    BrowserInstance,
    /// A page within a browser instance.
    BrowserPage,
    /// An element within a browser page.
    BrowserElement,
    /// A configured AI model handle.
    AiModel,
    /// An AI conversation memory handle.
    AiMemory,
    /// An AI tool handle.
    AiTool,
    /// A credential handle (never the resolved secret).
    Credential,
    /// An HTTP response object.
    HttpResponse,
}

impl DataType {
    /// All members of the closed set, in declaration order.
    pub const ALL: &'static [DataType] = &[
        Self::Any,
        Self::String,
        Self::Number,
        Self::Boolean,
        Self::Object,
        Self::Array,
        Self::Json,
        Self::File,
        Self::Image,
        Self::Binary,
        Self::Html,
        Self::Table,
        Self::BrowserInstance,
        Self::BrowserPage,
        Self::BrowserElement,
        Self::AiModel,
        Self::AiMemory,
        Self::AiTool,
        Self::Credential,
        Self::HttpResponse,
    ];

    /// Whether a value of type `source` may flow into a port declaring `self`.
    ///
    /// Rules, in order: exact match; `any` on either end accepts; declared
    /// widening (`browser_page` into `browser_instance`, `object` into
    /// `json`, and primitives into `json` via `object`/`array` only where
    /// declared).
    #[must_use]
    pub fn accepts(self, source: DataType) -> bool {
        if self == source || self == Self::Any || source == Self::Any {
            return true;
        }
        matches!(
            (self, source),
            (Self::BrowserInstance, Self::BrowserPage)
                | (Self::Json, Self::Object | Self::Array)
        )
    }

    /// Whether this type is one of the scalar primitives.
    #[must_use]
    pub fn is_primitive(self) -> bool {
        matches!(self, Self::String | Self::Number | Self::Boolean)
    }

    /// Whether a concrete JSON value is acceptable for this declared type.
    ///
    /// Handle-like types (`file`, `browser_page`, `credential`, ...) travel
    /// as JSON objects or strings on the wire, so they accept both.
    #[must_use]
    pub fn matches_value(self, value: &serde_json::Value) -> bool {
        use serde_json::Value;
        match self {
            Self::Any | Self::Json => true,
            Self::String | Self::Html => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object | Self::HttpResponse | Self::Table => value.is_object(),
            Self::Array => value.is_array(),
            Self::File
            | Self::Image
            | Self::Binary
            | Self::BrowserInstance
            | Self::BrowserPage
            | Self::BrowserElement
            | Self::AiModel
            | Self::AiMemory
            | Self::AiTool
            | Self::Credential => matches!(value, Value::String(_) | Value::Object(_)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn exact_match_accepts() {
        for &ty in DataType::ALL {
            assert!(ty.accepts(ty));
        }
    }

    #[test]
    fn any_accepts_everything() {
        for &ty in DataType::ALL {
            assert!(DataType::Any.accepts(ty));
            assert!(ty.accepts(DataType::Any));
        }
    }

    #[rstest]
    #[case(DataType::BrowserInstance, DataType::BrowserPage, true)]
    #[case(DataType::BrowserPage, DataType::BrowserInstance, false)]
    #[case(DataType::Json, DataType::Object, true)]
    #[case(DataType::Json, DataType::Array, true)]
    #[case(DataType::Object, DataType::Json, false)]
    #[case(DataType::String, DataType::Number, false)]
    #[case(DataType::BrowserElement, DataType::BrowserPage, false)]
    fn hierarchy(#[case] target: DataType, #[case] source: DataType, #[case] expect: bool) {
        assert_eq!(target.accepts(source), expect);
    }

    #[test]
    fn primitives() {
        assert!(DataType::String.is_primitive());
        assert!(DataType::Number.is_primitive());
        assert!(DataType::Boolean.is_primitive());
        assert!(!DataType::Object.is_primitive());
        assert!(!DataType::Any.is_primitive());
    }

    #[test]
    fn serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&DataType::BrowserPage).unwrap(),
            r#""browser_page""#
        );
        assert_eq!(
            serde_json::to_string(&DataType::HttpResponse).unwrap(),
            r#""http_response""#
        );
        let back: DataType = serde_json::from_str(r#""ai_model""#).unwrap();
        assert_eq!(back, DataType::AiModel);
    }
}
