//! UUID-backed identifiers.
//!
//! [`ExecutionId`] is a [`domain-key`](https://crates.io/crates/domain-key)
//! `Uuid<D>` wrapper parameterized by a unique domain marker, so executions
//! cannot be confused with other UUID-typed entities at compile time.
//!
//! The type is `Copy` (16 bytes, stack-allocated) and supports:
//! - `v4()` for random generation
//! - `nil()` for the zero value
//! - `parse(&str)` for string parsing
//! - Full serde support (serializes as UUID string)
//! - `Display`, `FromStr`, `Eq`, `Ord`, `Hash`

use domain_key::define_uuid;

// Re-export for downstream parse error handling
pub use domain_key::UuidParseError;

define_uuid!(pub ExecutionIdDomain => ExecutionId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_creates_non_nil() {
        let id = ExecutionId::v4();
        assert!(!id.is_nil());
    }

    #[test]
    fn nil_is_zero_valued() {
        let id = ExecutionId::nil();
        assert!(id.is_nil());
        assert_eq!(id.to_string(), "00000000-0000-0000-0000-000000000000");
    }

    #[test]
    fn parse_valid_uuid_string() {
        let id = ExecutionId::parse("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert!(!id.is_nil());
        assert_eq!(id.to_string(), "550e8400-e29b-41d4-a716-446655440000");
    }

    #[test]
    fn parse_invalid_string_returns_error() {
        assert!(ExecutionId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn copy_semantics_both_copies_usable() {
        let id1 = ExecutionId::v4();
        let id2 = id1;
        assert_eq!(id1, id2);
    }

    #[test]
    fn serde_json_roundtrip() {
        let id = ExecutionId::v4();
        let json = serde_json::to_string(&id).unwrap();
        let back: ExecutionId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn hash_is_consistent() {
        use std::collections::HashSet;
        let id = ExecutionId::v4();
        let mut set = HashSet::new();
        set.insert(id);
        assert!(set.contains(&id));
    }
}
