//! Condition evaluation for `flow.branch` and `flow.switch`.
//!
//! This is deliberately not an expression language: after variable
//! resolution a condition is either a typed scalar (judged by
//! truthiness) or a single comparison `lhs OP rhs` with the operators
//! `==`, `!=`, `>=`, `<=`, `>`, `<`. Anything richer belongs in a module.

use serde_json::Value;

/// Truthiness of a resolved value.
#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => {
            let trimmed = s.trim();
            !(trimmed.is_empty() || trimmed == "false" || trimmed == "0" || trimmed == "null")
        }
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Evaluate a resolved condition value.
///
/// Strings are scanned for a single comparison operator; both operands
/// parse as JSON scalars when possible and fall back to string
/// comparison. Operator-free values reduce to truthiness.
#[must_use]
pub fn evaluate(value: &Value) -> bool {
    let Value::String(text) = value else {
        return is_truthy(value);
    };

    // Two-character operators first so ">=" is not read as ">".
    for op in ["==", "!=", ">=", "<=", ">", "<"] {
        if let Some(index) = text.find(op) {
            let lhs = parse_operand(&text[..index]);
            let rhs = parse_operand(&text[index + op.len()..]);
            return compare(&lhs, op, &rhs);
        }
    }
    is_truthy(value)
}

fn parse_operand(text: &str) -> Value {
    let trimmed = text.trim();
    // Quoted operands are string literals.
    if let Some(inner) = trimmed
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
    {
        return Value::String(inner.to_owned());
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_owned()))
}

fn compare(lhs: &Value, op: &str, rhs: &Value) -> bool {
    if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
        return match op {
            "==" => (a - b).abs() < f64::EPSILON,
            "!=" => (a - b).abs() >= f64::EPSILON,
            ">=" => a >= b,
            "<=" => a <= b,
            ">" => a > b,
            "<" => a < b,
            _ => false,
        };
    }
    let a = stringify(lhs);
    let b = stringify(rhs);
    match op {
        "==" => a == b,
        "!=" => a != b,
        ">=" => a >= b,
        "<=" => a <= b,
        ">" => a > b,
        "<" => a < b,
        _ => false,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case(json!(true), true)]
    #[case(json!(false), false)]
    #[case(json!(null), false)]
    #[case(json!(1), true)]
    #[case(json!(0), false)]
    #[case(json!(-0.0), false)]
    #[case(json!([]), false)]
    #[case(json!([1]), true)]
    #[case(json!({}), false)]
    fn truthiness(#[case] value: Value, #[case] expect: bool) {
        assert_eq!(is_truthy(&value), expect);
    }

    #[rstest]
    #[case("5 > 0", true)]
    #[case("-1 > 0", false)]
    #[case("5 >= 5", true)]
    #[case("3 <= 2", false)]
    #[case("2 < 10", true)]
    #[case("1 == 1", true)]
    #[case("1 != 1", false)]
    #[case("1.5 > 1.4", true)]
    fn numeric_comparisons(#[case] text: &str, #[case] expect: bool) {
        assert_eq!(evaluate(&json!(text)), expect);
    }

    #[rstest]
    #[case("abc == abc", true)]
    #[case("abc == abd", false)]
    #[case("'a b' == 'a b'", true)]
    #[case("abc != xyz", true)]
    fn string_comparisons(#[case] text: &str, #[case] expect: bool) {
        assert_eq!(evaluate(&json!(text)), expect);
    }

    #[rstest]
    #[case("yes", true)]
    #[case("", false)]
    #[case("false", false)]
    #[case("0", false)]
    #[case("null", false)]
    fn operator_free_strings_reduce_to_truthiness(#[case] text: &str, #[case] expect: bool) {
        assert_eq!(evaluate(&json!(text)), expect);
    }

    #[test]
    fn non_string_values_use_truthiness() {
        assert!(evaluate(&json!(7)));
        assert!(!evaluate(&json!(null)));
    }

    #[test]
    fn ge_is_not_read_as_gt() {
        // "5 >= 5" must hit ">=" and be true, not ">" with "= 5".
        assert!(evaluate(&json!("5 >= 5")));
    }
}
