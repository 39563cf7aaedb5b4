//! JSON convertibility predicates and coercions.
//!
//! The store validates values by *convertibility*, not by exact JSON type:
//! null coerces to each type's zero value, booleans and numbers
//! interconvert, reals truncate to integers. Strings never silently parse
//! into other types. Consumers read effective values through the same
//! functions so validation and use can never disagree.

use serde_json::Value;

/// String form of a scalar value. `None` for arrays and objects.
pub fn to_string_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some(String::new()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// Signed-integer form of a value. Reals truncate; out-of-range reals and
/// everything non-numeric are unconvertible.
pub fn to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Null => Some(0),
        Value::Bool(b) => Some(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i)
            } else if let Some(u) = n.as_u64() {
                i64::try_from(u).ok()
            } else {
                let f = n.as_f64()?;
                (f.is_finite() && f >= i64::MIN as f64 && f < i64::MAX as f64).then_some(f as i64)
            }
        }
        Value::String(_) | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Unsigned-integer form of a value. Negative values are unconvertible.
pub fn to_u64(value: &Value) -> Option<u64> {
    if let Value::Number(n) = value
        && let Some(u) = n.as_u64()
    {
        return Some(u);
    }
    to_i64(value).and_then(|i| u64::try_from(i).ok())
}

/// Real-number form of a value.
pub fn to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Null => Some(0.0),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64(),
        Value::String(_) | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Boolean form of a value. Numbers compare against zero.
pub fn to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Null => Some(false),
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(_) | Value::Array(_) | Value::Object(_) => None,
    }
}
