//! Comparison and hashing rules for the JSON cells held by a `SafeTable`.
//!
//! Numbers compare by value regardless of integer/float encoding, so `1`
//! and `1.0` are equal, group together and join together. Booleans are
//! never numbers here.

use std::cmp::Ordering;

use serde_json::{Number, Value};

/// Numeric view of a cell; booleans and strings are not numeric.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Equality used by `==`, `!=`, `in`, grouping and joins.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => numbers_cmp(x, y) == Ordering::Equal,
        _ => a == b,
    }
}

/// Ordering used by `>`, `<`, `>=`, `<=`, `min` and `max`.
///
/// Only numbers with numbers, strings with strings and booleans with
/// booleans are ordered; every other pair (including null) is not.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Some(numbers_cmp(x, y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Total order for sorting. Nulls are handled by the caller.
pub fn sort_cmp(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => numbers_cmp(x, y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            a.to_string().cmp(&b.to_string())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Hashable identity of a cell; two cells share a key iff [`values_equal`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    Null,
    Bool(bool),
    /// Integers, and floats with no fractional part.
    Int(i128),
    /// Bit pattern of any other float.
    Float(u64),
    Text(String),
    /// Arrays and objects, by their serialized form.
    Json(String),
}

pub fn hash_key(value: &Value) -> HashKey {
    match value {
        Value::Null => HashKey::Null,
        Value::Bool(b) => HashKey::Bool(*b),
        Value::Number(n) => match exact_int(n) {
            Some(i) => HashKey::Int(i),
            None => HashKey::Float(n.as_f64().unwrap_or(f64::NAN).to_bits()),
        },
        Value::String(s) => HashKey::Text(s.clone()),
        other => HashKey::Json(other.to_string()),
    }
}

/// Key for a tuple of cells, as used by multi-column groups.
pub fn composite_key(values: &[&Value]) -> Vec<HashKey> {
    values.iter().map(|v| hash_key(v)).collect()
}

/// Convert a float into a JSON number, `None` for NaN and infinities.
pub fn float_value(x: f64) -> Option<Value> {
    Number::from_f64(x).map(Value::Number)
}

fn numbers_cmp(x: &Number, y: &Number) -> Ordering {
    if let (Some(a), Some(b)) = (exact_int(x), exact_int(y)) {
        return a.cmp(&b);
    }
    let a = x.as_f64().unwrap_or(f64::NAN);
    let b = y.as_f64().unwrap_or(f64::NAN);
    a.total_cmp(&b)
}

/// The integer a number denotes exactly, integral floats included.
fn exact_int(n: &Number) -> Option<i128> {
    if let Some(i) = n.as_i64() {
        return Some(i128::from(i));
    }
    if let Some(u) = n.as_u64() {
        return Some(i128::from(u));
    }
    let f = n.as_f64()?;
    (f.is_finite() && f.fract() == 0.0 && f.abs() < 1.0e38).then(|| f as i128)
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Number(_) => 0,
        Value::String(_) => 1,
        Value::Bool(_) => 2,
        Value::Array(_) => 3,
        Value::Object(_) => 4,
        Value::Null => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numbers_equal_across_encodings() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert_eq!(hash_key(&json!(1)), hash_key(&json!(1.0)));
        assert_ne!(hash_key(&json!(1)), hash_key(&json!(1.5)));
        assert!(!values_equal(&json!(1), &json!(true)));
        assert!(values_equal(&Value::Null, &Value::Null));
    }

    #[test]
    fn test_compare_values() {
        assert_eq!(compare_values(&json!(2), &json!(10)), Some(Ordering::Less));
        assert_eq!(compare_values(&json!("b"), &json!("a")), Some(Ordering::Greater));
        assert_eq!(compare_values(&json!(1), &json!("1")), None);
        assert_eq!(compare_values(&Value::Null, &json!(1)), None);
    }

    #[test]
    fn test_sort_cmp_is_total_across_types() {
        let mut values = vec![json!("x"), json!(true), json!(3), json!([1]), json!(1.5)];
        values.sort_by(sort_cmp);
        assert_eq!(values, vec![json!(1.5), json!(3), json!("x"), json!(true), json!([1])]);
    }

    #[test]
    fn test_hash_key_distinguishes_types() {
        assert_ne!(hash_key(&json!("1")), hash_key(&json!(1)));
        assert_ne!(hash_key(&json!(true)), hash_key(&json!("true")));
        assert_ne!(composite_key(&[&json!("a"), &json!("b")]), composite_key(&[&json!("ab")]));
        assert_ne!(
            composite_key(&[&json!("x\u{1f}s:y"), &json!("z")]),
            composite_key(&[&json!("x"), &json!("y\u{1f}s:z")])
        );
    }

    #[test]
    fn test_large_integral_numbers_share_keys() {
        let int = json!(9007199254740992_i64);
        let float = json!(9007199254740992.0_f64);
        assert!(values_equal(&int, &float));
        assert_eq!(hash_key(&int), hash_key(&float));

        let above = json!(9007199254740993_i64);
        assert!(!values_equal(&above, &float));
        assert_ne!(hash_key(&above), hash_key(&float));
        assert_eq!(compare_values(&above, &float), Some(Ordering::Greater));

        assert_eq!(hash_key(&json!(u64::MAX)), HashKey::Int(i128::from(u64::MAX)));
        assert_eq!(hash_key(&json!(-0.0)), hash_key(&json!(0)));
    }
}
