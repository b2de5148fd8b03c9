//! Dynamic values flowing between nodes.
//!
//! Node configuration, node outputs and trigger payloads are all JSON trees,
//! so the engine works directly on [`serde_json::Value`]. This module adds the
//! coercion rules the expression engine and node handlers share.

pub use serde_json::{Map, Number, Value};

/// Largest integer magnitude an `f64` represents exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Coercion helpers over [`Value`].
pub trait ValueExt {
    /// Truthiness: `null`, `false`, `0`, `NaN` and `""` are falsy; everything
    /// else (including empty arrays and objects) is truthy.
    fn is_truthy(&self) -> bool;

    /// Short type tag used in error messages and by `typeOf()`.
    fn type_name(&self) -> &'static str;

    /// String form used when splicing a value into a larger template.
    fn to_display_string(&self) -> String;

    /// Numeric view of the value, without string parsing.
    fn to_f64(&self) -> Option<f64>;
}

impl ValueExt for Value {
    fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    fn to_display_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn to_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }
}

/// Build a JSON number from an `f64`, keeping integral results integral.
///
/// Non-finite results have no JSON representation and become `null`.
pub fn number(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Structural equality where numbers compare by numeric value (`1 == 1.0`).
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| loose_eq(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, v)| y.get(k).map(|w| loose_eq(v, w)).unwrap_or(false))
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integral_floats_stay_integral() {
        assert_eq!(number(10.0), json!(10));
        assert_eq!(number(2.5), json!(2.5));
        assert_eq!(number(f64::NAN), Value::Null);
    }

    #[test]
    fn truthiness_follows_template_rules() {
        assert!(!json!(null).is_truthy());
        assert!(!json!("").is_truthy());
        assert!(!json!(0).is_truthy());
        assert!(json!([]).is_truthy());
        assert!(json!("0").is_truthy());
    }

    #[test]
    fn numeric_view_does_not_parse_strings() {
        assert_eq!(json!(3).to_f64(), Some(3.0));
        assert_eq!(json!(2.5).to_f64(), Some(2.5));
        assert_eq!(json!("3").to_f64(), None);
        assert_eq!(json!(null).to_f64(), None);
    }

    #[test]
    fn numbers_compare_by_value() {
        assert!(loose_eq(&json!(1), &json!(1.0)));
        assert!(loose_eq(&json!({"a": [1, 2]}), &json!({"a": [1.0, 2]})));
        assert!(!loose_eq(&json!("1"), &json!(1)));
    }
}
