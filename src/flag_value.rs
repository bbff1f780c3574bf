use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::f64_to_i64_safe;

/// One of a flag's variation values.
///
/// JSON numbers always deserialize as [FlagValue::Float]; [FlagValue::Int] exists for values
/// built in code.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Str(String),
    Float(f64),
    Int(i64),
    Json(Value),
}

impl From<bool> for FlagValue {
    fn from(b: bool) -> FlagValue {
        FlagValue::Bool(b)
    }
}

impl From<&str> for FlagValue {
    fn from(s: &str) -> FlagValue {
        FlagValue::Str(s.to_owned())
    }
}

impl From<String> for FlagValue {
    fn from(s: String) -> FlagValue {
        FlagValue::Str(s)
    }
}

impl From<f64> for FlagValue {
    fn from(f: f64) -> FlagValue {
        FlagValue::Float(f)
    }
}

impl From<i64> for FlagValue {
    fn from(i: i64) -> FlagValue {
        FlagValue::Int(i)
    }
}

impl From<Value> for FlagValue {
    fn from(v: Value) -> Self {
        match v {
            Value::Bool(b) => b.into(),
            Value::String(s) => s.into(),
            Value::Number(n) => match n.as_f64() {
                Some(f) => f.into(),
                None => FlagValue::Json(Value::Number(n)),
            },
            Value::Null | Value::Object(_) | Value::Array(_) => FlagValue::Json(v),
        }
    }
}

impl FlagValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FlagValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FlagValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The value as a float, if it is any kind of number.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            FlagValue::Float(f) => Some(*f),
            FlagValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// The value as an integer. Floats are truncated; floats outside the range in which they
    /// still hold exact integers give None.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FlagValue::Int(i) => Some(*i),
            FlagValue::Float(f) => f64_to_i64_safe(*f),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FlagValue::Bool(b) => Value::from(*b),
            FlagValue::Str(s) => Value::from(s.as_str()),
            FlagValue::Float(f) => Value::from(*f),
            FlagValue::Int(i) => Value::from(*i),
            FlagValue::Json(v) => v.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FlagValue;
    use serde_json::json;
    use spectral::prelude::*;
    use test_case::test_case;

    #[test_case(json!(true), FlagValue::Bool(true) ; "bool")]
    #[test_case(json!("on"), FlagValue::Str("on".into()) ; "string")]
    #[test_case(json!(3), FlagValue::Float(3.0) ; "integral number")]
    #[test_case(json!(2.5), FlagValue::Float(2.5) ; "fractional number")]
    #[test_case(json!({"a": [1]}), FlagValue::Json(json!({"a": [1]})) ; "object")]
    #[test_case(json!(null), FlagValue::Json(json!(null)) ; "null")]
    fn deserializes_variations(json: serde_json::Value, expected: FlagValue) {
        let parsed: FlagValue = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(parsed, expected);
        assert_eq!(FlagValue::from(json), expected);
    }

    #[test_case(1.99, Some(1) ; "truncates")]
    #[test_case(9007199254740991.0, Some(9007199254740991) ; "largest exact")]
    #[test_case(9007199254740992.0, None ; "too large")]
    #[test_case(-9007199254740991.0, Some(-9007199254740991) ; "smallest exact")]
    #[test_case(-9007199254740992.0, None ; "too small")]
    fn float_to_int(have: f64, expect: Option<i64>) {
        assert_that!(FlagValue::Float(have).as_int()).is_equal_to(expect);
    }

    #[test]
    fn accessors_check_type() {
        let value = FlagValue::from("text");
        assert_that!(value.as_str()).contains_value("text");
        assert_that!(value.as_bool()).is_none();
        assert_that!(value.as_float()).is_none();

        assert_that!(FlagValue::Int(4).as_float()).contains_value(4.0);
        assert_that!(FlagValue::Bool(false).as_bool()).contains_value(false);
        assert_eq!(FlagValue::Int(7).to_json(), json!(7));
        assert_eq!(FlagValue::Json(json!([1, 2])).to_json(), json!([1, 2]));
    }
}
