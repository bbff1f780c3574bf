use std::collections::HashMap;

use chrono::{self, LocalResult, TimeZone, Utc};
use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::util::f64_to_i64_safe;

lazy_static! {
    // major, optional .minor, optional .patch, then whatever prerelease/build suffix remains
    static ref PARTIAL_VERSION_REGEX: Regex =
        Regex::new(r"^(?P<major>\d+)(?:\.(?P<minor>\d+))?(?:\.(?P<patch>\d+))?(?P<rest>[-+].*)?$")
            .expect("version regex is valid");
}

/// A JSON-like value held by a [crate::Context] attribute or used as a clause comparison value.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A string.
    String(String),
    /// An ordered list of values. Clauses treat each element as a separate candidate.
    Array(Vec<AttributeValue>),
    /// A number. Integers and floats are not distinguished.
    Number(f64),
    /// A boolean.
    Bool(bool),
    /// A map of nested values, addressable with slash-delimited references.
    Object(HashMap<String, AttributeValue>),
    /// Null behaves as if the attribute were absent.
    Null,
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> AttributeValue {
        AttributeValue::String(s.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> AttributeValue {
        AttributeValue::String(s)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> AttributeValue {
        AttributeValue::Bool(b)
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Number(i as f64)
    }
}

impl From<f64> for AttributeValue {
    fn from(f: f64) -> Self {
        AttributeValue::Number(f)
    }
}

impl<T> From<Vec<T>> for AttributeValue
where
    AttributeValue: From<T>,
{
    fn from(v: Vec<T>) -> AttributeValue {
        AttributeValue::Array(v.into_iter().map(AttributeValue::from).collect())
    }
}

impl<S, T> FromIterator<(S, T)> for AttributeValue
where
    String: From<S>,
    AttributeValue: From<T>,
{
    fn from_iter<I: IntoIterator<Item = (S, T)>>(iter: I) -> Self {
        AttributeValue::Object(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl AttributeValue {
    /// Returns None unless self is a String. It will not convert.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns None unless self is a bool. It will not convert.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the wrapped value as a float for numbers, and None otherwise.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(f) => Some(*f),
            _ => None,
        }
    }

    /// Like [AttributeValue::to_f64], but numeric-looking strings such as `"42"` or `" 1.5 "` are
    /// also accepted. Used by the numeric comparison operators.
    pub fn to_numeric(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(f) => Some(*f),
            AttributeValue::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            _ => None,
        }
    }

    /// Attempt to convert any of the following into a chrono::DateTime in UTC:
    ///  * RFC3339/ISO8601 timestamp (example: "2016-04-16T17:09:12.759-07:00")
    ///  * Unix epoch milliseconds as number
    ///
    /// Returns None if the conversion fails or if no conversion is possible.
    pub fn to_datetime(&self) -> Option<chrono::DateTime<Utc>> {
        match self {
            AttributeValue::Number(millis) => {
                f64_to_i64_safe(*millis).and_then(|millis| match Utc.timestamp_millis_opt(millis) {
                    LocalResult::Single(time) => Some(time),
                    _ => None,
                })
            }
            AttributeValue::String(s) => chrono::DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok(),
            AttributeValue::Bool(_) | AttributeValue::Null => None,
            other => {
                warn!("cannot interpret attribute value {:?} as a date", other);
                None
            }
        }
    }

    /// Attempt to parse a string attribute into a semantic version.
    ///
    /// Minor and patch components may be omitted (`"2"` and `"2.1"` are read as `2.0.0` and
    /// `2.1.0`). Build metadata is dropped so that it never affects comparisons. Returns None for
    /// non-string attributes and unparseable strings.
    pub fn as_semver(&self) -> Option<semver::Version> {
        let version_str = self.as_str()?;
        let mut version = semver::Version::parse(version_str)
            .ok()
            .or_else(|| parse_partial_version(version_str))?;
        version.build = semver::BuildMetadata::EMPTY;
        Some(version)
    }

    /// Find the first value matching the predicate `p`. Arrays are searched element by element;
    /// null never matches.
    pub fn find<P>(&self, p: P) -> Option<&AttributeValue>
    where
        P: Fn(&AttributeValue) -> bool,
    {
        match self {
            AttributeValue::Array(values) => values.iter().find(|v| p(v)),
            AttributeValue::Null => None,
            _ => p(self).then_some(self),
        }
    }

    /// The string fed into the bucketing hash: strings as-is, integral numbers in integer form.
    /// Everything else is not bucketable.
    #[allow(clippy::float_cmp)]
    pub(crate) fn as_bucketable(&self) -> Option<String> {
        match self {
            AttributeValue::String(s) => Some(s.clone()),
            AttributeValue::Number(f) => {
                f64_to_i64_safe(*f).and_then(|i| (i as f64 == *f).then(|| i.to_string()))
            }
            _ => None,
        }
    }
}

fn parse_partial_version(version_str: &str) -> Option<semver::Version> {
    let captures = PARTIAL_VERSION_REGEX.captures(version_str)?;
    let component = |name: &str| captures.name(name).map_or("0", |m| m.as_str());

    let normalized = format!(
        "{}.{}.{}{}",
        component("major"),
        component("minor"),
        component("patch"),
        captures.name("rest").map_or("", |m| m.as_str())
    );
    semver::Version::parse(&normalized).ok()
}

#[cfg(test)]
mod tests {
    use super::AttributeValue;
    use maplit::hashmap;
    use test_case::test_case;

    #[test]
    fn deserialization() {
        fn check(json: &str, expected: AttributeValue) {
            assert_eq!(
                serde_json::from_str::<AttributeValue>(json).unwrap(),
                expected
            );
        }

        check("1.0", AttributeValue::Number(1.0));
        check("1", AttributeValue::Number(1.0));
        check("true", AttributeValue::Bool(true));
        check("null", AttributeValue::Null);
        check("\"foo\"", AttributeValue::String("foo".to_string()));
        check(
            r#"{"foo":123}"#,
            AttributeValue::Object(hashmap!["foo".to_string() => AttributeValue::Number(123.0)]),
        );
        check(
            r#"["a", 2]"#,
            AttributeValue::Array(vec!["a".into(), 2_i64.into()]),
        );
    }

    #[test_case(AttributeValue::from("abc"), Some("abc") ; "string")]
    #[test_case(AttributeValue::from(33_i64), Some("33") ; "integer")]
    #[test_case(AttributeValue::from(-4.0), Some("-4") ; "integral float")]
    #[test_case(AttributeValue::from(33.5), None ; "fractional float")]
    #[test_case(AttributeValue::from(true), None ; "boolean")]
    #[test_case(AttributeValue::from(vec!["a"]), None ; "array")]
    #[test_case(AttributeValue::Null, None ; "null")]
    fn bucketable_values(value: AttributeValue, expected: Option<&str>) {
        assert_eq!(value.as_bucketable().as_deref(), expected);
    }

    #[test_case("1", Some(1.0) ; "integer string")]
    #[test_case(" 2.5 ", Some(2.5) ; "padded float string")]
    #[test_case("Tuesday", None ; "word")]
    #[test_case("NaN", None ; "nan string")]
    fn numeric_strings_are_coerced(input: &str, expected: Option<f64>) {
        assert_eq!(AttributeValue::from(input).to_numeric(), expected);
    }

    #[test_case("2", "2.0.0" ; "major only")]
    #[test_case("2.1", "2.1.0" ; "major and minor")]
    #[test_case("2.1-rc.1", "2.1.0-rc.1" ; "partial with prerelease")]
    #[test_case("2.1.3+build.5", "2.1.3" ; "build metadata dropped")]
    fn partial_semver_is_completed(input: &str, expected: &str) {
        let parsed = AttributeValue::from(input).as_semver().unwrap();
        assert_eq!(parsed, semver::Version::parse(expected).unwrap());
    }

    #[test]
    fn unparseable_semver_is_none() {
        assert!(AttributeValue::from("x.y.z").as_semver().is_none());
        assert!(AttributeValue::from("2.0.0.0").as_semver().is_none());
        assert!(AttributeValue::from(2_i64).as_semver().is_none());
    }

    #[test]
    fn find_searches_arrays_but_not_null() {
        let array = AttributeValue::from(vec!["a", "b"]);
        assert_eq!(
            array.find(|v| v.as_str() == Some("b")),
            Some(&AttributeValue::from("b"))
        );
        assert!(AttributeValue::Null.find(|_| true).is_none());
    }
}
