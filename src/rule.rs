use chrono::{self, Utc};
use log::{error, warn};
use regex::Regex;
use serde::Deserialize;

use crate::contexts::attribute_reference::Reference;
use crate::contexts::context::{Context, Kind};
use crate::eval::{EvaluationStack, Evaluator};
use crate::variation::VariationOrRollout;
use crate::AttributeValue;

/// A single targeting condition: the context attribute named by `attribute` is compared against
/// `values` using `op`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Clause {
    #[serde(default)]
    context_kind: Kind,
    attribute: Reference,
    #[serde(default)]
    negate: bool,
    op: Op,
    values: Vec<AttributeValue>,
}

/// A flag rule: if every clause matches, the context receives the rule's variation or rollout.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlagRule {
    #[serde(default)]
    pub id: String,
    clauses: Vec<Clause>,
    #[serde(flatten)]
    pub variation_or_rollout: VariationOrRollout,
    #[serde(default)]
    pub track_events: bool,
}

/// The closed set of clause operators. Names not in the set deserialize as `Unknown`, which
/// never matches.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Op {
    In,
    StartsWith,
    EndsWith,
    Contains,
    Matches,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Before,
    After,
    SegmentMatch,
    SemVerEqual,
    SemVerGreaterThan,
    SemVerLessThan,
    #[serde(other)]
    Unknown,
}

impl Clause {
    /// Match a clause of a flag rule. `segmentMatch` clauses consult the evaluator's segments.
    ///
    /// Returns an error for an invalid attribute reference, which makes the whole flag
    /// malformed.
    pub(crate) fn matches(
        &self,
        context: &Context,
        evaluator: &Evaluator,
        stack: &mut EvaluationStack,
    ) -> Result<bool, String> {
        if self.op == Op::SegmentMatch {
            Ok(self.matches_segment(context, evaluator, stack))
        } else {
            self.matches_non_segment(context)
        }
    }

    fn maybe_negate(&self, v: bool) -> bool {
        if self.negate {
            !v
        } else {
            v
        }
    }

    fn matches_segment(
        &self,
        context: &Context,
        evaluator: &Evaluator,
        stack: &mut EvaluationStack,
    ) -> bool {
        let any_match = self.values.iter().any(|value| {
            let Some(segment) = value
                .as_str()
                .and_then(|segment_key| evaluator.store.segment(segment_key))
            else {
                return false;
            };
            let result = segment.contains(context, evaluator.big_segments, stack);
            if let Some(status) = result.big_segments_status {
                stack.record_big_segments_status(status);
            }
            result.is_match
        });
        self.maybe_negate(any_match)
    }

    /// Match a clause against the context's own attributes. `segmentMatch` clauses never match
    /// here.
    pub(crate) fn matches_non_segment(&self, context: &Context) -> Result<bool, String> {
        if !self.attribute.is_valid() {
            return Err(self.attribute.error());
        }

        if self.attribute.is_kind() {
            let any_kind = context
                .kinds()
                .iter()
                .any(|kind| self.matches_any_value(&AttributeValue::String(kind.to_string())));
            return Ok(self.maybe_negate(any_kind));
        }

        let Some(actual_context) = context.as_kind(&self.context_kind) else {
            return Ok(false);
        };

        let context_value = match actual_context.get_value(&self.attribute) {
            None | Some(AttributeValue::Null) => return Ok(false),
            Some(v) => v,
        };

        let any_match = context_value
            .find(|candidate| self.matches_any_value(candidate))
            .is_some();
        Ok(self.maybe_negate(any_match))
    }

    fn matches_any_value(&self, context_value: &AttributeValue) -> bool {
        self.values
            .iter()
            .any(|clause_value| self.op.matches(context_value, clause_value))
    }

    pub(crate) fn is_segment_match(&self) -> bool {
        self.op == Op::SegmentMatch
    }

    #[cfg(test)]
    pub(crate) fn new(attribute: &str, op: Op, values: Vec<AttributeValue>) -> Self {
        Clause {
            context_kind: Kind::user(),
            attribute: Reference::new(attribute),
            negate: false,
            op,
            values,
        }
    }

    #[cfg(test)]
    pub(crate) fn new_match(attribute: &str, value: AttributeValue) -> Self {
        Self::new(attribute, Op::Matches, vec![value])
    }

    #[cfg(test)]
    pub(crate) fn new_segment_match(segment_keys: Vec<&str>) -> Self {
        Self::new(
            "key",
            Op::SegmentMatch,
            segment_keys.into_iter().map(AttributeValue::from).collect(),
        )
    }
}

impl FlagRule {
    /// A rule matches if all of its clauses do.
    pub(crate) fn matches(
        &self,
        context: &Context,
        evaluator: &Evaluator,
        stack: &mut EvaluationStack,
    ) -> Result<bool, String> {
        for clause in &self.clauses {
            if !clause.matches(context, evaluator, stack)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    #[cfg(test)]
    pub(crate) fn new(id: &str, clauses: Vec<Clause>, variation_or_rollout: VariationOrRollout) -> Self {
        FlagRule {
            id: id.to_string(),
            clauses,
            variation_or_rollout,
            track_events: false,
        }
    }
}

impl Op {
    fn matches(&self, lhs: &AttributeValue, rhs: &AttributeValue) -> bool {
        match self {
            Op::In => lhs == rhs,

            // string ops
            Op::StartsWith => string_op(lhs, rhs, |l, r| l.starts_with(r)),
            Op::EndsWith => string_op(lhs, rhs, |l, r| l.ends_with(r)),
            Op::Contains => string_op(lhs, rhs, |l, r| l.contains(r)),
            Op::Matches => string_op(lhs, rhs, |l, r| match Regex::new(r) {
                Ok(re) => re.is_match(l),
                Err(e) => {
                    warn!("invalid regex for 'matches' operator ({}): {}", e, r);
                    false
                }
            }),

            // numeric ops
            Op::LessThan => numeric_op(lhs, rhs, |l, r| l < r),
            Op::LessThanOrEqual => numeric_op(lhs, rhs, |l, r| l <= r),
            Op::GreaterThan => numeric_op(lhs, rhs, |l, r| l > r),
            Op::GreaterThanOrEqual => numeric_op(lhs, rhs, |l, r| l >= r),

            Op::Before => time_op(lhs, rhs, |l, r| l < r),
            Op::After => time_op(lhs, rhs, |l, r| l > r),

            Op::SemVerEqual => semver_op(lhs, rhs, |l, r| l == r),
            Op::SemVerLessThan => semver_op(lhs, rhs, |l, r| l < r),
            Op::SemVerGreaterThan => semver_op(lhs, rhs, |l, r| l > r),

            Op::SegmentMatch => {
                error!("segmentMatch operator should be special-cased, shouldn't get here");
                false
            }
            Op::Unknown => false,
        }
    }
}

fn string_op<F: Fn(&str, &str) -> bool>(lhs: &AttributeValue, rhs: &AttributeValue, f: F) -> bool {
    match (lhs.as_str(), rhs.as_str()) {
        (Some(l), Some(r)) => f(l, r),
        _ => false,
    }
}

fn numeric_op<F: Fn(f64, f64) -> bool>(lhs: &AttributeValue, rhs: &AttributeValue, f: F) -> bool {
    match (lhs.to_numeric(), rhs.to_numeric()) {
        (Some(l), Some(r)) => f(l, r),
        _ => false,
    }
}

fn time_op<F: Fn(chrono::DateTime<Utc>, chrono::DateTime<Utc>) -> bool>(
    lhs: &AttributeValue,
    rhs: &AttributeValue,
    f: F,
) -> bool {
    match (lhs.to_datetime(), rhs.to_datetime()) {
        (Some(l), Some(r)) => f(l, r),
        _ => false,
    }
}

fn semver_op<F: Fn(semver::Version, semver::Version) -> bool>(
    lhs: &AttributeValue,
    rhs: &AttributeValue,
    f: F,
) -> bool {
    match (lhs.as_semver(), rhs.as_semver()) {
        (Some(l), Some(r)) => f(l, r),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use maplit::hashmap;
    use test_case::test_case;

    use super::*;
    use crate::{ContextBuilder, MultiContextBuilder};

    fn astring(s: &str) -> AttributeValue {
        AttributeValue::String(s.into())
    }
    fn anum(f: f64) -> AttributeValue {
        AttributeValue::Number(f)
    }

    #[test]
    fn test_op_in() {
        assert!(Op::In.matches(&astring("foo"), &astring("foo")));
        assert!(!Op::In.matches(&astring("foo"), &astring("bar")));
        assert!(
            !Op::In.matches(&astring("Foo"), &astring("foo")),
            "case sensitive"
        );

        assert!(Op::In.matches(&anum(42.0), &anum(42.0)));
        assert!(!Op::In.matches(&anum(42.0), &anum(3.0)));
        assert!(Op::In.matches(&anum(0.0), &anum(-0.0)));

        assert!(
            !Op::In.matches(&astring("42"), &anum(42.0)),
            "no coercion between types"
        );
        assert!(Op::In.matches(&true.into(), &true.into()));
    }

    #[test_case(Op::StartsWith, "food", "foo", true ; "starts with prefix")]
    #[test_case(Op::StartsWith, "foo", "food", false ; "starts with is asymmetric")]
    #[test_case(Op::StartsWith, "Food", "foo", false ; "starts with is case sensitive")]
    #[test_case(Op::StartsWith, "a", "", true ; "starts with empty")]
    #[test_case(Op::EndsWith, "food", "ood", true ; "ends with suffix")]
    #[test_case(Op::EndsWith, "ood", "food", false ; "ends with is asymmetric")]
    #[test_case(Op::EndsWith, "FOOD", "ood", false ; "ends with is case sensitive")]
    #[test_case(Op::Contains, "food", "oo", true ; "contains substring")]
    #[test_case(Op::Contains, "oo", "food", false ; "contains is asymmetric")]
    #[test_case(Op::Contains, "", "", true ; "empty contains empty")]
    fn string_ops(op: Op, lhs: &str, rhs: &str, expected: bool) {
        assert_eq!(op.matches(&astring(lhs), &astring(rhs)), expected);
    }

    #[test]
    fn string_ops_require_strings() {
        assert!(!Op::StartsWith.matches(&anum(12.0), &astring("1")));
        assert!(!Op::Contains.matches(&astring("12"), &anum(1.0)));
        assert!(!Op::Matches.matches(&true.into(), &astring(".")));
    }

    #[test_case("", "" , true ; "empty pattern on empty text")]
    #[test_case("a", ".", true ; "dot")]
    #[test_case("hello world", "hello.*rld", true ; "wildcard")]
    #[test_case("hello world", "l+", true ; "unanchored")]
    #[test_case("hello world", "(world|planet)", true ; "alternation")]
    #[test_case("", ".", false ; "dot on empty text")]
    #[test_case("hello world", "aloha", false ; "no match")]
    #[test_case("hello world", "***bad regex", false ; "invalid regex")]
    #[test_case("", r"\", false ; "dangling escape")]
    fn regex_op(text: &str, pattern: &str, expected: bool) {
        assert_eq!(Op::Matches.matches(&astring(text), &astring(pattern)), expected);
    }

    #[test]
    fn test_ops_numeric() {
        assert!(Op::LessThan.matches(&anum(0.0), &anum(1.0)));
        assert!(!Op::LessThan.matches(&anum(0.0), &anum(0.0)));
        assert!(Op::LessThanOrEqual.matches(&anum(0.0), &anum(0.0)));
        assert!(!Op::LessThanOrEqual.matches(&anum(1.0), &anum(0.0)));
        assert!(Op::GreaterThan.matches(&anum(1.0), &anum(0.0)));
        assert!(!Op::GreaterThan.matches(&anum(0.0), &anum(0.0)));
        assert!(Op::GreaterThanOrEqual.matches(&anum(0.0), &anum(0.0)));
        assert!(!Op::GreaterThanOrEqual.matches(&anum(0.0), &anum(1.0)));

        assert!(
            Op::LessThan.matches(&astring("0"), &anum(1.0)),
            "should convert numeric string on LHS"
        );
        assert!(
            Op::LessThan.matches(&anum(0.0), &astring("1")),
            "should convert numeric string on RHS"
        );
        assert!(
            !Op::LessThan.matches(&astring("Tuesday"), &anum(7.0)),
            "non-numeric strings don't match"
        );
        assert!(!Op::GreaterThan.matches(&true.into(), &anum(0.0)));
    }

    #[test]
    fn test_ops_time() {
        let today_millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_millis() as f64;
        let yesterday_millis = today_millis - 86_400_000_f64;

        assert!(Op::Before.matches(&anum(yesterday_millis), &anum(today_millis)));
        assert!(!Op::Before.matches(&anum(today_millis), &anum(yesterday_millis)));
        assert!(!Op::Before.matches(&anum(today_millis), &anum(today_millis)));
        assert!(Op::After.matches(&anum(today_millis), &anum(yesterday_millis)));
        assert!(!Op::After.matches(&anum(yesterday_millis), &anum(today_millis)));

        assert!(Op::Before.matches(
            &astring("2019-11-19T17:29:00.000000-07:00"),
            &anum(today_millis)
        ));
        assert!(
            Op::Before.matches(&astring("2019-11-19T17:29:00-07:00"), &anum(today_millis)),
            "fractional seconds part is optional"
        );
        assert!(Op::After.matches(
            &anum(today_millis),
            &astring("2019-11-19T17:29:00.000000-07:00")
        ));

        assert!(!Op::Before.matches(&astring("fish"), &anum(today_millis)));
        assert!(!Op::After.matches(&anum(today_millis), &astring("fish")));
        assert!(!Op::After.matches(&true.into(), &anum(0.0)));
    }

    #[test]
    fn test_semver_ops() {
        assert!(Op::SemVerEqual.matches(&astring("2.0.0"), &astring("2.0.0")));
        assert!(
            Op::SemVerEqual.matches(&astring("2.0"), &astring("2.0.0")),
            "missing components are filled in with zeroes"
        );
        assert!(Op::SemVerEqual.matches(&astring("2"), &astring("2.0.0")));
        assert!(!Op::SemVerEqual.matches(&astring("2.0.0"), &astring("2.0.1")));

        assert!(Op::SemVerGreaterThan.matches(&astring("2.1.0"), &astring("2.0.0")));
        assert!(Op::SemVerGreaterThan
            .matches(&astring("2.0.0-rc.10.green"), &astring("2.0.0-rc.2.green")));
        assert!(
            Op::SemVerGreaterThan.matches(&astring("2.0.0-rc.2.red"), &astring("2.0.0-rc.2.green")),
            "red > green"
        );
        assert!(
            !Op::SemVerGreaterThan.matches(&astring("2.0.0-rc"), &astring("2.0.0")),
            "prerelease version < released version"
        );
        assert!(Op::SemVerLessThan.matches(&astring("2.0.0-rc"), &astring("2.0.0")));
        assert!(
            !Op::SemVerGreaterThan.matches(&astring("2.0.0+build"), &astring("2.0.0")),
            "build metadata is ignored"
        );
        assert!(Op::SemVerEqual.matches(&astring("2.0.0+build"), &astring("2.0.0")));

        assert!(!Op::SemVerEqual.matches(&astring("2.0.0"), &astring("200")));
        assert!(!Op::SemVerEqual.matches(&astring("2.0.0"), &anum(2.0)));
    }

    #[test]
    fn unknown_op_deserializes_and_never_matches() {
        let clause: Clause = serde_json::from_str(
            r#"{"attribute": "key", "op": "notARealOperator", "values": ["a"]}"#,
        )
        .unwrap();
        assert_eq!(clause.op, Op::Unknown);

        let context = ContextBuilder::new("a").build().unwrap();
        assert_eq!(clause.matches_non_segment(&context), Ok(false));
    }

    #[test]
    fn test_clause_matches() {
        let one_val_clause = Clause::new("a", Op::In, vec!["foo".into()]);
        let many_val_clause = Clause::new("a", Op::In, vec!["foo".into(), "bar".into()]);
        let negated_clause = Clause {
            negate: true,
            ..one_val_clause.clone()
        };
        let negated_many_val_clause = Clause {
            negate: true,
            ..many_val_clause.clone()
        };
        let key_clause = Clause::new("key", Op::In, vec!["mu".into()]);

        let matching = ContextBuilder::new("mu")
            .set_value("a", "foo".into())
            .build()
            .unwrap();
        let non_matching = ContextBuilder::new("nmu")
            .set_value("a", "lol".into())
            .build()
            .unwrap();
        let without_attr = ContextBuilder::new("uwa").build().unwrap();

        assert_eq!(one_val_clause.matches_non_segment(&matching), Ok(true));
        assert_eq!(one_val_clause.matches_non_segment(&non_matching), Ok(false));
        assert_eq!(one_val_clause.matches_non_segment(&without_attr), Ok(false));

        assert_eq!(negated_clause.matches_non_segment(&matching), Ok(false));
        assert_eq!(negated_clause.matches_non_segment(&non_matching), Ok(true));
        assert_eq!(
            negated_clause.matches_non_segment(&without_attr),
            Ok(false),
            "missing attribute does not match even when negated"
        );

        assert_eq!(many_val_clause.matches_non_segment(&matching), Ok(true));
        assert_eq!(
            negated_many_val_clause.matches_non_segment(&matching),
            Ok(false)
        );
        assert_eq!(
            negated_many_val_clause.matches_non_segment(&non_matching),
            Ok(true)
        );

        assert_eq!(key_clause.matches_non_segment(&matching), Ok(true));
        assert_eq!(key_clause.matches_non_segment(&non_matching), Ok(false));

        let with_many = ContextBuilder::new("uwm")
            .set_value("a", vec!["foo", "bar", "lol"].into())
            .build()
            .unwrap();
        assert_eq!(one_val_clause.matches_non_segment(&with_many), Ok(true));
        assert_eq!(negated_clause.matches_non_segment(&with_many), Ok(false));
    }

    #[test]
    fn clause_matches_nested_attribute() {
        let clause = Clause::new("/address/city", Op::In, vec!["Oakland".into()]);
        let context = ContextBuilder::new("k")
            .set_value(
                "address",
                hashmap! {"city" => "Oakland"}.into_iter().collect(),
            )
            .build()
            .unwrap();
        assert_eq!(clause.matches_non_segment(&context), Ok(true));
    }

    #[test]
    fn clause_with_invalid_reference_is_an_error() {
        let clause = Clause::new("/a//b", Op::In, vec!["x".into()]);
        let context = ContextBuilder::new("k").build().unwrap();
        assert!(clause.matches_non_segment(&context).is_err());
    }

    #[test]
    fn clause_selects_context_kind() {
        let clause = Clause {
            context_kind: Kind::from("org"),
            ..Clause::new("name", Op::In, vec!["Acme".into()])
        };

        let user = ContextBuilder::new("u").name("Acme").build().unwrap();
        let org = ContextBuilder::new("o")
            .kind("org")
            .name("Acme")
            .build()
            .unwrap();
        let multi = MultiContextBuilder::new()
            .add_context(user.clone())
            .add_context(org.clone())
            .build()
            .unwrap();

        assert_eq!(clause.matches_non_segment(&user), Ok(false));
        assert_eq!(clause.matches_non_segment(&org), Ok(true));
        assert_eq!(clause.matches_non_segment(&multi), Ok(true));
    }

    #[test]
    fn kind_attribute_matches_any_context_kind() {
        let clause = Clause::new("kind", Op::In, vec!["org".into()]);
        let multi = MultiContextBuilder::new()
            .add_context(ContextBuilder::new("u").build().unwrap())
            .add_context(ContextBuilder::new("o").kind("org").build().unwrap())
            .build()
            .unwrap();
        let user = ContextBuilder::new("u").build().unwrap();

        assert_eq!(clause.matches_non_segment(&multi), Ok(true));
        assert_eq!(clause.matches_non_segment(&user), Ok(false));
    }

    #[test]
    fn anonymous_attribute() {
        let clause = Clause::new("anonymous", Op::In, vec![true.into()]);
        let anon = ContextBuilder::new("anon").anonymous(true).build().unwrap();
        let implicit = ContextBuilder::new("implicit").build().unwrap();

        assert_eq!(clause.matches_non_segment(&anon), Ok(true));
        assert_eq!(clause.matches_non_segment(&implicit), Ok(false));
    }

    #[test]
    fn segment_match_is_not_evaluated_as_plain_clause() {
        let clause = Clause::new("key", Op::SegmentMatch, vec!["seg".into()]);
        assert!(clause.is_segment_match());
        let context = ContextBuilder::new("seg").build().unwrap();
        assert_eq!(clause.matches_non_segment(&context), Ok(false));
    }

    #[test]
    fn rule_parses_with_defaults() {
        let rule: FlagRule = serde_json::from_str(
            r#"{
                "clauses": [{"attribute": "email", "op": "endsWith", "values": ["@b.com"]}],
                "variation": 1
            }"#,
        )
        .unwrap();

        assert_eq!(rule.id, "");
        assert!(!rule.track_events);
        assert_eq!(
            rule.variation_or_rollout,
            VariationOrRollout::Variation { variation: 1 }
        );
        assert_eq!(
            rule.clauses,
            vec![Clause::new("email", Op::EndsWith, vec!["@b.com".into()])]
        );
    }
}
