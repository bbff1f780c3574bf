use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::warn;
use serde::Serialize;

use crate::big_segments::{BigSegmentProvider, BigSegmentsStatus, Membership};
use crate::contexts::context::Context;
use crate::flag::Flag;
use crate::flag_value::FlagValue;
use crate::store::Store;
use crate::variation::{BucketResult, VariationIndex, VariationOrRollout};

/// The result of evaluating one prerequisite flag on behalf of another flag.
pub struct PrerequisiteEvent {
    /// Key of the flag whose prerequisite this was.
    pub target_flag_key: String,
    /// The [Context] the evaluation was for.
    pub context: Context,
    /// The prerequisite flag that was evaluated.
    pub prerequisite_flag: Flag,
    /// The prerequisite's own evaluation result.
    pub prerequisite_result: Detail<FlagValue>,
}

/// Receives a [PrerequisiteEvent] for every prerequisite evaluated during [evaluate], whether
/// or not the prerequisite was satisfied.
pub trait PrerequisiteEventRecorder {
    fn record(&self, event: PrerequisiteEvent);
}

const PREALLOCATED_PREREQUISITE_CHAIN_SIZE: usize = 20;

/// State carried through one top-level evaluation.
pub(crate) struct EvaluationStack {
    // Flags whose prerequisites are currently being evaluated. Meeting one again is a cycle.
    pub(crate) prerequisite_flag_chain: HashSet<String>,
    big_segment_memberships: HashMap<String, (Option<Arc<Membership>>, BigSegmentsStatus)>,
    big_segments_status: Option<BigSegmentsStatus>,
}

impl EvaluationStack {
    fn new() -> Self {
        Self {
            prerequisite_flag_chain: HashSet::with_capacity(PREALLOCATED_PREREQUISITE_CHAIN_SIZE),
            big_segment_memberships: HashMap::new(),
            big_segments_status: None,
        }
    }

    /// Membership for `context_key`, asking `provider` at most once per evaluation.
    pub(crate) fn big_segment_membership(
        &mut self,
        provider: &dyn BigSegmentProvider,
        context_key: &str,
    ) -> (Option<Arc<Membership>>, BigSegmentsStatus) {
        if let Some(found) = self.big_segment_memberships.get(context_key) {
            return found.clone();
        }
        let result = provider.membership(context_key);
        self.big_segment_memberships
            .insert(context_key.to_owned(), result.clone());
        result
    }

    /// Keep the worst big segment status seen so far.
    pub(crate) fn record_big_segments_status(&mut self, status: BigSegmentsStatus) {
        self.big_segments_status = Some(match self.big_segments_status {
            Some(previous) => previous.worst(status),
            None => status,
        });
    }
}

impl Default for EvaluationStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluates flags against the flags and segments of a [Store], optionally consulting a
/// [BigSegmentProvider] for unbounded segments.
///
/// ```
/// # use flag_evaluation_engine::{ContextBuilder, Evaluator, Flag, FlagValue, Segment, Store};
/// struct NoData;
/// impl Store for NoData {
///     fn flag(&self, _: &str) -> Option<Flag> { None }
///     fn segment(&self, _: &str) -> Option<Segment> { None }
/// }
///
/// let flag: Flag = serde_json::from_str(r#"{
///     "key": "f", "on": true, "salt": "s",
///     "fallthrough": {"variation": 1}, "variations": ["a", "b"]
/// }"#).unwrap();
/// let context = ContextBuilder::new("someone").build().unwrap();
///
/// let detail = Evaluator::new(&NoData).evaluate(&flag, &context, None);
/// assert_eq!(detail.value, Some(&FlagValue::Str("b".into())));
/// ```
pub struct Evaluator<'a> {
    pub(crate) store: &'a dyn Store,
    pub(crate) big_segments: Option<&'a dyn BigSegmentProvider>,
}

impl<'a> Evaluator<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Evaluator {
            store,
            big_segments: None,
        }
    }

    /// Use `provider` for unbounded segments. Without one they are reported as
    /// [BigSegmentsStatus::NotConfigured].
    pub fn with_big_segments(mut self, provider: &'a dyn BigSegmentProvider) -> Self {
        self.big_segments = Some(provider);
        self
    }

    /// Evaluate `flag` for `context`.
    ///
    /// Never fails: problems with the flag data become a [Reason::Error] on the returned detail,
    /// and big segment store problems are reported in [Detail::big_segments_status].
    pub fn evaluate<'f>(
        &self,
        flag: &'f Flag,
        context: &Context,
        prerequisite_event_recorder: Option<&dyn PrerequisiteEventRecorder>,
    ) -> Detail<&'f FlagValue> {
        let mut stack = EvaluationStack::default();
        let mut detail = self
            .evaluate_internal(flag, context, prerequisite_event_recorder, &mut stack)
            .unwrap_or_else(Detail::err);
        detail.big_segments_status = stack.big_segments_status;
        detail
    }

    // Err is reserved for prerequisite cycles, which make every flag along the cycle malformed.
    fn evaluate_internal<'f>(
        &self,
        flag: &'f Flag,
        context: &Context,
        prerequisite_event_recorder: Option<&dyn PrerequisiteEventRecorder>,
        stack: &mut EvaluationStack,
    ) -> Result<Detail<&'f FlagValue>, Error> {
        if !flag.on {
            return Ok(flag.off_value(Reason::Off));
        }

        if stack.prerequisite_flag_chain.contains(&flag.key) {
            warn!("prerequisite relationship to {} caused a circular reference; this is probably a temporary condition due to an incomplete update", flag.key);
            return Err(Error::MalformedFlag);
        }

        stack.prerequisite_flag_chain.insert(flag.key.clone());
        let failed_prerequisite =
            self.failed_prerequisite(flag, context, prerequisite_event_recorder, stack);
        stack.prerequisite_flag_chain.remove(&flag.key);

        if let Some(prerequisite_key) = failed_prerequisite? {
            return Ok(flag.off_value(Reason::PrerequisiteFailed { prerequisite_key }));
        }

        if let Some(variation_index) = flag.target_match(context) {
            return Ok(flag.variation(variation_index, Reason::TargetMatch));
        }

        for (rule_index, rule) in flag.rules.iter().enumerate() {
            match rule.matches(context, self, stack) {
                Err(e) => {
                    warn!("flag {} rule {} is malformed: {}", flag.key, rule_index, e);
                    return Ok(Detail::err(Error::MalformedFlag));
                }
                Ok(true) => {
                    return Ok(resolve(flag, &rule.variation_or_rollout, context, |in_experiment| {
                        Reason::RuleMatch {
                            rule_index,
                            rule_id: rule.id.clone(),
                            in_experiment,
                        }
                    }));
                }
                Ok(false) => (),
            }
        }

        Ok(resolve(flag, &flag.fallthrough, context, |in_experiment| {
            Reason::Fallthrough { in_experiment }
        }))
    }

    /// Evaluate prerequisites in order, returning the key of the first one not satisfied.
    fn failed_prerequisite(
        &self,
        flag: &Flag,
        context: &Context,
        prerequisite_event_recorder: Option<&dyn PrerequisiteEventRecorder>,
        stack: &mut EvaluationStack,
    ) -> Result<Option<String>, Error> {
        for prereq in &flag.prerequisites {
            let Some(prereq_flag) = self.store.flag(&prereq.key) else {
                warn!("flag {} has missing prerequisite {}", flag.key, prereq.key);
                return Ok(Some(prereq.key.clone()));
            };

            let result =
                self.evaluate_internal(&prereq_flag, context, prerequisite_event_recorder, stack)?;
            let satisfied = prereq_flag.on
                && !matches!(result.reason, Reason::Error { .. })
                && result.variation_index == Some(prereq.variation);
            let prerequisite_result = result.map(FlagValue::clone);

            if let Some(recorder) = prerequisite_event_recorder {
                recorder.record(PrerequisiteEvent {
                    target_flag_key: flag.key.clone(),
                    context: context.clone(),
                    prerequisite_flag: prereq_flag,
                    prerequisite_result,
                });
            }

            if !satisfied {
                return Ok(Some(prereq.key.clone()));
            }
        }
        Ok(None)
    }
}

fn resolve<'f, R>(
    flag: &'f Flag,
    variation_or_rollout: &VariationOrRollout,
    context: &Context,
    reason: R,
) -> Detail<&'f FlagValue>
where
    R: FnOnce(bool) -> Reason,
{
    match flag.resolve_variation_or_rollout(variation_or_rollout, context) {
        Ok(BucketResult {
            variation_index,
            in_experiment,
        }) => flag.variation(variation_index, reason(in_experiment)),
        Err(e) => {
            warn!("flag {} has a rule or fallthrough with no usable variation", flag.key);
            Detail::err(e)
        }
    }
}

/// Evaluate a feature flag for the specified [Context] without big segment support.
///
/// The caller can provide a [PrerequisiteEventRecorder] to be told about every prerequisite
/// evaluation this causes. See [Evaluator] to evaluate with big segments.
pub fn evaluate<'a>(
    store: &'a dyn Store,
    flag: &'a Flag,
    context: &Context,
    prerequisite_event_recorder: Option<&dyn PrerequisiteEventRecorder>,
) -> Detail<&'a FlagValue> {
    Evaluator::new(store).evaluate(flag, context, prerequisite_event_recorder)
}

/// The result of an evaluation together with an explanation of how it was reached.
#[derive(Clone, Debug, PartialEq)]
pub struct Detail<T> {
    /// One of the flag's variations, or None if no appropriate fallback value was configured.
    pub value: Option<T>,

    /// The index of the returned value within the flag's list of variations. None when the value
    /// did not come from the variations list, which is different from an index of 0.
    pub variation_index: Option<VariationIndex>,

    /// The main factor that influenced the result.
    pub reason: Reason,

    /// Set if any big segment was consulted: the worst status among them.
    pub big_segments_status: Option<BigSegmentsStatus>,
}

impl<T> Detail<T> {
    /// Returns a detail with value and variation_index of None.
    pub fn empty(reason: Reason) -> Detail<T> {
        Detail {
            value: None,
            variation_index: None,
            reason,
            big_segments_status: None,
        }
    }

    /// Returns a detail response using the provided default as the value and a variation_index
    /// of None.
    pub fn err_default(error: Error, default: T) -> Detail<T> {
        Detail {
            value: Some(default),
            ..Detail::err(error)
        }
    }

    /// Returns a detail response using the provided error as the [Detail::reason].
    pub fn err(error: Error) -> Detail<T> {
        Detail::empty(Reason::Error { error })
    }

    /// Apply `f` to [Detail::value], keeping everything else.
    pub fn map<U, F>(self, f: F) -> Detail<U>
    where
        F: FnOnce(T) -> U,
    {
        Detail {
            value: self.value.map(f),
            variation_index: self.variation_index,
            reason: self.reason,
            big_segments_status: self.big_segments_status,
        }
    }

    /// Sets the [Detail::reason] to the provided error if the current detail instance does not
    /// have a value set.
    pub fn should_have_value(mut self, e: Error) -> Detail<T> {
        if self.value.is_none() {
            self.reason = Reason::Error { error: e };
        }
        self
    }

    /// Convert [Detail::value] with `f`, which may fail.
    ///
    /// A missing value becomes `default` with the reason unchanged. If `f` returns None the
    /// result is `default` with the error `e`.
    pub fn try_map<U, F>(self, f: F, default: U, e: Error) -> Detail<U>
    where
        F: FnOnce(T) -> Option<U>,
    {
        let Some(value) = self.value else {
            return Detail {
                value: Some(default),
                variation_index: self.variation_index,
                reason: self.reason,
                big_segments_status: self.big_segments_status,
            };
        };
        match f(value) {
            Some(v) => Detail {
                value: Some(v),
                variation_index: self.variation_index,
                reason: self.reason,
                big_segments_status: self.big_segments_status,
            },
            None => Detail::err_default(e, default),
        }
    }

    /// Set the [Detail::value] to `default` if it does not exist.
    pub fn or(mut self, default: T) -> Detail<T> {
        if self.value.is_none() {
            self.value = Some(default);
            self.variation_index = None;
            // N.B. reason remains untouched
        }
        self
    }

    /// Like [Detail::or], computing the default only when it is needed.
    pub fn or_else<F>(mut self, default: F) -> Detail<T>
    where
        F: Fn() -> T,
    {
        if self.value.is_none() {
            self.value = Some(default());
            self.variation_index = None;
        }
        self
    }
}

/// Reason describes the reason that a flag evaluation produced a particular value.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "kind")]
pub enum Reason {
    /// The flag was off and therefore returned its configured off value.
    Off,
    /// The context key was specifically targeted for this flag.
    TargetMatch,
    /// The context matched one of the flag's rules.
    #[serde(rename_all = "camelCase")]
    RuleMatch {
        /// Zero-based index of the [crate::FlagRule] that was matched.
        rule_index: usize,
        #[serde(skip_serializing_if = "String::is_empty")]
        /// The [crate::FlagRule::id] of the rule that was matched.
        rule_id: String,
        /// True if the variation came from an experiment rollout and the selected bucket is
        /// tracked.
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        in_experiment: bool,
    },
    /// The flag was considered off because a prerequisite flag was off, missing, or did not
    /// return the required variation.
    #[serde(rename_all = "camelCase")]
    PrerequisiteFailed {
        /// The key of the prerequisite flag that failed.
        prerequisite_key: String,
    },
    /// The flag was on but the context did not match any targets or rules.
    #[serde(rename_all = "camelCase")]
    Fallthrough {
        /// As for [Reason::RuleMatch].
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        in_experiment: bool,
    },
    /// The flag could not be evaluated.
    Error {
        #[serde(rename = "errorKind")]
        error: Error,
    },
}

impl Reason {
    /// True if this evaluation is part of an experiment.
    pub fn is_in_experiment(&self) -> bool {
        match self {
            Reason::RuleMatch { in_experiment, .. } => *in_experiment,
            Reason::Fallthrough { in_experiment } => *in_experiment,
            _ => false,
        }
    }
}

/// Error is returned via a [Reason::Error] when a flag could not be evaluated.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Error {
    /// The flag data is inconsistent, e.g. a rule specified a nonexistent variation or
    /// prerequisites form a cycle.
    MalformedFlag,
    /// The result value was not of the requested type.
    WrongType,
}
