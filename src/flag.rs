use std::collections::HashSet;

use log::warn;
use serde::Deserialize;

use crate::contexts::context::{Context, Kind};
use crate::eval::{self, Detail, Reason};
use crate::flag_value::FlagValue;
use crate::rule::FlagRule;
use crate::variation::{BucketResult, VariationIndex, VariationOrRollout};

/// A feature flag definition.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    pub key: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub deleted: bool,

    pub(crate) on: bool,

    #[serde(default)]
    pub(crate) targets: Vec<Target>,
    #[serde(default)]
    pub(crate) context_targets: Vec<Target>,
    #[serde(default)]
    pub(crate) rules: Vec<FlagRule>,
    #[serde(default)]
    pub(crate) prerequisites: Vec<Prereq>,

    pub(crate) fallthrough: VariationOrRollout,
    #[serde(default)]
    pub(crate) off_variation: Option<VariationIndex>,
    variations: Vec<FlagValue>,

    #[serde(default)]
    salt: String,

    #[serde(default)]
    pub track_events: bool,
    #[serde(default)]
    pub track_events_fallthrough: bool,
    #[serde(default)]
    pub debug_events_until_date: Option<u64>,
}

/// Another flag that must return `variation` before this flag's own targeting is evaluated.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Prereq {
    pub key: String,
    pub variation: VariationIndex,
}

/// Context keys of one kind that receive `variation` directly.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(default)]
    pub context_kind: Kind,
    pub values: HashSet<String>,
    pub variation: VariationIndex,
}

impl Flag {
    /// The detail for variation `index`. An index outside the variations list, including a
    /// negative one, makes the flag malformed.
    pub fn variation(&self, index: VariationIndex, reason: Reason) -> Detail<&FlagValue> {
        match usize::try_from(index)
            .ok()
            .and_then(|i| self.variations.get(i))
        {
            Some(value) => Detail {
                value: Some(value),
                variation_index: Some(index),
                reason,
                big_segments_status: None,
            },
            None => {
                warn!("flag {} refers to nonexistent variation {}", self.key, index);
                Detail::err(eval::Error::MalformedFlag)
            }
        }
    }

    /// The off variation, or an empty detail if the flag has none.
    pub fn off_value(&self, reason: Reason) -> Detail<&FlagValue> {
        match self.off_variation {
            Some(index) => self.variation(index, reason),
            None => Detail::empty(reason),
        }
    }

    pub fn variations(&self) -> &[FlagValue] {
        &self.variations
    }

    pub(crate) fn resolve_variation_or_rollout(
        &self,
        vr: &VariationOrRollout,
        context: &Context,
    ) -> Result<BucketResult, eval::Error> {
        vr.variation(&self.key, context, &self.salt)
            .ok_or(eval::Error::MalformedFlag)
    }

    /// The variation a target list assigns to `context`, if any.
    ///
    /// With no `contextTargets` only the legacy user `targets` apply. Otherwise `contextTargets`
    /// decide the order, and a user entry without values stands in for the legacy user target of
    /// the same variation.
    pub(crate) fn target_match(&self, context: &Context) -> Option<VariationIndex> {
        if self.context_targets.is_empty() {
            return self.targets.iter().find_map(|target| target.matches(context));
        }

        self.context_targets.iter().find_map(|context_target| {
            if context_target.context_kind.is_user() && context_target.values.is_empty() {
                self.targets
                    .iter()
                    .filter(|target| target.variation == context_target.variation)
                    .find_map(|target| target.matches(context))
            } else {
                context_target.matches(context)
            }
        })
    }

    /// Whether an evaluation with `reason` should be reported as part of an experiment.
    pub fn is_experimentation_enabled(&self, reason: &Reason) -> bool {
        match reason {
            _ if reason.is_in_experiment() => true,
            Reason::Fallthrough { .. } => self.track_events_fallthrough,
            Reason::RuleMatch { rule_index, .. } => self
                .rules
                .get(*rule_index)
                .map(|rule| rule.track_events)
                .unwrap_or(false),
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn new_boolean_flag_with_segment_match(segment_keys: Vec<&str>) -> Self {
        Self {
            key: "feature".to_string(),
            version: 1,
            deleted: false,
            on: true,
            targets: vec![],
            context_targets: vec![],
            rules: vec![FlagRule::new(
                "segment-rule",
                vec![crate::rule::Clause::new_segment_match(segment_keys)],
                VariationOrRollout::Variation { variation: 1 },
            )],
            prerequisites: vec![],
            fallthrough: VariationOrRollout::Variation { variation: 0 },
            off_variation: Some(0),
            variations: vec![FlagValue::Bool(false), FlagValue::Bool(true)],
            salt: "xyz".to_string(),
            track_events: false,
            track_events_fallthrough: false,
            debug_events_until_date: None,
        }
    }
}

impl Target {
    fn matches(&self, context: &Context) -> Option<VariationIndex> {
        context
            .as_kind(&self.context_kind)
            .filter(|member| self.values.contains(member.key()))
            .map(|_| self.variation)
    }
}
