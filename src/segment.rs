use std::collections::{HashMap, HashSet};

use log::warn;
use serde::Deserialize;

use crate::big_segments::{BigSegmentProvider, BigSegmentsStatus};
use crate::bucketing::{bucket_context, BucketPrefix, WEIGHT_SCALE};
use crate::contexts::attribute_reference::Reference;
use crate::contexts::context::{Context, Kind};
use crate::eval::EvaluationStack;
use crate::rule::Clause;
use crate::variation::VariationWeight;

/// A named set of contexts, defined by explicit key lists, rules, or (for unbounded segments)
/// an external big segment store.
///
/// Key lists are indexed by context kind when the segment is deserialized and never change
/// afterwards; an updated segment is a new value.
#[derive(Clone, Debug, Deserialize)]
#[serde(from = "SegmentRep")]
pub struct Segment {
    pub key: String,
    pub version: i64,
    pub deleted: bool,

    included: HashMap<Kind, HashSet<String>>,
    excluded: HashMap<Kind, HashSet<String>>,
    rules: Vec<SegmentRule>,
    salt: String,

    pub unbounded: bool,
    unbounded_context_kind: Kind,
    generation: Option<i64>,
}

/// Explicit segment targets for one context kind.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SegmentTarget {
    #[serde(default)]
    pub context_kind: Kind,
    pub values: Vec<String>,
}

// Wire shape of a segment. `included`/`excluded` are user keys; the `*Contexts` lists carry
// their own kind.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SegmentRep {
    key: String,
    #[serde(default)]
    version: i64,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    included: Vec<String>,
    #[serde(default)]
    excluded: Vec<String>,
    #[serde(default)]
    included_contexts: Vec<SegmentTarget>,
    #[serde(default)]
    excluded_contexts: Vec<SegmentTarget>,
    #[serde(default)]
    rules: Vec<SegmentRule>,
    #[serde(default)]
    salt: String,
    #[serde(default)]
    unbounded: bool,
    #[serde(default)]
    unbounded_context_kind: Option<Kind>,
    #[serde(default)]
    generation: Option<i64>,
}

fn index_targets(
    user_keys: Vec<String>,
    targets: Vec<SegmentTarget>,
) -> HashMap<Kind, HashSet<String>> {
    let mut index: HashMap<Kind, HashSet<String>> = HashMap::new();
    if !user_keys.is_empty() {
        index.entry(Kind::user()).or_default().extend(user_keys);
    }
    for target in targets {
        index
            .entry(target.context_kind)
            .or_default()
            .extend(target.values);
    }
    index
}

impl From<SegmentRep> for Segment {
    fn from(rep: SegmentRep) -> Self {
        Segment {
            key: rep.key,
            version: rep.version,
            deleted: rep.deleted,
            included: index_targets(rep.included, rep.included_contexts),
            excluded: index_targets(rep.excluded, rep.excluded_contexts),
            rules: rep.rules,
            salt: rep.salt,
            unbounded: rep.unbounded,
            unbounded_context_kind: rep.unbounded_context_kind.unwrap_or_default(),
            generation: rep.generation,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SegmentRule {
    #[serde(default)]
    id: Option<String>,
    clauses: Vec<Clause>,
    #[serde(default)]
    weight: Option<VariationWeight>,
    #[serde(default)]
    bucket_by: Option<Reference>,
    #[serde(default)]
    rollout_context_kind: Option<Kind>,
}

/// Outcome of [Segment::contains].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SegmentMatch {
    pub(crate) is_match: bool,
    /// Set whenever big segment data was needed to decide.
    pub(crate) big_segments_status: Option<BigSegmentsStatus>,
}

impl SegmentMatch {
    fn new(is_match: bool, big_segments_status: Option<BigSegmentsStatus>) -> Self {
        SegmentMatch {
            is_match,
            big_segments_status,
        }
    }
}

impl Segment {
    pub fn is_newer_than(&self, segment: &Segment) -> bool {
        self.version > segment.version
    }

    /// The reference under which big segment stores record membership in this segment, or
    /// None if the segment has no generation.
    pub fn unbounded_segment_ref(&self) -> Option<String> {
        self.generation
            .map(|generation| format!("{}.g{}", self.key, generation))
    }

    /// Decide whether `context` belongs to this segment.
    ///
    /// Explicit inclusion wins over explicit exclusion. Unbounded segments then consult
    /// `big_segments`; a definite answer from it is final, otherwise the segment's rules decide.
    /// Rules that cannot be evaluated are treated as not matching.
    pub(crate) fn contains(
        &self,
        context: &Context,
        big_segments: Option<&dyn BigSegmentProvider>,
        stack: &mut EvaluationStack,
    ) -> SegmentMatch {
        if Self::is_targeted(&self.included, context) {
            return SegmentMatch::new(true, None);
        }
        if Self::is_targeted(&self.excluded, context) {
            return SegmentMatch::new(false, None);
        }

        let mut big_segments_status = None;
        if self.unbounded {
            let Some(segment_ref) = self.unbounded_segment_ref() else {
                return SegmentMatch::new(false, Some(BigSegmentsStatus::NotConfigured));
            };
            let Some(member) = context.as_kind(&self.unbounded_context_kind) else {
                return SegmentMatch::new(false, None);
            };

            match big_segments {
                None => big_segments_status = Some(BigSegmentsStatus::NotConfigured),
                Some(provider) => {
                    let (membership, status) =
                        stack.big_segment_membership(provider, member.key());
                    big_segments_status = Some(status);
                    if let Some(included) = membership.and_then(|m| m.check(&segment_ref)) {
                        return SegmentMatch::new(included, big_segments_status);
                    }
                }
            }
        }

        let matched = self.rules.iter().any(|rule| {
            rule.matches(context, &self.key, &self.salt)
                .unwrap_or_else(|e| {
                    warn!("segment {} has an invalid rule: {}", self.key, e);
                    false
                })
        });
        SegmentMatch::new(matched, big_segments_status)
    }

    fn is_targeted(targets: &HashMap<Kind, HashSet<String>>, context: &Context) -> bool {
        targets.iter().any(|(kind, keys)| {
            context
                .as_kind(kind)
                .is_some_and(|member| keys.contains(member.key()))
        })
    }
}

impl SegmentRule {
    /// A rule matches if all of its clauses do and, when weighted, the context buckets under the
    /// weight. Segment rules cannot reference other segments.
    fn matches(&self, context: &Context, key: &str, salt: &str) -> Result<bool, String> {
        for clause in &self.clauses {
            if clause.is_segment_match() || !clause.matches_non_segment(context)? {
                return Ok(false);
            }
        }

        match self.weight {
            Some(weight) if weight >= 0.0 => {
                let kind = self.rollout_context_kind.clone().unwrap_or_default();
                let bucket = bucket_context(
                    context,
                    self.bucket_by.as_ref(),
                    BucketPrefix::KeyAndSalt(key, salt),
                    false,
                    &kind,
                )?;
                Ok(bucket.value_or_zero() < weight / WEIGHT_SCALE)
            }
            _ => Ok(true),
        }
    }
}
