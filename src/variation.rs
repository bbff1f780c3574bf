use log::warn;
use serde::Deserialize;

use crate::bucketing::{bucket_context, BucketPrefix, ContextBucket};
use crate::contexts::attribute_reference::Reference;
use crate::contexts::context::{Context, Kind};
use crate::select_weighted_variation;

/// Index into a flag's variations. Signed because flag data may carry negative indices, which
/// evaluate as malformed rather than failing to deserialize.
pub type VariationIndex = isize;

#[derive(Debug, PartialEq)]
pub(crate) struct BucketResult {
    pub variation_index: VariationIndex,
    pub in_experiment: bool,
}

impl From<VariationIndex> for BucketResult {
    fn from(variation_index: VariationIndex) -> Self {
        BucketResult {
            variation_index,
            in_experiment: false,
        }
    }
}

/// Whether a rollout is a plain percentage rollout or an experiment.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum RolloutKind {
    #[default]
    Rollout,
    Experiment,
}

/// Weighted assignment of contexts to variations.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    #[serde(default)]
    kind: RolloutKind,
    context_kind: Option<Kind>,
    bucket_by: Option<Reference>,
    variations: Vec<WeightedVariation>,
    seed: Option<i64>,
}

impl Rollout {
    #[cfg(test)]
    pub(crate) fn with_variations<V: Into<Vec<WeightedVariation>>>(variations: V) -> Self {
        Rollout {
            kind: RolloutKind::Rollout,
            context_kind: None,
            bucket_by: None,
            seed: None,
            variations: variations.into(),
        }
    }
}

// Bad data can produce an entry with neither a variation nor a rollout, or with both. Neither
// deserializes as Malformed; both prefers the fixed variation.
/// Either a fixed variation or a rollout, as used by rules and the fallthrough.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum VariationOrRollout {
    Variation { variation: VariationIndex },
    Rollout { rollout: Rollout },
    Malformed(serde_json::Value),
}

pub type VariationWeight = f32;

/// One bucket of a rollout. Weights are in thousandths of a percent (100000 is the full range).
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct WeightedVariation {
    pub variation: VariationIndex,
    pub weight: VariationWeight,
    /// Untracked buckets are excluded from an experiment.
    #[serde(default)]
    pub untracked: bool,
}

impl WeightedVariation {
    #[cfg(test)]
    pub(crate) fn new(variation: VariationIndex, weight: VariationWeight) -> Self {
        WeightedVariation {
            variation,
            weight,
            untracked: false,
        }
    }

    fn as_bucket_result(&self, in_experiment: bool) -> BucketResult {
        BucketResult {
            variation_index: self.variation,
            in_experiment: in_experiment && !self.untracked,
        }
    }
}

impl VariationOrRollout {
    /// Resolve to a variation index for `context`. None means the data is malformed: no
    /// variation, an empty rollout, or an invalid bucketing attribute.
    pub(crate) fn variation(
        &self,
        flag_key: &str,
        context: &Context,
        salt: &str,
    ) -> Option<BucketResult> {
        let rollout = match self {
            VariationOrRollout::Variation { variation } => return Some((*variation).into()),
            VariationOrRollout::Rollout { rollout } => rollout,
            VariationOrRollout::Malformed(_) => return None,
        };

        let is_experiment = rollout.kind == RolloutKind::Experiment;
        let prefix = match rollout.seed {
            Some(seed) => BucketPrefix::Seed(seed),
            None => BucketPrefix::KeyAndSalt(flag_key, salt),
        };
        let kind = rollout.context_kind.clone().unwrap_or_default();

        let bucket = match bucket_context(
            context,
            rollout.bucket_by.as_ref(),
            prefix,
            is_experiment,
            &kind,
        ) {
            Ok(bucket) => bucket,
            Err(e) => {
                warn!("rollout in flag {} cannot bucket: {}", flag_key, e);
                return None;
            }
        };

        let in_experiment = is_experiment && bucket != ContextBucket::MissingContext;
        select_weighted_variation(&rollout.variations, bucket.value_or_zero())
            .map(|variation| variation.as_bucket_result(in_experiment))
    }
}
