//! Deterministic assignment of contexts to percentage buckets.
//!
//! The hash input is `<flag or segment key>.<salt>.<attribute value>` (or `<seed>.<attribute
//! value>` when a rollout carries a seed). The first 15 hex digits of its SHA-1 digest, divided by
//! the largest 15-digit hex number, give a value in `[0, 1)`. Every client reading the same flag
//! computes the same value, so rollouts are consistent across implementations.

use sha1::{Digest, Sha1};

use crate::contexts::context::{Context, Kind};
use crate::contexts::attribute_reference::Reference;
use crate::variation::WeightedVariation;
use crate::AttributeValue;

const BUCKET_SCALE_INT: i64 = 0x0FFF_FFFF_FFFF_FFFF;
const BUCKET_SCALE: f32 = BUCKET_SCALE_INT as f32;
const HASH_PREFIX_LEN: usize = 15;

/// Weights in rollouts and segment rules are expressed in thousandths of a percent.
pub(crate) const WEIGHT_SCALE: f32 = 100_000.0;

/// The part of the hash input that is independent of the context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BucketPrefix<'a> {
    /// A flag or segment key and its salt.
    KeyAndSalt(&'a str, &'a str),
    /// A rollout-specific seed, which replaces key and salt.
    Seed(i64),
}

impl<'a> BucketPrefix<'a> {
    fn write_hash(&self, hash: &mut Sha1) {
        match self {
            BucketPrefix::KeyAndSalt(key, salt) => {
                hash.update(key.as_bytes());
                hash.update(b".");
                hash.update(salt.as_bytes());
            }
            BucketPrefix::Seed(seed) => hash.update(seed.to_string().as_bytes()),
        }
    }
}

/// Hash `value` under `prefix` into `[0, 1)`.
///
/// Returns None if the value cannot be bucketed: only strings and integral numbers can.
pub fn bucket_value(value: &AttributeValue, prefix: BucketPrefix) -> Option<f32> {
    let id = value.as_bucketable()?;

    let mut hash = Sha1::new();
    prefix.write_hash(&mut hash);
    hash.update(b".");
    hash.update(id.as_bytes());

    let hex = base16ct::lower::encode_string(&hash.finalize());
    let numeric = i64::from_str_radix(&hex[..HASH_PREFIX_LEN], 16).ok()?;
    Some(numeric as f32 / BUCKET_SCALE)
}

/// Outcome of bucketing a context for a rollout or weighted segment rule.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum ContextBucket {
    /// The bucketing attribute hashed to this value.
    Value(f32),
    /// The attribute is absent or of a type that cannot be bucketed.
    Unbucketable,
    /// The context has no member of the rollout's context kind.
    MissingContext,
}

impl ContextBucket {
    /// Contexts that cannot be bucketed all land at the bottom of the range.
    pub(crate) fn value_or_zero(self) -> f32 {
        match self {
            ContextBucket::Value(v) => v,
            ContextBucket::Unbucketable | ContextBucket::MissingContext => 0.0,
        }
    }
}

/// Bucket `context` by the attribute `by_attr` (default "key") of its `kind` member.
///
/// Experiments always bucket by key. Returns an error only for an invalid attribute reference,
/// which indicates malformed flag data.
pub(crate) fn bucket_context(
    context: &Context,
    by_attr: Option<&Reference>,
    prefix: BucketPrefix,
    is_experiment: bool,
    kind: &Kind,
) -> Result<ContextBucket, String> {
    let key_reference;
    let reference = match by_attr {
        Some(reference) if !is_experiment => reference,
        _ => {
            key_reference = Reference::new("key");
            &key_reference
        }
    };

    if !reference.is_valid() {
        return Err(reference.error());
    }

    let Some(member) = context.as_kind(kind) else {
        return Ok(ContextBucket::MissingContext);
    };

    Ok(member
        .get_value(reference)
        .and_then(|value| bucket_value(&value, prefix))
        .map_or(ContextBucket::Unbucketable, ContextBucket::Value))
}

/// Walk the cumulative weights in order and pick the first variation whose cumulative weight
/// exceeds `bucket`. If rounding leaves the weights short of the full range, the last variation
/// is used. Returns None only for an empty list.
pub fn select_weighted_variation(
    variations: &[WeightedVariation],
    bucket: f32,
) -> Option<&WeightedVariation> {
    let mut cumulative = 0.0;
    variations
        .iter()
        .find(|variation| {
            cumulative += variation.weight / WEIGHT_SCALE;
            bucket < cumulative
        })
        .or_else(|| variations.last())
}
