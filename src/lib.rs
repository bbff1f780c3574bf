//! Feature flag evaluation: targeting rules, percentage rollouts, segments and prerequisites,
//! plus a caching, health-tracking front end for external big segment stores.
mod attribute_value;
mod availability;
mod big_segments;
mod broadcast;
mod bucketing;
mod cache;
mod contexts;
mod error;
mod eval;
mod flag;
mod flag_value;
mod poller;
mod rule;
mod segment;
mod store;
mod test_common;
mod util;
mod variation;

pub use attribute_value::AttributeValue;
pub use availability::{AvailabilityConfig, AvailabilityStatus, AvailabilityTracker};
pub use big_segments::{
    BigSegmentProvider, BigSegmentStore, BigSegmentStoreManager, BigSegmentStoreStatus,
    BigSegmentsConfig, BigSegmentsStatus, Membership, StoreMetadata,
};
pub use broadcast::Broadcaster;
pub use bucketing::{bucket_value, select_weighted_variation, BucketPrefix};
pub use cache::{LoadingCache, LoadingCacheConfig, LruKeySet};
pub use contexts::{Context, ContextBuilder, Kind, MultiContextBuilder, Reference};
pub use error::StoreError;
pub use eval::*;
pub use flag::*;
pub use flag_value::*;
pub use poller::RepeatingTask;
pub use rule::*;
pub use segment::*;
pub use store::*;
pub use variation::*;
