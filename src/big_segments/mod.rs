//! Membership data for big segments: segments whose included and excluded contexts live in an
//! external store instead of in the segment itself.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::error::StoreError;

mod manager;

pub use manager::BigSegmentStoreManager;

/// Freshness information reported by a [BigSegmentStore].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreMetadata {
    /// Unix epoch milliseconds of the last time the store's data was brought up to date, if it
    /// ever was.
    pub last_up_to_date: Option<i64>,
}

/// Read access to an external big segment store.
///
/// Implementations own their timeout and retry policy. Every error is treated as the store being
/// unavailable.
pub trait BigSegmentStore: Send + Sync {
    fn get_metadata(&self) -> Result<StoreMetadata, StoreError>;

    /// Query membership for one context. `context_hash` is the base64-encoded SHA-256 of the
    /// context key, never the key itself.
    fn get_membership(&self, context_hash: &str) -> Result<Membership, StoreError>;
}

/// The big segments one context is explicitly included in or excluded from.
///
/// Keys are segment references of the form `<segment key>.g<generation>`. A reference that is
/// not present is unknown, and the segment's own rules decide.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    refs: HashMap<String, bool>,
}

impl Membership {
    /// Build a membership from the include and exclude lists a store keeps. A reference listed
    /// as both is excluded.
    pub fn from_segment_refs<I, E>(included: I, excluded: E) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        let mut refs: HashMap<String, bool> =
            included.into_iter().map(|r| (r.into(), true)).collect();
        refs.extend(excluded.into_iter().map(|r| (r.into(), false)));
        Membership { refs }
    }

    /// Some(true) if included, Some(false) if excluded, None if the store says nothing.
    pub fn check(&self, segment_ref: &str) -> Option<bool> {
        self.refs.get(segment_ref).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, bool)> for Membership {
    fn from_iter<T: IntoIterator<Item = (S, bool)>>(iter: T) -> Self {
        Membership {
            refs: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// Health of the big segment store as last observed by the metadata poller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BigSegmentStoreStatus {
    /// The last metadata query succeeded.
    pub available: bool,
    /// The store's data is older than [BigSegmentsConfig::stale_after], or its age is unknown.
    pub stale: bool,
}

/// How big segment data contributed to an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BigSegmentsStatus {
    /// Membership came from a store that is up to date.
    Healthy,
    /// Membership came from a store whose data may be out of date.
    Stale,
    /// A big segment was referenced but no store is configured, or the segment has no
    /// generation.
    NotConfigured,
    /// The store query failed, so the segment was evaluated without membership data.
    StoreError,
}

impl BigSegmentsStatus {
    fn severity(self) -> u8 {
        match self {
            BigSegmentsStatus::Healthy => 0,
            BigSegmentsStatus::NotConfigured => 1,
            BigSegmentsStatus::Stale => 2,
            BigSegmentsStatus::StoreError => 3,
        }
    }

    /// The more severe of two statuses.
    pub fn worst(self, other: BigSegmentsStatus) -> BigSegmentsStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

/// Source of big segment membership for evaluations.
///
/// [BigSegmentStoreManager] is the real implementation; anything that can answer the same
/// question can stand in for it.
pub trait BigSegmentProvider: Send + Sync {
    /// Membership for the context with key `context_key`, together with the status to report on
    /// evaluations that use it. A `None` membership means it could not be determined.
    fn membership(&self, context_key: &str) -> (Option<Arc<Membership>>, BigSegmentsStatus);
}

/// Configuration for [BigSegmentStoreManager].
#[derive(Debug, Clone)]
pub struct BigSegmentsConfig {
    /// Maximum number of contexts whose membership is cached.
    pub context_cache_size: usize,
    /// How long a context's cached membership is used before it is queried again.
    pub context_cache_time: Duration,
    /// How often store metadata is polled.
    pub status_poll_interval: Duration,
    /// Store data older than this is reported as stale.
    pub stale_after: Duration,
}

impl BigSegmentsConfig {
    pub const DEFAULT_CONTEXT_CACHE_SIZE: usize = 1000;
    pub const DEFAULT_CONTEXT_CACHE_TIME: Duration = Duration::from_secs(5);
    pub const DEFAULT_STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);
    pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(120);

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_context_cache_size(mut self, context_cache_size: usize) -> Self {
        self.context_cache_size = context_cache_size;
        self
    }

    pub fn with_context_cache_time(mut self, context_cache_time: Duration) -> Self {
        self.context_cache_time = context_cache_time;
        self
    }

    pub fn with_status_poll_interval(mut self, status_poll_interval: Duration) -> Self {
        self.status_poll_interval = status_poll_interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }
}

impl Default for BigSegmentsConfig {
    fn default() -> Self {
        Self {
            context_cache_size: Self::DEFAULT_CONTEXT_CACHE_SIZE,
            context_cache_time: Self::DEFAULT_CONTEXT_CACHE_TIME,
            status_poll_interval: Self::DEFAULT_STATUS_POLL_INTERVAL,
            stale_after: Self::DEFAULT_STALE_AFTER,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BigSegmentsStatus, Membership};
    use assert_json_diff::assert_json_eq;
    use maplit::hashmap;
    use spectral::prelude::*;
    use test_case::test_case;

    #[test]
    fn membership_from_refs_prefers_exclude() {
        let membership =
            Membership::from_segment_refs(vec!["a.g1", "both.g1"], vec!["b.g1", "both.g1"]);

        assert_that!(membership.check("a.g1")).contains_value(true);
        assert_that!(membership.check("b.g1")).contains_value(false);
        assert_that!(membership.check("both.g1")).contains_value(false);
        assert_that!(membership.check("unknown.g1")).is_none();
    }

    #[test]
    fn membership_from_pairs() {
        let membership: Membership = hashmap! { "seg.g2" => true, "other.g2" => false }
            .into_iter()
            .collect();
        assert_that!(membership.check("seg.g2")).contains_value(true);
        assert_that!(membership.check("seg.g1")).is_none();
        assert!(!membership.is_empty());
        assert!(Membership::default().is_empty());
    }

    #[test_case(BigSegmentsStatus::Healthy, BigSegmentsStatus::NotConfigured, BigSegmentsStatus::NotConfigured ; "not configured beats healthy")]
    #[test_case(BigSegmentsStatus::Stale, BigSegmentsStatus::NotConfigured, BigSegmentsStatus::Stale ; "stale beats not configured")]
    #[test_case(BigSegmentsStatus::Stale, BigSegmentsStatus::StoreError, BigSegmentsStatus::StoreError ; "store error beats stale")]
    #[test_case(BigSegmentsStatus::Healthy, BigSegmentsStatus::Healthy, BigSegmentsStatus::Healthy ; "same status")]
    fn worst_status_wins(a: BigSegmentsStatus, b: BigSegmentsStatus, expected: BigSegmentsStatus) {
        assert_eq!(a.worst(b), expected);
        assert_eq!(b.worst(a), expected);
    }

    #[test]
    fn status_serializes_to_wire_names() {
        assert_json_eq!(
            serde_json::json!([
                BigSegmentsStatus::Healthy,
                BigSegmentsStatus::Stale,
                BigSegmentsStatus::NotConfigured,
                BigSegmentsStatus::StoreError
            ]),
            serde_json::json!(["HEALTHY", "STALE", "NOT_CONFIGURED", "STORE_ERROR"])
        );
    }
}
