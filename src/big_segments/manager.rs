use std::ops::ControlFlow;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Weak};

use log::{debug, warn};
use parking_lot::Mutex;

use super::{
    BigSegmentProvider, BigSegmentStore, BigSegmentStoreStatus, BigSegmentsConfig,
    BigSegmentsStatus, Membership,
};
use crate::availability::{AvailabilityConfig, AvailabilityTracker};
use crate::broadcast::Broadcaster;
use crate::cache::{LoadingCache, LoadingCacheConfig};
use crate::error::StoreError;
use crate::poller::RepeatingTask;
use crate::util::hash_context_key;

struct ManagerInner {
    store: Arc<dyn BigSegmentStore>,
    config: BigSegmentsConfig,
    memberships: LoadingCache<String, Arc<Membership>, StoreError>,
    tracker: AvailabilityTracker,
    last_status: Mutex<Option<BigSegmentStoreStatus>>,
    broadcaster: Broadcaster<BigSegmentStoreStatus>,
    metadata_poller: Mutex<Option<RepeatingTask>>,
}

/// Caching front end for a [BigSegmentStore].
///
/// Membership is cached per context key for [BigSegmentsConfig::context_cache_time], and
/// concurrent lookups of an uncached key share one store query. A background thread polls the
/// store's metadata every [BigSegmentsConfig::status_poll_interval] to track whether it is
/// reachable and whether its data is stale; status changes are published to
/// [BigSegmentStoreManager::subscribe]rs.
pub struct BigSegmentStoreManager {
    inner: Arc<ManagerInner>,
}

impl BigSegmentStoreManager {
    pub fn new(store: Arc<dyn BigSegmentStore>, config: BigSegmentsConfig) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner>| {
            let loader_store = store.clone();
            let memberships = LoadingCache::new(
                LoadingCacheConfig::new()
                    .with_ttl(config.context_cache_time)
                    .with_capacity(config.context_cache_size),
                move |context_key: &String| {
                    debug!("querying big segment membership");
                    loader_store
                        .get_membership(&hash_context_key(context_key))
                        .map(Arc::new)
                },
            );

            let health_store = store.clone();
            let transition_target = weak.clone();
            let tracker = AvailabilityTracker::with_transition_handler(
                AvailabilityConfig::new().with_poll_interval(config.status_poll_interval),
                move || health_store.get_metadata().is_ok(),
                move |status| {
                    let Some(inner) = transition_target.upgrade() else {
                        return;
                    };
                    if status.available {
                        inner.poll_store_and_update_status();
                    } else {
                        inner.mark_unavailable();
                    }
                },
            );

            ManagerInner {
                store,
                config,
                memberships,
                tracker,
                last_status: Mutex::new(None),
                broadcaster: Broadcaster::new(),
                metadata_poller: Mutex::new(None),
            }
        });

        let weak = Arc::downgrade(&inner);
        let poller = RepeatingTask::start(
            "big-segments-status",
            std::time::Duration::ZERO,
            inner.config.status_poll_interval,
            move || match weak.upgrade() {
                Some(inner) => {
                    inner.poll_store_and_update_status();
                    ControlFlow::Continue(())
                }
                None => ControlFlow::Break(()),
            },
        );
        match poller {
            Ok(poller) => *inner.metadata_poller.lock() = Some(poller),
            Err(e) => warn!(
                "could not start big segment status poller, status is only refreshed on demand: {}",
                e
            ),
        }

        BigSegmentStoreManager { inner }
    }

    /// Look up membership for `context_key`, from the cache if possible.
    ///
    /// A store failure yields no membership and [BigSegmentsStatus::StoreError]; it is not
    /// cached, so the next lookup queries the store again. A successful lookup is
    /// [BigSegmentsStatus::Stale] unless the most recent metadata poll succeeded and found the
    /// store up to date.
    pub fn get_membership(&self, context_key: &str) -> (Option<Arc<Membership>>, BigSegmentsStatus) {
        let status = self.status();

        match self.inner.memberships.get(&context_key.to_owned()) {
            Ok(membership) => {
                let freshness = if !status.available || status.stale {
                    BigSegmentsStatus::Stale
                } else {
                    BigSegmentsStatus::Healthy
                };
                (Some(membership), freshness)
            }
            Err(e) => {
                warn!("big segment membership query failed: {}", e);
                self.inner.tracker.update_availability(false);
                (None, BigSegmentsStatus::StoreError)
            }
        }
    }

    /// The current store status. If no metadata poll has completed yet, this queries the
    /// store's metadata before returning.
    pub fn status(&self) -> BigSegmentStoreStatus {
        let last = *self.inner.last_status.lock();
        match last {
            Some(status) => status,
            None => self.inner.poll_store_and_update_status(),
        }
    }

    /// Receive every change of [BigSegmentStoreStatus] from now on.
    pub fn subscribe(&self) -> Receiver<BigSegmentStoreStatus> {
        self.inner.broadcaster.subscribe()
    }

    /// Drop all cached memberships.
    pub fn clear_cache(&self) {
        self.inner.memberships.clear();
    }

    /// Stop background polling. Lookups keep working, but status is no longer refreshed.
    pub fn close(&self) {
        if let Some(poller) = self.inner.metadata_poller.lock().take() {
            poller.stop();
        }
        self.inner.tracker.close();
    }
}

impl Drop for BigSegmentStoreManager {
    fn drop(&mut self) {
        self.close();
    }
}

impl BigSegmentProvider for BigSegmentStoreManager {
    fn membership(&self, context_key: &str) -> (Option<Arc<Membership>>, BigSegmentsStatus) {
        self.get_membership(context_key)
    }
}

impl ManagerInner {
    fn poll_store_and_update_status(&self) -> BigSegmentStoreStatus {
        let status = match self.store.get_metadata() {
            Ok(metadata) => BigSegmentStoreStatus {
                available: true,
                stale: self.is_stale(metadata.last_up_to_date),
            },
            Err(e) => {
                warn!("big segment store metadata query failed: {}", e);
                BigSegmentStoreStatus {
                    available: false,
                    stale: false,
                }
            }
        };

        self.publish(status);
        self.tracker.update_availability(status.available);
        status
    }

    fn mark_unavailable(&self) {
        let stale = self.last_status.lock().map_or(false, |s| s.stale);
        self.publish(BigSegmentStoreStatus {
            available: false,
            stale,
        });
    }

    fn publish(&self, status: BigSegmentStoreStatus) {
        let mut last = self.last_status.lock();
        let changed = last.map_or(false, |previous| previous != status);
        *last = Some(status);
        if changed {
            debug!("big segment store status changed to {:?}", status);
            // Still holding the lock, so concurrent publishes reach subscribers in order.
            self.broadcaster.broadcast(status);
        }
    }

    fn is_stale(&self, last_up_to_date: Option<i64>) -> bool {
        let Some(updated) = last_up_to_date else {
            return true;
        };
        let stale_after_ms = i64::try_from(self.config.stale_after.as_millis()).unwrap_or(i64::MAX);
        // A timestamp too far in the past to subtract is as stale as it gets.
        chrono::Utc::now()
            .timestamp_millis()
            .checked_sub(updated)
            .map_or(true, |age_ms| age_ms > stale_after_ms)
    }
}
