use std::ops::ControlFlow;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::broadcast::Broadcaster;
use crate::poller::RepeatingTask;

/// Configuration for [AvailabilityTracker].
#[derive(Debug, Clone)]
pub struct AvailabilityConfig {
    /// How often the health check runs while the resource is unavailable.
    pub poll_interval: Duration,
    /// If true, a transition back to available reports [AvailabilityStatus::refresh_needed], so
    /// the owner knows to rewrite data the resource may have lost while it was down.
    pub refresh_on_recovery: bool,
}

impl AvailabilityConfig {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
    pub const DEFAULT_REFRESH_ON_RECOVERY: bool = false;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_refresh_on_recovery(mut self, refresh_on_recovery: bool) -> Self {
        self.refresh_on_recovery = refresh_on_recovery;
        self
    }
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            refresh_on_recovery: Self::DEFAULT_REFRESH_ON_RECOVERY,
        }
    }
}

/// Notification sent on every availability transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityStatus {
    pub available: bool,
    /// Only ever true on a transition to available with `refresh_on_recovery` configured.
    pub refresh_needed: bool,
}

type HealthCheck = dyn Fn() -> bool + Send + Sync;
type TransitionHandler = dyn Fn(AvailabilityStatus) + Send + Sync;

struct TrackerState {
    available: bool,
    recovery_poller: Option<RepeatingTask>,
    closed: bool,
    // Counts transitions, so a handler call can tell it has been superseded.
    transitions: u64,
}

struct TrackerInner {
    config: AvailabilityConfig,
    health_check: Box<HealthCheck>,
    on_transition: Option<Box<TransitionHandler>>,
    state: Mutex<TrackerState>,
    broadcaster: Broadcaster<AvailabilityStatus>,
}

/// Two-state availability machine for a fallible external resource.
///
/// Starts out available. Reporting a failure with [AvailabilityTracker::update_availability]
/// switches to unavailable and starts polling the health check every
/// [AvailabilityConfig::poll_interval]; the first passing check switches back and stops the
/// poller. Each real transition notifies subscribers once. Reports that do not change the
/// state are ignored.
pub struct AvailabilityTracker {
    inner: Arc<TrackerInner>,
}

impl AvailabilityTracker {
    pub fn new<H>(config: AvailabilityConfig, health_check: H) -> Self
    where
        H: Fn() -> bool + Send + Sync + 'static,
    {
        Self::build(config, Box::new(health_check), None)
    }

    /// Like [AvailabilityTracker::new], but also calls `on_transition` synchronously after each
    /// transition, on whichever thread caused it.
    pub fn with_transition_handler<H, T>(
        config: AvailabilityConfig,
        health_check: H,
        on_transition: T,
    ) -> Self
    where
        H: Fn() -> bool + Send + Sync + 'static,
        T: Fn(AvailabilityStatus) + Send + Sync + 'static,
    {
        Self::build(config, Box::new(health_check), Some(Box::new(on_transition)))
    }

    fn build(
        config: AvailabilityConfig,
        health_check: Box<HealthCheck>,
        on_transition: Option<Box<TransitionHandler>>,
    ) -> Self {
        AvailabilityTracker {
            inner: Arc::new(TrackerInner {
                config,
                health_check,
                on_transition,
                state: Mutex::new(TrackerState {
                    available: true,
                    recovery_poller: None,
                    transitions: 0,
                    closed: false,
                }),
                broadcaster: Broadcaster::new(),
            }),
        }
    }

    pub fn is_available(&self) -> bool {
        self.inner.state.lock().available
    }

    /// Record the outcome of an operation against the resource.
    pub fn update_availability(&self, available: bool) {
        TrackerInner::update(&self.inner, available);
    }

    /// Receive an [AvailabilityStatus] for every transition from now on.
    pub fn subscribe(&self) -> Receiver<AvailabilityStatus> {
        self.inner.broadcaster.subscribe()
    }

    /// Stop any recovery polling. Later failures are still recorded but start no poller.
    pub fn close(&self) {
        let poller = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.recovery_poller.take()
        };
        if let Some(poller) = poller {
            poller.stop();
        }
    }
}

impl Drop for AvailabilityTracker {
    fn drop(&mut self) {
        self.close();
    }
}

impl TrackerInner {
    fn update(this: &Arc<TrackerInner>, available: bool) {
        let status = AvailabilityStatus {
            available,
            refresh_needed: available && this.config.refresh_on_recovery,
        };

        let (stopped_poller, transition) = {
            let mut state = this.state.lock();
            if state.available == available {
                return;
            }
            state.available = available;
            state.transitions += 1;

            let stopped_poller = if available {
                state.recovery_poller.take()
            } else {
                if !state.closed {
                    state.recovery_poller = this.start_recovery_poller(Arc::downgrade(this));
                }
                None
            };

            // Sent under the state lock so subscribers see transitions in the order they happened.
            this.broadcaster.broadcast(status);
            (stopped_poller, state.transitions)
        };

        // Dropping the handle stops the thread. This may be the poller's own thread, which
        // simply exits after its current run.
        drop(stopped_poller);

        if available {
            debug!("resource is available again");
        } else {
            warn!("resource became unavailable, polling for recovery");
        }
        if let Some(on_transition) = &this.on_transition {
            // A newer transition delivers its own status; this one is out of date.
            if this.state.lock().transitions == transition {
                on_transition(status);
            }
        }
    }

    fn start_recovery_poller(&self, weak: Weak<TrackerInner>) -> Option<RepeatingTask> {
        let interval = self.config.poll_interval;
        let task = RepeatingTask::start("availability-recovery", interval, interval, move || {
            let Some(inner) = weak.upgrade() else {
                return ControlFlow::Break(());
            };
            if (inner.health_check)() {
                TrackerInner::update(&inner, true);
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });

        match task {
            Ok(task) => Some(task),
            Err(e) => {
                warn!("could not start availability recovery poller: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AvailabilityConfig, AvailabilityStatus, AvailabilityTracker};
    use spectral::prelude::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn fast_config() -> AvailabilityConfig {
        AvailabilityConfig::new().with_poll_interval(Duration::from_millis(10))
    }

    fn switchable_tracker(config: AvailabilityConfig) -> (AvailabilityTracker, Arc<AtomicBool>) {
        let healthy = Arc::new(AtomicBool::new(false));
        let check = healthy.clone();
        let tracker = AvailabilityTracker::new(config, move || check.load(Ordering::SeqCst));
        (tracker, healthy)
    }

    #[test]
    fn starts_available_and_ignores_redundant_updates() {
        let (tracker, _) = switchable_tracker(fast_config());
        let statuses = tracker.subscribe();

        assert!(tracker.is_available());
        tracker.update_availability(true);
        tracker.update_availability(true);

        assert!(statuses.try_recv().is_err());
    }

    #[test]
    fn failure_notifies_once_and_recovery_notifies_once() {
        let (tracker, healthy) = switchable_tracker(fast_config());
        let statuses = tracker.subscribe();

        tracker.update_availability(false);
        tracker.update_availability(false);
        tracker.update_availability(false);
        assert!(!tracker.is_available());

        assert_that!(statuses.recv_timeout(Duration::from_secs(1))).is_ok_containing(
            AvailabilityStatus {
                available: false,
                refresh_needed: false,
            },
        );

        thread::sleep(Duration::from_millis(50));
        assert!(statuses.try_recv().is_err());

        healthy.store(true, Ordering::SeqCst);
        assert_that!(statuses.recv_timeout(Duration::from_secs(1))).is_ok_containing(
            AvailabilityStatus {
                available: true,
                refresh_needed: false,
            },
        );
        assert!(tracker.is_available());

        thread::sleep(Duration::from_millis(50));
        assert!(statuses.try_recv().is_err());
    }

    #[test]
    fn refresh_needed_only_when_configured() {
        let (tracker, healthy) = switchable_tracker(fast_config().with_refresh_on_recovery(true));
        let statuses = tracker.subscribe();

        tracker.update_availability(false);
        let went_down = statuses.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(!went_down.refresh_needed);

        healthy.store(true, Ordering::SeqCst);
        let came_back = statuses.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(came_back.available);
        assert!(came_back.refresh_needed);
    }

    #[test]
    fn explicit_success_stops_recovery_polling() {
        let checks = Arc::new(AtomicUsize::new(0));
        let counter = checks.clone();
        let tracker = AvailabilityTracker::new(fast_config(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            false
        });

        tracker.update_availability(false);
        thread::sleep(Duration::from_millis(60));
        assert!(checks.load(Ordering::SeqCst) > 0);

        tracker.update_availability(true);
        thread::sleep(Duration::from_millis(30));
        let after_recovery = checks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(checks.load(Ordering::SeqCst), after_recovery);
    }

    #[test]
    fn transition_handler_sees_each_transition() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let tracker = AvailabilityTracker::with_transition_handler(
            fast_config(),
            || true,
            move |status| sink.lock().push(status.available),
        );

        tracker.update_availability(false);
        thread::sleep(Duration::from_millis(200));

        assert_eq!(*seen.lock(), vec![false, true]);
    }

    #[test]
    fn concurrent_transitions_reach_subscribers_in_order() {
        let (tracker, _) =
            switchable_tracker(AvailabilityConfig::new().with_poll_interval(Duration::from_secs(10)));
        let statuses = tracker.subscribe();

        thread::scope(|scope| {
            for t in 0..4 {
                let tracker = &tracker;
                scope.spawn(move || {
                    for i in 0..200 {
                        tracker.update_availability((i + t) % 2 == 0);
                    }
                });
            }
        });

        let received: Vec<bool> = statuses.try_iter().map(|s| s.available).collect();
        assert!(!received.is_empty());
        // Each broadcast is a real transition, so consecutive values always differ.
        assert!(received.windows(2).all(|pair| pair[0] != pair[1]));
        assert_eq!(received.last().copied(), Some(tracker.is_available()));
        assert_eq!(received.first().copied(), Some(false));
    }

    #[test]
    fn close_stops_polling() {
        let checks = Arc::new(AtomicUsize::new(0));
        let counter = checks.clone();
        let tracker = AvailabilityTracker::new(fast_config(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            false
        });

        tracker.update_availability(false);
        tracker.close();
        thread::sleep(Duration::from_millis(30));
        let after_close = checks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(checks.load(Ordering::SeqCst), after_close);
        assert!(!tracker.is_available());
    }
}
