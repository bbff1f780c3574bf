use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, warn};
use lru::LruCache;
use parking_lot::{Condvar, Mutex};

use crate::poller::RepeatingTask;

/// Configuration for [LoadingCache].
#[derive(Debug, Clone)]
pub struct LoadingCacheConfig {
    /// How long a loaded or explicitly set value stays fresh.
    ///
    /// Defaults to [LoadingCacheConfig::DEFAULT_TTL].
    pub ttl: Duration,
    /// Maximum number of entries. Unbounded when None.
    pub capacity: Option<usize>,
    /// If set, a background thread removes expired entries on this interval. Expired entries are
    /// never returned either way.
    pub purge_interval: Option<Duration>,
}

impl LoadingCacheConfig {
    /// Default value for [LoadingCacheConfig::ttl].
    pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_purge_interval(mut self, purge_interval: Duration) -> Self {
        self.purge_interval = Some(purge_interval);
        self
    }
}

impl Default for LoadingCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Self::DEFAULT_TTL,
            capacity: None,
            purge_interval: None,
        }
    }
}

type Loader<K, V, E> = dyn Fn(&K) -> Result<V, E> + Send + Sync;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

enum FlightState<V, E> {
    Pending,
    Done(Result<V, E>),
    // The loader panicked; waiters start over.
    Abandoned,
}

/// One in-progress load, shared by the caller running it and every caller waiting on it.
struct Flight<V, E> {
    state: Mutex<FlightState<V, E>>,
    finished: Condvar,
}

impl<V: Clone, E: Clone> Flight<V, E> {
    fn new() -> Self {
        Self {
            state: Mutex::new(FlightState::Pending),
            finished: Condvar::new(),
        }
    }

    fn finish(&self, outcome: FlightState<V, E>) {
        *self.state.lock() = outcome;
        self.finished.notify_all();
    }

    /// Block until the load finishes. None means it was abandoned.
    fn wait(&self) -> Option<Result<V, E>> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                FlightState::Pending => self.finished.wait(&mut state),
                FlightState::Done(result) => return Some(result.clone()),
                FlightState::Abandoned => return None,
            }
        }
    }
}

struct State<K, V, E> {
    entries: LruCache<K, Entry<V>>,
    in_flight: HashMap<K, Arc<Flight<V, E>>>,
}

struct Inner<K, V, E> {
    ttl: Duration,
    capacity: Option<usize>,
    loader: Box<Loader<K, V, E>>,
    state: Mutex<State<K, V, E>>,
}

enum Lookup<V, E> {
    Hit(V),
    Lead(Arc<Flight<V, E>>),
    Follow(Arc<Flight<V, E>>),
}

/// A key-value cache that loads missing or expired values on demand.
///
/// Concurrent [LoadingCache::get] calls for the same missing key share a single call to the
/// loader, and all of them receive its result. Failed loads are handed to every waiting caller
/// but never cached, so the next `get` retries. Loads for different keys run in parallel; the
/// loader is never called while the cache lock is held.
pub struct LoadingCache<K, V, E> {
    inner: Arc<Inner<K, V, E>>,
    purger: Option<RepeatingTask>,
}

impl<K, V, E> LoadingCache<K, V, E>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new<F>(config: LoadingCacheConfig, loader: F) -> Self
    where
        F: Fn(&K) -> Result<V, E> + Send + Sync + 'static,
    {
        let entries = match config.capacity.and_then(NonZeroUsize::new) {
            Some(capacity) => LruCache::new(capacity),
            None => LruCache::unbounded(),
        };
        let inner = Arc::new(Inner {
            ttl: config.ttl,
            capacity: config.capacity,
            loader: Box::new(loader),
            state: Mutex::new(State {
                entries,
                in_flight: HashMap::new(),
            }),
        });

        let purger = config
            .purge_interval
            .and_then(|interval| start_purger(Arc::downgrade(&inner), interval));

        LoadingCache { inner, purger }
    }

    /// Return the cached value for `key`, loading it if it is missing or expired.
    ///
    /// # Errors
    ///
    /// Returns the loader's error if the load this call waited on failed.
    pub fn get(&self, key: &K) -> Result<V, E> {
        loop {
            match self.lookup(key) {
                Lookup::Hit(value) => return Ok(value),
                Lookup::Lead(flight) => return self.load(key, flight),
                Lookup::Follow(flight) => {
                    if let Some(result) = flight.wait() {
                        return result;
                    }
                    debug!("load abandoned by another caller, retrying");
                }
            }
        }
    }

    fn lookup(&self, key: &K) -> Lookup<V, E> {
        let mut state = self.inner.state.lock();
        let now = Instant::now();

        let cached = state
            .entries
            .get(key)
            .map(|entry| (entry.expires_at > now).then(|| entry.value.clone()));
        match cached {
            Some(Some(value)) => return Lookup::Hit(value),
            Some(None) => {
                state.entries.pop(key);
            }
            None => (),
        }

        if let Some(flight) = state.in_flight.get(key) {
            return Lookup::Follow(flight.clone());
        }

        let flight = Arc::new(Flight::new());
        state.in_flight.insert(key.clone(), flight.clone());
        Lookup::Lead(flight)
    }

    fn load(&self, key: &K, flight: Arc<Flight<V, E>>) -> Result<V, E> {
        let mut guard = AbandonOnPanic {
            inner: &self.inner,
            key,
            flight: &flight,
            armed: true,
        };

        let result = (self.inner.loader)(key);

        {
            let mut state = self.inner.state.lock();
            // A remove or clear while loading discards this load's claim on the key.
            if state.in_flight.get(key).is_some_and(|f| Arc::ptr_eq(f, &flight)) {
                state.in_flight.remove(key);
                if let Ok(value) = &result {
                    self.inner.insert_locked(&mut state, key.clone(), value.clone());
                }
            }
        }

        guard.armed = false;
        flight.finish(FlightState::Done(result.clone()));
        result
    }

    /// Store `value` for `key`, replacing any cached value. It expires like a loaded value.
    pub fn set(&self, key: K, value: V) {
        let mut state = self.inner.state.lock();
        state.in_flight.remove(&key);
        self.inner.insert_locked(&mut state, key, value);
    }

    /// Drop `key` from the cache. A load already running for it still completes for its
    /// callers but is not cached.
    pub fn remove(&self, key: &K) {
        let mut state = self.inner.state.lock();
        state.entries.pop(key);
        state.in_flight.remove(key);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.entries.clear();
        state.in_flight.clear();
    }

    /// Remove expired entries now, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.inner.purge_expired()
    }

    /// Number of cached entries, possibly including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the background purge thread, if there is one.
    pub fn stop_purging(&mut self) {
        if let Some(purger) = self.purger.take() {
            purger.stop();
        }
    }
}

impl<K, V, E> Inner<K, V, E>
where
    K: Hash + Eq + Clone,
{
    fn insert_locked(&self, state: &mut State<K, V, E>, key: K, value: V) {
        if self.capacity == Some(0) {
            return;
        }
        let now = Instant::now();

        // Expired entries make room before any live entry is evicted.
        let full = self.capacity.is_some_and(|capacity| state.entries.len() >= capacity);
        if full && !state.entries.contains(&key) {
            remove_expired(&mut state.entries, now);
        }

        // At capacity, put evicts the least recently used entry.
        state.entries.put(
            key,
            Entry {
                value,
                expires_at: now + self.ttl,
            },
        );
    }

    fn purge_expired(&self) -> usize {
        let mut state = self.state.lock();
        remove_expired(&mut state.entries, Instant::now())
    }
}

fn remove_expired<K: Hash + Eq + Clone, V>(entries: &mut LruCache<K, Entry<V>>, now: Instant) -> usize {
    let expired: Vec<K> = entries
        .iter()
        .filter(|(_, entry)| entry.expires_at <= now)
        .map(|(key, _)| key.clone())
        .collect();
    for key in &expired {
        entries.pop(key);
    }
    expired.len()
}

fn start_purger<K, V, E>(inner: Weak<Inner<K, V, E>>, interval: Duration) -> Option<RepeatingTask>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    let task = RepeatingTask::start("cache-purge", interval, interval, move || {
        let Some(inner) = inner.upgrade() else {
            return ControlFlow::Break(());
        };
        let purged = inner.purge_expired();
        if purged > 0 {
            debug!("purged {} expired cache entries", purged);
        }
        ControlFlow::Continue(())
    });

    match task {
        Ok(task) => Some(task),
        Err(e) => {
            warn!("could not start cache purge thread, expired entries are only dropped on access: {}", e);
            None
        }
    }
}

/// Marks the flight abandoned if the loader unwinds, so that waiters retry instead of hanging.
struct AbandonOnPanic<'a, K: Hash + Eq, V, E> {
    inner: &'a Inner<K, V, E>,
    key: &'a K,
    flight: &'a Arc<Flight<V, E>>,
    armed: bool,
}

impl<'a, K: Hash + Eq, V, E> Drop for AbandonOnPanic<'a, K, V, E> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut state = self.inner.state.lock();
            if state
                .in_flight
                .get(self.key)
                .is_some_and(|f| Arc::ptr_eq(f, self.flight))
            {
                state.in_flight.remove(self.key);
            }
        }
        *self.flight.state.lock() = FlightState::Abandoned;
        self.flight.finished.notify_all();
    }
}
