use std::borrow::Borrow;
use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

/// A bounded set of recently seen keys, safe to share between threads.
///
/// Once more than `capacity` distinct keys have been added, the key that was least recently
/// added or re-added is dropped. Useful for "have I seen this identity lately" deduplication.
///
/// ```
/// # use flag_evaluation_engine::LruKeySet;
/// let seen = LruKeySet::new(2);
/// assert!(!seen.add("a"));
/// assert!(!seen.add("b"));
/// assert!(seen.add("a"));
/// assert!(!seen.add("c"));
/// assert!(!seen.contains("b"));
/// ```
pub struct LruKeySet<K> {
    capacity: usize,
    // None when the capacity is zero: nothing is ever remembered.
    keys: Option<Mutex<LruCache<K, ()>>>,
}

impl<K: Hash + Eq> LruKeySet<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            keys: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    /// Add `key` as the most recent entry. Returns true if it was already present.
    pub fn add(&self, key: K) -> bool {
        match &self.keys {
            Some(keys) => keys.lock().put(key, ()).is_some(),
            None => false,
        }
    }

    /// Check for `key` without refreshing it.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.keys
            .as_ref()
            .is_some_and(|keys| keys.lock().contains(key))
    }

    pub fn len(&self) -> usize {
        self.keys.as_ref().map_or(0, |keys| keys.lock().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        if let Some(keys) = &self.keys {
            keys.lock().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LruKeySet;
    use proptest::prelude::*;
    use spectral::prelude::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn add_reports_previous_presence() {
        let set = LruKeySet::new(10);
        assert_that!(set.add("a")).is_false();
        assert_that!(set.add("a")).is_true();
        assert_that!(set.len()).is_equal_to(1);
    }

    #[test]
    fn exceeding_capacity_evicts_least_recent() {
        let set = LruKeySet::new(3);
        for key in ["a", "b", "c", "d"] {
            set.add(key);
        }
        assert!(!set.contains("a"));
        assert!(set.contains("b"));
        assert!(set.contains("d"));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn re_adding_protects_a_key_from_eviction() {
        let set = LruKeySet::new(2);
        set.add("a");
        set.add("b");
        assert!(set.add("a"));
        set.add("c");

        assert!(set.contains("a"));
        assert!(!set.contains("b"));
        assert!(set.contains("c"));
    }

    #[test]
    fn zero_capacity_remembers_nothing() {
        let set = LruKeySet::new(0);
        assert!(!set.add("a"));
        assert!(!set.add("a"));
        assert!(set.is_empty());
        assert_eq!(set.capacity(), 0);
    }

    #[test]
    fn clear_forgets_everything() {
        let set = LruKeySet::new(5);
        set.add(1);
        set.add(2);
        set.clear();
        assert!(set.is_empty());
        assert!(!set.add(1));
    }

    #[test]
    fn concurrent_adds_stay_bounded() {
        let set = Arc::new(LruKeySet::new(50));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let set = set.clone();
                thread::spawn(move || {
                    for i in 0..200 {
                        set.add(format!("{}-{}", t, i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(set.len(), 50);
    }

    #[test]
    fn contains_does_not_refresh_recency() {
        let set = LruKeySet::new(2);
        set.add("a");
        set.add("b");
        assert!(set.contains("a"));
        set.add("c");

        assert!(!set.contains("a"));
        assert!(set.contains("b"));
    }

    proptest! {
        #[test]
        fn bounded_set_keeps_most_recent_keys(
            keys in prop::collection::vec(0u8..20, 1..200),
            capacity in 1usize..8,
        ) {
            let set = LruKeySet::new(capacity);
            for key in &keys {
                set.add(*key);
            }

            let mut expected: Vec<u8> = Vec::new();
            for key in keys.iter().rev() {
                if expected.len() == capacity {
                    break;
                }
                if !expected.contains(key) {
                    expected.push(*key);
                }
            }

            prop_assert_eq!(set.len(), expected.len());
            for key in 0u8..20 {
                prop_assert_eq!(set.contains(&key), expected.contains(&key));
            }
        }
    }
}
