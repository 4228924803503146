//! Bounded key/value cache with access-based expiry.
//!
//! Entries expire `ttl` after their last access; the cache never holds more
//! than `max_size` entries once an insert returns (least recently accessed
//! entries go first). Eviction is passive and happens on access and insert,
//! there is no background sweeper.
//!
//! Per-key operations (`insert_if_absent`, `compute`) run under the shard
//! lock of the underlying `DashMap`, so concurrent callers racing on the same
//! key never lose updates.

use std::borrow::Borrow;
use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

struct CacheEntry<V> {
    value: V,
    last_access: Instant,
}

pub struct BoundedCache<K, V> {
    entries: DashMap<K, CacheEntry<V>>,
    max_size: usize,
    ttl: Duration,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_size: max_size.max(1),
            ttl,
        }
    }

    fn is_expired(&self, entry: &CacheEntry<V>, now: Instant) -> bool {
        now.saturating_duration_since(entry.last_access) >= self.ttl
    }

    /// Fetch a live value and refresh its access time.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        {
            let mut entry = self.entries.get_mut(key)?;
            if !self.is_expired(&entry, now) {
                entry.last_access = now;
                return Some(entry.value.clone());
            }
        }
        self.expire(key, now);
        None
    }

    /// Insert or replace a value. Returns the previous live value, if any.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let now = Instant::now();
        let previous = self
            .entries
            .insert(key, CacheEntry { value, last_access: now })
            .filter(|old| !self.is_expired(old, now))
            .map(|old| old.value);
        self.enforce_capacity();
        previous
    }

    /// Insert only if no live value exists for `key`.
    ///
    /// Returns `Err(existing)` when the key is already taken; an expired
    /// entry counts as absent and is replaced.
    pub fn insert_if_absent(&self, key: K, value: V) -> Result<(), V> {
        let now = Instant::now();
        let outcome = match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if self.is_expired(occupied.get(), now) {
                    occupied.insert(CacheEntry { value, last_access: now });
                    Ok(())
                } else {
                    occupied.get_mut().last_access = now;
                    Err(occupied.get().value.clone())
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry { value, last_access: now });
                Ok(())
            }
        };
        if outcome.is_ok() {
            self.enforce_capacity();
        }
        outcome
    }

    /// Atomically replace a live value with `f(current)`.
    ///
    /// Returns `None` if the key is absent or expired. When `f` fails the
    /// stored value is left untouched and the error is returned.
    pub fn compute<Q, F, E>(&self, key: &Q, f: F) -> Option<Result<V, E>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&V) -> Result<V, E>,
    {
        let now = Instant::now();
        {
            let mut entry = self.entries.get_mut(key)?;
            if !self.is_expired(&entry, now) {
                entry.last_access = now;
                return Some(f(&entry.value).map(|updated| {
                    entry.value = updated.clone();
                    updated
                }));
            }
        }
        self.expire(key, now);
        None
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        self.entries
            .remove(key)
            .filter(|(_, entry)| !self.is_expired(entry, now))
            .map(|(_, entry)| entry.value)
    }

    /// Number of stored entries, including ones that expired but were not
    /// touched since.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn expire<Q>(&self, key: &Q, now: Instant)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.remove_if(key, |_, entry| self.is_expired(entry, now));
    }

    fn enforce_capacity(&self) {
        if self.entries.len() <= self.max_size {
            return;
        }
        let now = Instant::now();
        self.entries.retain(|_, entry| !self.is_expired(entry, now));

        let excess = self.entries.len().saturating_sub(self.max_size);
        if excess == 0 {
            return;
        }

        let mut by_age: Vec<(K, Instant)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().last_access))
            .collect();
        by_age.sort_by_key(|(_, last_access)| *last_access);

        for (key, _) in by_age.into_iter().take(excess) {
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn get_returns_inserted_value() {
        let cache = BoundedCache::new(10, Duration::from_secs(60));
        cache.insert("a".to_string(), 1);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn entries_expire_after_ttl_without_access() {
        let cache = BoundedCache::new(10, Duration::from_millis(30));
        cache.insert("a".to_string(), 1);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get("a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn least_recently_accessed_entry_is_evicted_first() {
        let cache = BoundedCache::new(2, Duration::from_secs(60));
        cache.insert("a".to_string(), 1);
        thread::sleep(Duration::from_millis(2));
        cache.insert("b".to_string(), 2);
        thread::sleep(Duration::from_millis(2));
        // Touch `a` so `b` becomes the oldest.
        assert_eq!(cache.get("a"), Some(1));
        thread::sleep(Duration::from_millis(2));
        cache.insert("c".to_string(), 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn insert_if_absent_keeps_the_first_value() {
        let cache = BoundedCache::new(10, Duration::from_secs(60));
        assert_eq!(cache.insert_if_absent("k".to_string(), "first"), Ok(()));
        assert_eq!(cache.insert_if_absent("k".to_string(), "second"), Err("first"));
        assert_eq!(cache.get("k"), Some("first"));
    }

    #[test]
    fn insert_if_absent_replaces_expired_entries() {
        let cache = BoundedCache::new(10, Duration::from_millis(20));
        cache.insert("k".to_string(), 1);
        thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.insert_if_absent("k".to_string(), 2), Ok(()));
        assert_eq!(cache.get("k"), Some(2));
    }

    #[test]
    fn failed_compute_leaves_value_untouched() {
        let cache = BoundedCache::new(10, Duration::from_secs(60));
        cache.insert("k".to_string(), 1);

        let result: Option<Result<i32, &str>> = cache.compute("k", |_| Err("nope"));
        assert_eq!(result, Some(Err("nope")));
        assert_eq!(cache.get("k"), Some(1));

        let missing: Option<Result<i32, &str>> = cache.compute("missing", |v| Ok(v + 1));
        assert_eq!(missing, None);
    }

    #[test]
    fn concurrent_compute_never_loses_updates() {
        let cache = Arc::new(BoundedCache::new(10, Duration::from_secs(60)));
        cache.insert("counter".to_string(), 0u64);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for _ in 0..500 {
                        let _ = cache.compute("counter", |v| Ok::<_, ()>(v + 1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.get("counter"), Some(4000));
    }
}
