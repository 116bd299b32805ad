//! Caller-owned TTL cache with an injected clock.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use crate::clock::Clock;
use crate::settings::{EconomySettings, SettingsSnapshot};
use crate::EconomyError;

struct Entry<V> {
    value: V,
    stored_at_ms: u64,
}

pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    ttl_ms: u64,
    clock: Arc<dyn Clock>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Entry<V>>> {
        match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn fresh(&self, entry: &Entry<V>, now_ms: u64) -> bool {
        now_ms.saturating_sub(entry.stored_at_ms) < self.ttl_ms
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now_ms = self.clock.now_ms();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if self.fresh(entry, now_ms) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let stored_at_ms = self.clock.now_ms();
        self.lock().insert(
            key,
            Entry {
                value,
                stored_at_ms,
            },
        );
    }

    pub fn invalidate(&self, key: &K) {
        self.lock().remove(key);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        let now_ms = self.clock.now_ms();
        let mut entries = self.lock();
        entries.retain(|_, entry| now_ms.saturating_sub(entry.stored_at_ms) < self.ttl_ms);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the cached value or compute, store and return a fresh one.
    ///
    /// `f` runs without the cache lock held; concurrent misses may both load.
    pub fn get_or_try_insert_with<E>(
        &self,
        key: K,
        f: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = f()?;
        self.insert(key, value.clone());
        Ok(value)
    }
}

/// [`EconomySettings`] wrapper that serves snapshots from a [`TtlCache`].
pub struct CachedSettings<S> {
    source: S,
    cache: TtlCache<(), SettingsSnapshot>,
}

impl<S: EconomySettings> CachedSettings<S> {
    pub fn new(source: S, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            cache: TtlCache::new(ttl, clock),
        }
    }

    /// Force the next snapshot to be re-read from the source.
    pub fn invalidate(&self) {
        debug!("economy settings cache invalidated");
        self.cache.clear();
    }
}

impl<S: EconomySettings> EconomySettings for CachedSettings<S> {
    fn snapshot(&self) -> Result<SettingsSnapshot, EconomyError> {
        self.cache
            .get_or_try_insert_with((), || self.source.snapshot())
    }
}
