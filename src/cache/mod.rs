//! Time-bounded caches shared by the providers
//!
//! [`TtlCache`] is the building block behind every provider cache: string
//! keys, per-entry expiry, an optional eviction callback (used by the
//! launch-template provider to delete cloud-side templates), and a periodic
//! sweep driven by a tokio task.

pub mod unavailable_offerings;

pub use unavailable_offerings::UnavailableOfferings;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Callback invoked with (key, value) after an entry is evicted
pub type EvictionCallback<V> = Box<dyn Fn(&str, &V) + Send + Sync>;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

struct Inner<V> {
    default_ttl: Duration,
    entries: Mutex<HashMap<String, Entry<V>>>,
    on_evicted: Mutex<Option<EvictionCallback<V>>>,
}

/// A TTL cache with eviction callbacks and a cleanup sweep
///
/// Cloning is cheap and shares the underlying store.
pub struct TtlCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for TtlCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    /// Create a cache whose entries expire after `default_ttl`
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                default_ttl,
                entries: Mutex::new(HashMap::new()),
                on_evicted: Mutex::new(None),
            }),
        }
    }

    /// Cache with the provider default of a 15 minute TTL
    pub fn with_default_ttl() -> Self {
        Self::new(Duration::from_secs(15 * 60))
    }

    /// Insert a value with the default TTL, refreshing any existing entry
    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.insert_with_ttl(key, value, self.inner.default_ttl);
    }

    /// Insert a value with an explicit TTL
    pub fn insert_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let mut entries = self.inner.entries.lock();
        entries.insert(
            key.into(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Fetch a live entry
    pub fn get(&self, key: &str) -> Option<V> {
        let entries = self.inner.entries.lock();
        entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone())
    }

    /// Fetch a live entry together with its expiry instant
    pub fn get_with_expiration(&self, key: &str) -> Option<(V, Instant)> {
        let entries = self.inner.entries.lock();
        entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| (e.value.clone(), e.expires_at))
    }

    /// Remove an entry, invoking the eviction callback if one is set
    pub fn remove(&self, key: &str) {
        let removed = self.inner.entries.lock().remove(key);
        if let Some(entry) = removed {
            // callback runs outside the entries lock: it may re-enter the cache
            let cb = self.inner.on_evicted.lock();
            if let Some(cb) = cb.as_ref() {
                cb(key, &entry.value);
            }
        }
    }

    /// Remove an entry without triggering the eviction callback
    pub fn remove_silently(&self, key: &str) {
        self.inner.entries.lock().remove(key);
    }

    /// Snapshot of all live entries
    pub fn items(&self) -> Vec<(String, V)> {
        let now = Instant::now();
        self.inner
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| e.expires_at > now)
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .entries
            .lock()
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    /// True when no live entries remain
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry without invoking callbacks
    pub fn flush(&self) {
        self.inner.entries.lock().clear();
    }

    /// Install the eviction callback, returning the previous one
    pub fn set_eviction_callback(
        &self,
        cb: Option<EvictionCallback<V>>,
    ) -> Option<EvictionCallback<V>> {
        std::mem::replace(&mut *self.inner.on_evicted.lock(), cb)
    }

    /// Evict expired entries, invoking the callback for each
    pub fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<(String, V)> = {
            let mut entries = self.inner.entries.lock();
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.expires_at <= now)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| entries.remove(&k).map(|e| (k, e.value)))
                .collect()
        };
        if expired.is_empty() {
            return;
        }
        let cb = self.inner.on_evicted.lock();
        if let Some(cb) = cb.as_ref() {
            for (key, value) in &expired {
                cb(key, value);
            }
        }
    }

    /// Spawn a background task sweeping expired entries every `interval`
    pub fn spawn_sweeper(&self, interval: Duration, cancel: CancellationToken) {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => cache.sweep(),
                }
            }
        });
    }
}
