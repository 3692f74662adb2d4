//! Short-TTL result cache with single-flight lookups
//!
//! A miss runs the computation while holding a per-key async lock, so concurrent
//! lookups for the same key wait for the first one instead of calling out again.
//! Errors are never cached.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::{Duration, Instant};
use tracing::trace;

/// Derive a cache key from a namespace and request parameters
///
/// `serde_json::Value` objects serialize with sorted keys, so equal
/// parameters always hash to the same key.
pub fn cache_key(namespace: &str, params: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update([0u8]);
    hasher.update(params.to_string().as_bytes());
    format!("{}:{}", namespace, hex::encode(&hasher.finalize()[..16]))
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

type Slot<V> = Arc<tokio::sync::Mutex<Option<CacheEntry<V>>>>;

/// Hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug)]
pub struct TtlCache<V> {
    ttl: Duration,
    slots: Mutex<HashMap<String, Slot<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the live value for `key`, or compute, store and return it
    ///
    /// At most one computation per key is in flight at a time.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: &str, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let slot = self.slot(key);
        let mut entry = slot.lock().await;

        if let Some(cached) = entry.as_ref() {
            if cached.is_live(Instant::now()) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(key, "cache hit");
                return Ok(cached.value.clone());
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        trace!(key, "cache miss");

        let value = compute().await?;
        *entry = Some(CacheEntry {
            value: value.clone(),
            expires_at: Instant::now() + self.ttl,
        });
        Ok(value)
    }

    /// Non-blocking read; expired entries and in-flight computations read as `None`
    pub fn get(&self, key: &str) -> Option<V> {
        let slot = self.slots().get(key).cloned()?;
        let entry = slot.try_lock().ok()?;
        entry
            .as_ref()
            .filter(|cached| cached.is_live(Instant::now()))
            .map(|cached| cached.value.clone())
    }

    pub fn insert(&self, key: &str, value: V) {
        let slot = self.slot(key);
        // A computation in flight for this key wins
        let Ok(mut entry) = slot.try_lock() else {
            return;
        };
        *entry = Some(CacheEntry {
            value,
            expires_at: Instant::now() + self.ttl,
        });
    }

    pub fn invalidate(&self, key: &str) {
        self.slots().remove(key);
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots();
        let before = slots.len();
        slots.retain(|_, slot| match slot.try_lock() {
            Ok(entry) => entry.as_ref().is_some_and(|cached| cached.is_live(now)),
            // Computation in flight
            Err(_) => true,
        });
        before - slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn slot(&self, key: &str) -> Slot<V> {
        self.slots()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
            .clone()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot<V>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
