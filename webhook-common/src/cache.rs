//! The tracking cache (component B): a bounded, TTL'd, LRU-evicting
//! coalescer for polling pressure across webhooks watching the same
//! `(carrierId, trackingNumber)` shipment. It is deliberately coarse — a
//! coalescer, not a source of truth — and is never consulted by delivery.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::carrier::TrackInfo;

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_SIZE: usize = 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct CacheEntry {
    info: TrackInfo,
    inserted_at: Instant,
}

struct Inner {
    entries: HashMap<(String, String), CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Shared in-process map. Reads and writes are serialized behind a single
/// mutex, with the eviction scan running under the same critical section
/// — the map is small and accesses are brief, so a coarse lock is simpler
/// and cheap enough.
pub struct TrackingCache {
    inner: Mutex<Inner>,
    ttl: Duration,
    max_size: usize,
}

impl TrackingCache {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            ttl,
            max_size,
        }
    }

    fn key(carrier_id: &str, tracking_number: &str) -> (String, String) {
        (carrier_id.to_owned(), tracking_number.to_owned())
    }

    /// Returns the cached `TrackInfo` if present and no older than the
    /// configured TTL. A stale entry is deleted and treated as a miss
    /// (spec.md C1).
    pub fn get(&self, carrier_id: &str, tracking_number: &str) -> Option<TrackInfo> {
        let key = Self::key(carrier_id, tracking_number);
        let mut inner = self.inner.lock().unwrap();

        let is_fresh = inner
            .entries
            .get(&key)
            .is_some_and(|entry| entry.inserted_at.elapsed() <= self.ttl);

        if is_fresh {
            inner.hits += 1;
            inner.entries.get(&key).map(|entry| entry.info.clone())
        } else {
            inner.entries.remove(&key);
            inner.misses += 1;
            None
        }
    }

    /// Inserts or replaces an entry, evicting the single oldest entry (by
    /// insertion timestamp) if the cache would otherwise exceed `max_size`
    /// (spec.md C2).
    pub fn set(&self, carrier_id: &str, tracking_number: &str, info: TrackInfo) {
        let key = Self::key(carrier_id, tracking_number);
        let mut inner = self.inner.lock().unwrap();

        inner.entries.insert(
            key,
            CacheEntry {
                info,
                inserted_at: Instant::now(),
            },
        );

        if inner.entries.len() > self.max_size {
            if let Some(oldest_key) = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(key, _)| key.clone())
            {
                inner.entries.remove(&oldest_key);
                inner.evictions += 1;
            }
        }
    }

    pub fn invalidate(&self, carrier_id: &str, tracking_number: &str) {
        let key = Self::key(carrier_id, tracking_number);
        self.inner.lock().unwrap().entries.remove(&key);
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().entries.clear();
    }

    /// Evicts every entry older than the TTL. Called by the cleanup worker
    /// on its own schedule as a belt-and-suspenders sweep; `get` already
    /// evicts lazily on read.
    pub fn cleanup(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let ttl = self.ttl;
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, entry| entry.inserted_at.elapsed() <= ttl);
        let removed = before - inner.entries.len();
        inner.evictions += removed as u64;
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            size: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }
}

impl Default for TrackingCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_SIZE)
    }
}
