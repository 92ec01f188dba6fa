//! Worker statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::Error;
use crate::http::{CacheResponse, RequestKey};
use crate::observer::{SkipReason, WorkerObserver};

/// Point-in-time worker statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Requests answered from a cache.
    pub hits: u64,
    /// Requests that missed every cache.
    pub misses: u64,
    /// Bytes served from caches.
    pub bytes_from_cache: u64,
    /// Network responses stored in the primary cache.
    pub stored: u64,
    /// Network responses not eligible for storing.
    pub skipped: u64,
    /// Background stores that failed.
    pub store_errors: u64,
    /// Misses whose network request failed, leaving the caller without a response.
    pub network_errors: u64,
    /// Caches removed by activation.
    pub caches_deleted: u64,
    /// Cache deletions that failed.
    pub delete_errors: u64,
    /// Seconds since the counters started.
    pub uptime_secs: u64,
}

impl WorkerStats {
    /// Fraction of lookups answered from a cache, or 0 with no lookups yet.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        }
    }
}

/// Observer that accumulates [`WorkerStats`] with atomic counters.
#[derive(Debug)]
pub struct StatsObserver {
    start_time: Instant,
    hits: AtomicU64,
    misses: AtomicU64,
    bytes_from_cache: AtomicU64,
    stored: AtomicU64,
    skipped: AtomicU64,
    store_errors: AtomicU64,
    network_errors: AtomicU64,
    caches_deleted: AtomicU64,
    delete_errors: AtomicU64,
}

impl Default for StatsObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsObserver {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            bytes_from_cache: AtomicU64::new(0),
            stored: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
            network_errors: AtomicU64::new(0),
            caches_deleted: AtomicU64::new(0),
            delete_errors: AtomicU64::new(0),
        }
    }

    /// Time since the counters started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Reads every counter.
    #[must_use]
    pub fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bytes_from_cache: self.bytes_from_cache.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            network_errors: self.network_errors.load(Ordering::Relaxed),
            caches_deleted: self.caches_deleted.load(Ordering::Relaxed),
            delete_errors: self.delete_errors.load(Ordering::Relaxed),
            uptime_secs: self.elapsed().as_secs(),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl WorkerObserver for StatsObserver {
    fn on_cache_hit(&self, _key: &RequestKey, response: &CacheResponse) {
        bump(&self.hits);
        self.bytes_from_cache
            .fetch_add(response.body.len() as u64, Ordering::Relaxed);
    }

    fn on_cache_miss(&self, _key: &RequestKey) {
        bump(&self.misses);
    }

    fn on_network_error(&self, _key: &RequestKey, _error: &Error) {
        bump(&self.network_errors);
    }

    fn on_store_skipped(&self, _key: &RequestKey, _reason: SkipReason) {
        bump(&self.skipped);
    }

    fn on_stored(&self, _cache_name: &str, _key: &RequestKey, _bytes: usize) {
        bump(&self.stored);
    }

    fn on_store_error(&self, _cache_name: &str, _key: &RequestKey, _error: &Error) {
        bump(&self.store_errors);
    }

    fn on_cache_deleted(&self, _cache_name: &str) {
        bump(&self.caches_deleted);
    }

    fn on_delete_error(&self, _cache_name: &str, _error: &Error) {
        bump(&self.delete_errors);
    }
}
