//! Caller-visible reporting of worker events.
//!
//! Failures that never reach the caller of a handler (a background store
//! that could not be written, a cache that could not be deleted, a fetch
//! that produced no response) are reported here instead of being dropped.

use std::sync::Arc;

use crate::error::Error;
use crate::http::{CacheResponse, RequestKey};

/// Why a network response was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The response was an empty network-error response.
    Empty,
    /// The response status was not 200.
    Status(u16),
    /// The response was cross-origin.
    CrossOrigin,
}

/// Trait for receiving worker events.
///
/// All methods have default no-op implementations.
pub trait WorkerObserver: Send + Sync {
    /// Called when install has stored every manifest entry.
    fn on_install_complete(&self, _cache_name: &str, _entries: usize) {}

    /// Called when install fails.
    fn on_install_failed(&self, _cache_name: &str, _error: &Error) {}

    /// Called when a request is answered from a cache.
    fn on_cache_hit(&self, _key: &RequestKey, _response: &CacheResponse) {}

    /// Called when no cache holds the request.
    fn on_cache_miss(&self, _key: &RequestKey) {}

    /// Called when a cache lookup itself fails; the request goes to the network.
    fn on_lookup_error(&self, _key: &RequestKey, _error: &Error) {}

    /// Called when the network request for a miss fails.
    fn on_network_error(&self, _key: &RequestKey, _error: &Error) {}

    /// Called when a network response is not eligible for storing.
    fn on_store_skipped(&self, _key: &RequestKey, _reason: SkipReason) {}

    /// Called when a background store completes.
    fn on_stored(&self, _cache_name: &str, _key: &RequestKey, _bytes: usize) {}

    /// Called when a background store fails to open the cache or write.
    fn on_store_error(&self, _cache_name: &str, _key: &RequestKey, _error: &Error) {}

    /// Called when activation deletes a cache.
    fn on_cache_deleted(&self, _cache_name: &str) {}

    /// Called when activation fails to delete a cache.
    fn on_delete_error(&self, _cache_name: &str, _error: &Error) {}
}

/// An observer that ignores all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoObserver;

impl WorkerObserver for NoObserver {}

/// An observer that writes events to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl WorkerObserver for LogObserver {
    fn on_install_complete(&self, cache_name: &str, entries: usize) {
        log::info!("Install complete: {entries} entries cached in {cache_name}");
    }

    fn on_install_failed(&self, cache_name: &str, error: &Error) {
        log::error!("Install of {cache_name} failed: {error}");
    }

    fn on_cache_hit(&self, key: &RequestKey, response: &CacheResponse) {
        log::debug!("Cache hit: {key} ({} bytes)", response.body.len());
    }

    fn on_cache_miss(&self, key: &RequestKey) {
        log::debug!("Cache miss: {key}");
    }

    fn on_lookup_error(&self, key: &RequestKey, error: &Error) {
        log::warn!("Cache lookup failed for {key}: {error}");
    }

    fn on_network_error(&self, key: &RequestKey, error: &Error) {
        log::warn!("Network request failed for {key}: {error}");
    }

    fn on_store_skipped(&self, key: &RequestKey, reason: SkipReason) {
        log::debug!("Not caching {key}: {reason:?}");
    }

    fn on_stored(&self, cache_name: &str, key: &RequestKey, bytes: usize) {
        log::debug!("Cached {key} in {cache_name} ({bytes} bytes)");
    }

    fn on_store_error(&self, cache_name: &str, key: &RequestKey, error: &Error) {
        log::warn!("Failed to cache {key} in {cache_name}: {error}");
    }

    fn on_cache_deleted(&self, cache_name: &str) {
        log::info!("Deleted obsolete cache {cache_name}");
    }

    fn on_delete_error(&self, cache_name: &str, error: &Error) {
        log::error!("Failed to delete cache {cache_name}: {error}");
    }
}

/// Forwards every event to each wrapped observer in order.
#[derive(Clone, Default)]
pub struct Observers(Vec<Arc<dyn WorkerObserver>>);

impl Observers {
    /// Creates an empty fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an observer.
    #[must_use]
    pub fn with(mut self, observer: Arc<dyn WorkerObserver>) -> Self {
        self.0.push(observer);
        self
    }
}

impl WorkerObserver for Observers {
    fn on_install_complete(&self, cache_name: &str, entries: usize) {
        self.0.iter().for_each(|o| o.on_install_complete(cache_name, entries));
    }

    fn on_install_failed(&self, cache_name: &str, error: &Error) {
        self.0.iter().for_each(|o| o.on_install_failed(cache_name, error));
    }

    fn on_cache_hit(&self, key: &RequestKey, response: &CacheResponse) {
        self.0.iter().for_each(|o| o.on_cache_hit(key, response));
    }

    fn on_cache_miss(&self, key: &RequestKey) {
        self.0.iter().for_each(|o| o.on_cache_miss(key));
    }

    fn on_lookup_error(&self, key: &RequestKey, error: &Error) {
        self.0.iter().for_each(|o| o.on_lookup_error(key, error));
    }

    fn on_network_error(&self, key: &RequestKey, error: &Error) {
        self.0.iter().for_each(|o| o.on_network_error(key, error));
    }

    fn on_store_skipped(&self, key: &RequestKey, reason: SkipReason) {
        self.0.iter().for_each(|o| o.on_store_skipped(key, reason));
    }

    fn on_stored(&self, cache_name: &str, key: &RequestKey, bytes: usize) {
        self.0.iter().for_each(|o| o.on_stored(cache_name, key, bytes));
    }

    fn on_store_error(&self, cache_name: &str, key: &RequestKey, error: &Error) {
        self.0.iter().for_each(|o| o.on_store_error(cache_name, key, error));
    }

    fn on_cache_deleted(&self, cache_name: &str) {
        self.0.iter().for_each(|o| o.on_cache_deleted(cache_name));
    }

    fn on_delete_error(&self, cache_name: &str, error: &Error) {
        self.0.iter().for_each(|o| o.on_delete_error(cache_name, error));
    }
}
