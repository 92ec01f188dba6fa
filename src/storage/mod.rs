//! Named cache storage: the store shared by the install, fetch and activate
//! handlers.
//!
//! A [`CacheStorage`] maps cache names to [`Cache`] instances, and each cache
//! maps a [`RequestKey`] to a stored [`CacheResponse`]. Caches are created on
//! first [`open`](CacheStorage::open) and destroyed on
//! [`delete`](CacheStorage::delete).

mod disk;
mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::http::{CacheResponse, RequestKey};

pub use disk::{DiskCache, DiskCacheStorage};
pub use memory::{MemoryCache, MemoryCacheStorage};

/// A single named cache.
///
/// Every operation is atomic per call; concurrent writes to the same key
/// resolve as last write wins.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Name this cache was opened under.
    fn name(&self) -> &str;

    /// Looks up a stored response by request identity.
    async fn match_request(&self, key: &RequestKey) -> Result<Option<CacheResponse>>;

    /// Stores a response, replacing any previous entry for `key`.
    async fn put(&self, key: RequestKey, response: CacheResponse) -> Result<()>;

    /// Stores every entry or none of them.
    async fn put_all(&self, entries: Vec<(RequestKey, CacheResponse)>) -> Result<()>;

    /// Lists the keys of all stored entries.
    async fn keys(&self) -> Result<Vec<RequestKey>>;
}

/// The set of named caches.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Cache handle type returned by [`open`](Self::open).
    type Cache: Cache + 'static;

    /// Opens the named cache, creating it if it does not exist.
    async fn open(&self, name: &str) -> Result<Self::Cache>;

    /// Returns true if a cache with this name exists.
    async fn has(&self, name: &str) -> Result<bool>;

    /// Deletes the named cache and its entries. Returns true if it existed.
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Lists cache names in creation order.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Looks `key` up across all caches in creation order; first match wins.
    async fn match_request(&self, key: &RequestKey) -> Result<Option<CacheResponse>>;
}
