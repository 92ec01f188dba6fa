//! In-memory cache storage, alive for the lifetime of the process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Cache, CacheStorage};
use crate::error::Result;
use crate::http::{CacheResponse, RequestKey};

type Entries = Arc<RwLock<HashMap<RequestKey, CacheResponse>>>;

/// Cache storage held entirely in memory.
///
/// Clones share the same underlying store.
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheStorage {
    caches: Arc<RwLock<Vec<(String, Entries)>>>,
}

impl MemoryCacheStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn entries(&self, name: &str) -> Option<Entries> {
        self.caches
            .read()
            .await
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, entries)| Arc::clone(entries))
    }
}

/// Handle to one in-memory cache.
///
/// A handle to a deleted cache keeps working but is detached from the store.
#[derive(Debug, Clone)]
pub struct MemoryCache {
    name: String,
    entries: Entries,
}

#[async_trait]
impl Cache for MemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn match_request(&self, key: &RequestKey) -> Result<Option<CacheResponse>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: RequestKey, response: CacheResponse) -> Result<()> {
        self.entries.write().await.insert(key, response);
        Ok(())
    }

    async fn put_all(&self, entries: Vec<(RequestKey, CacheResponse)>) -> Result<()> {
        self.entries.write().await.extend(entries);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<RequestKey>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    type Cache = MemoryCache;

    async fn open(&self, name: &str) -> Result<MemoryCache> {
        let mut caches = self.caches.write().await;
        let entries = if let Some((_, entries)) = caches.iter().find(|(n, _)| n == name) {
            Arc::clone(entries)
        } else {
            let entries = Entries::default();
            caches.push((name.to_string(), Arc::clone(&entries)));
            entries
        };
        Ok(MemoryCache {
            name: name.to_string(),
            entries,
        })
    }

    async fn has(&self, name: &str) -> Result<bool> {
        Ok(self.entries(name).await.is_some())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let mut caches = self.caches.write().await;
        let before = caches.len();
        caches.retain(|(n, _)| n != name);
        Ok(caches.len() != before)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .caches
            .read()
            .await
            .iter()
            .map(|(n, _)| n.clone())
            .collect())
    }

    async fn match_request(&self, key: &RequestKey) -> Result<Option<CacheResponse>> {
        let caches: Vec<Entries> = self
            .caches
            .read()
            .await
            .iter()
            .map(|(_, entries)| Arc::clone(entries))
            .collect();
        for entries in caches {
            if let Some(response) = entries.read().await.get(key) {
                return Ok(Some(response.clone()));
            }
        }
        Ok(None)
    }
}
