//! The install, fetch and activate handlers.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use tokio_util::task::TaskTracker;

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::http::{CacheRequest, CacheResponse, RequestKey, ResponseType};
use crate::network::Network;
use crate::observer::{NoObserver, SkipReason, WorkerObserver};
use crate::storage::{Cache, CacheStorage};

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    /// Cache the manifest was stored in.
    pub cache_name: String,
    /// Number of entries stored.
    pub entries: usize,
    /// Total body bytes stored.
    pub bytes: usize,
}

/// Result of an activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateReport {
    /// Allow-listed caches left untouched.
    pub kept: Vec<String>,
    /// Caches deleted.
    pub deleted: Vec<String>,
    /// Caches whose deletion failed.
    pub failed: Vec<String>,
}

/// What happened to a network response after it was returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caching {
    /// A copy is being written to the primary cache in the background.
    Scheduled,
    /// The response was not eligible for storing.
    Skipped(SkipReason),
    /// The worker was not controlling requests; the cache was not consulted.
    Bypassed,
}

/// Outcome of the fetch handler.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Answered from a cache without touching the network.
    Cached(CacheResponse),
    /// Answered from the network.
    Network {
        /// The response for the caller.
        response: CacheResponse,
        /// Whether a copy is being stored.
        caching: Caching,
    },
    /// The network request failed and nothing answers the request. The
    /// embedding host decides what the caller sees.
    NoResponse(Error),
}

impl FetchOutcome {
    /// The response for the caller, if there is one.
    #[must_use]
    pub const fn response(&self) -> Option<&CacheResponse> {
        match self {
            Self::Cached(response) | Self::Network { response, .. } => Some(response),
            Self::NoResponse(_) => None,
        }
    }

    /// Consumes the outcome, returning the response for the caller.
    #[must_use]
    pub fn into_response(self) -> Option<CacheResponse> {
        match self {
            Self::Cached(response) | Self::Network { response, .. } => Some(response),
            Self::NoResponse(_) => None,
        }
    }

    /// True if the response came from a cache.
    #[must_use]
    pub const fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(_))
    }
}

/// Offline asset cache worker: cache first, then network.
pub struct Worker<S, N> {
    config: Arc<WorkerConfig>,
    storage: Arc<S>,
    network: Arc<N>,
    observer: Arc<dyn WorkerObserver>,
    pending: TaskTracker,
}

impl<S, N> Worker<S, N>
where
    S: CacheStorage + 'static,
    N: Network + 'static,
{
    /// Creates a worker with no observer.
    #[must_use]
    pub fn new(config: WorkerConfig, storage: S, network: N) -> Self {
        Self {
            config: Arc::new(config),
            storage: Arc::new(storage),
            network: Arc::new(network),
            observer: Arc::new(NoObserver),
            pending: TaskTracker::new(),
        }
    }

    /// Replaces the observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn WorkerObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Returns the worker configuration.
    #[must_use]
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Returns the cache storage.
    #[must_use]
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Returns the network adapter.
    #[must_use]
    pub fn network(&self) -> &N {
        &self.network
    }

    /// Cache identity of `request`, resolved against the network's origin.
    fn key_of(&self, request: &CacheRequest) -> RequestKey {
        request.key_for(self.network.origin())
    }

    /// Number of background stores still running.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.pending.len()
    }

    /// Opens the primary cache and stores every manifest asset in it.
    ///
    /// All assets are fetched first; the cache is only written if every
    /// fetch succeeded with a 2xx status, so a failed install stores nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Install`] naming the first asset that failed, or a
    /// storage error if the cache cannot be opened or written.
    pub async fn install(&self) -> Result<InstallReport> {
        let cache_name = &self.config.cache_name;
        let result = self.try_install().await;
        match &result {
            Ok(report) => self.observer.on_install_complete(cache_name, report.entries),
            Err(e) => self.observer.on_install_failed(cache_name, e),
        }
        result
    }

    async fn try_install(&self) -> Result<InstallReport> {
        let urls = &self.config.urls_to_cache;
        let mut seen = HashSet::with_capacity(urls.len());
        if let Some(dup) = urls.iter().find(|url| !seen.insert(url.as_str())) {
            return Err(Error::Install {
                url: dup.clone(),
                reason: "duplicate manifest entry".to_string(),
            });
        }

        let cache = self.storage.open(&self.config.cache_name).await?;

        let fetches = urls.iter().map(|url| async move {
            let request = CacheRequest::get(url.as_str());
            let key = self.key_of(&request);
            let response = self.network.fetch(request).await.map_err(|e| Error::Install {
                url: url.clone(),
                reason: e.to_string(),
            })?;
            if !response.is_ok() {
                return Err(Error::Install {
                    url: url.clone(),
                    reason: format!("status {}", response.status),
                });
            }
            Ok((key, response))
        });
        let entries = try_join_all(fetches).await?;

        let report = InstallReport {
            cache_name: cache.name().to_string(),
            entries: entries.len(),
            bytes: entries.iter().map(|(_, r)| r.body.len()).sum(),
        };
        cache.put_all(entries).await?;
        Ok(report)
    }

    /// Answers a request from the caches, falling back to the network.
    ///
    /// A storable network response is returned immediately while a copy is
    /// written to the primary cache in the background; see
    /// [`wait_until_idle`](Self::wait_until_idle).
    pub async fn fetch(&self, request: CacheRequest) -> FetchOutcome {
        let key = self.key_of(&request);

        match self.storage.match_request(&key).await {
            Ok(Some(response)) => {
                self.observer.on_cache_hit(&key, &response);
                return FetchOutcome::Cached(response);
            }
            Ok(None) => self.observer.on_cache_miss(&key),
            // A broken lookup is treated as a miss.
            Err(e) => {
                self.observer.on_lookup_error(&key, &e);
                self.observer.on_cache_miss(&key);
            }
        }

        let (to_network, original) = request.snapshot();
        let response = match self.network.fetch(to_network).await {
            Ok(response) => response,
            Err(e) => {
                self.observer.on_network_error(&key, &e);
                return FetchOutcome::NoResponse(e);
            }
        };

        if let Some(reason) = skip_reason(&response) {
            self.observer.on_store_skipped(&key, reason);
            return FetchOutcome::Network {
                response,
                caching: Caching::Skipped(reason),
            };
        }

        let (to_cache, to_caller) = response.snapshot();
        self.store_in_background(self.key_of(&original), to_cache);
        FetchOutcome::Network {
            response: to_caller,
            caching: Caching::Scheduled,
        }
    }

    fn store_in_background(&self, key: RequestKey, response: CacheResponse) {
        let storage = Arc::clone(&self.storage);
        let observer = Arc::clone(&self.observer);
        let cache_name = self.config.cache_name.clone();

        self.pending.spawn(async move {
            let bytes = response.body.len();
            let result = match storage.open(&cache_name).await {
                Ok(cache) => cache.put(key.clone(), response).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => observer.on_stored(&cache_name, &key, bytes),
                Err(e) => observer.on_store_error(&cache_name, &key, &e),
            }
        });
    }

    /// Waits until every background store has finished.
    ///
    /// Meant for a single caller at a time, such as a host shutting down.
    pub async fn wait_until_idle(&self) {
        self.pending.close();
        self.pending.wait().await;
        self.pending.reopen();
    }

    /// Deletes every cache whose name is not on the allow-list.
    ///
    /// Deletions run concurrently and all of them finish before this
    /// returns. A failed deletion is reported to the observer and listed in
    /// [`ActivateReport::failed`] without failing the activation.
    ///
    /// # Errors
    ///
    /// Returns an error only if the cache names cannot be listed.
    pub async fn activate(&self) -> Result<ActivateReport> {
        let (kept, obsolete): (Vec<String>, Vec<String>) = self
            .storage
            .keys()
            .await?
            .into_iter()
            .partition(|name| self.config.is_allowed(name));

        let results = join_all(
            obsolete
                .iter()
                .map(|name| async move { (name, self.storage.delete(name).await) }),
        )
        .await;

        let mut report = ActivateReport {
            kept,
            ..ActivateReport::default()
        };
        for (name, result) in results {
            match result {
                Ok(_) => {
                    self.observer.on_cache_deleted(name);
                    report.deleted.push(name.clone());
                }
                Err(e) => {
                    self.observer.on_delete_error(name, &e);
                    report.failed.push(name.clone());
                }
            }
        }
        Ok(report)
    }
}

/// Returns why a response must not be stored, or `None` if it may be.
fn skip_reason(response: &CacheResponse) -> Option<SkipReason> {
    match response.kind {
        _ if response.is_storable() => None,
        ResponseType::Error => Some(SkipReason::Empty),
        ResponseType::Cors | ResponseType::Opaque => Some(SkipReason::CrossOrigin),
        ResponseType::Basic => Some(SkipReason::Status(response.status)),
    }
}
