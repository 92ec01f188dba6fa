//! Lifecycle host: delivers install, activate and fetch events to a worker in
//! the order install → waiting → activate.

use std::fmt;

use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::http::CacheRequest;
use crate::network::Network;
use crate::storage::{Cache, CacheStorage};
use crate::worker::{ActivateReport, Caching, FetchOutcome, InstallReport, Worker};

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Registered, no event delivered yet.
    Parsed,
    /// Install handler running.
    Installing,
    /// Installed and waiting to activate.
    Installed,
    /// Activate handler running.
    Activating,
    /// Active and controlling fetches.
    Activated,
    /// Install failed with no earlier install to fall back on, or the worker
    /// was shut down.
    Redundant,
}

impl LifecycleState {
    /// Only an activated worker intercepts fetches.
    #[must_use]
    pub const fn can_intercept_fetch(self) -> bool {
        matches!(self, Self::Activated)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parsed => write!(f, "parsed"),
            Self::Installing => write!(f, "installing"),
            Self::Installed => write!(f, "installed"),
            Self::Activating => write!(f, "activating"),
            Self::Activated => write!(f, "activated"),
            Self::Redundant => write!(f, "redundant"),
        }
    }
}

/// An event delivered by the host.
#[derive(Debug)]
pub enum LifecycleEvent {
    /// Populate the primary cache.
    Install,
    /// Retire obsolete caches.
    Activate,
    /// Answer a resource request.
    Fetch(CacheRequest),
}

/// Result of handling a [`LifecycleEvent`].
#[derive(Debug)]
pub enum EventResult {
    /// Install finished.
    Installed(InstallReport),
    /// Activate finished.
    Activated(ActivateReport),
    /// Fetch finished.
    Fetched(FetchOutcome),
}

/// Drives a [`Worker`] through its lifecycle.
pub struct WorkerHost<S, N> {
    worker: Worker<S, N>,
    state: watch::Sender<LifecycleState>,
}

impl<S, N> WorkerHost<S, N>
where
    S: CacheStorage + 'static,
    N: Network + 'static,
{
    /// Registers a worker.
    #[must_use]
    pub fn new(worker: Worker<S, N>) -> Self {
        let (state, _) = watch::channel(LifecycleState::Parsed);
        Self { worker, state }
    }

    /// Returns the hosted worker.
    #[must_use]
    pub const fn worker(&self) -> &Worker<S, N> {
        &self.worker
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Subscribes to lifecycle state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    fn transition(&self, next: LifecycleState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            log::debug!("Worker state {previous} -> {next}");
        }
    }

    fn expect_state(&self, expected: LifecycleState) -> Result<()> {
        let actual = self.state();
        if actual == expected {
            Ok(())
        } else {
            Err(Error::InvalidState {
                expected: expected.to_string(),
                actual: actual.to_string(),
            })
        }
    }

    /// Handles one event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] for an install outside `Parsed` or an
    /// activate outside `Installed`, and propagates handler errors. A failed
    /// install leaves the worker `Redundant` unless an earlier install left a
    /// populated primary cache, in which case it stays `Activated`.
    pub async fn dispatch(&self, event: LifecycleEvent) -> Result<EventResult> {
        match event {
            LifecycleEvent::Install => self.install().await.map(EventResult::Installed),
            LifecycleEvent::Activate => self.activate().await.map(EventResult::Activated),
            LifecycleEvent::Fetch(request) => Ok(EventResult::Fetched(self.fetch(request).await)),
        }
    }

    async fn install(&self) -> Result<InstallReport> {
        self.expect_state(LifecycleState::Parsed)?;
        let prior = self.has_prior_install().await;
        self.transition(LifecycleState::Installing);
        match self.worker.install().await {
            Ok(report) => {
                self.transition(LifecycleState::Installed);
                Ok(report)
            }
            // The previous install stays in control with the caches it left.
            Err(e) if prior => {
                log::warn!("Install failed, serving from existing caches: {e}");
                self.transition(LifecycleState::Activated);
                Err(e)
            }
            Err(e) => {
                self.transition(LifecycleState::Redundant);
                Err(e)
            }
        }
    }

    /// True if an earlier run left a populated primary cache behind.
    async fn has_prior_install(&self) -> bool {
        let storage = self.worker.storage();
        let name = &self.worker.config().cache_name;
        match storage.has(name).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                log::warn!("Could not check for cache {name}: {e}");
                return false;
            }
        }
        match storage.open(name).await {
            Ok(cache) => cache.keys().await.is_ok_and(|keys| !keys.is_empty()),
            Err(_) => false,
        }
    }

    async fn activate(&self) -> Result<ActivateReport> {
        self.expect_state(LifecycleState::Installed)?;
        self.transition(LifecycleState::Activating);
        // An activate handler failure does not stop the worker from taking control.
        let result = self.worker.activate().await;
        self.transition(LifecycleState::Activated);
        result
    }

    /// Answers a request. Before activation the worker does not control
    /// requests and they go straight to the network.
    pub async fn fetch(&self, request: CacheRequest) -> FetchOutcome {
        if self.state().can_intercept_fetch() {
            return self.worker.fetch(request).await;
        }
        match self.worker.network().fetch(request).await {
            Ok(response) => FetchOutcome::Network {
                response,
                caching: Caching::Bypassed,
            },
            Err(e) => FetchOutcome::NoResponse(e),
        }
    }

    /// Installs then activates the worker.
    ///
    /// # Errors
    ///
    /// Returns the install error or the activate error. After a failed
    /// install the worker is `Activated` if an earlier install left a
    /// populated primary cache, and `Redundant` otherwise. After a failed
    /// activate it is still `Activated`.
    pub async fn start(&self) -> Result<(InstallReport, ActivateReport)> {
        let installed = self.install().await?;
        let activated = self.activate().await?;
        Ok((installed, activated))
    }

    /// Waits for pending background stores and retires the worker.
    pub async fn shutdown(&self) {
        self.worker.wait_until_idle().await;
        self.transition(LifecycleState::Redundant);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::http::{CacheResponse, RequestKey};
    use crate::storage::{DiskCacheStorage, MemoryCacheStorage};

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    /// Serves every URL with the same body, or fails everything.
    struct StaticNetwork {
        fail: bool,
        calls: AtomicUsize,
    }

    impl StaticNetwork {
        fn up() -> Self {
            Self {
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn down() -> Self {
            Self {
                fail: true,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Network for StaticNetwork {
        async fn fetch(&self, request: CacheRequest) -> Result<CacheResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Cache(format!("offline: {}", request.url)));
            }
            Ok(CacheResponse::new(200, format!("network:{}", request.url)))
        }
    }

    fn host(network: StaticNetwork) -> (MemoryCacheStorage, WorkerHost<MemoryCacheStorage, StaticNetwork>) {
        let storage = MemoryCacheStorage::new();
        let config = WorkerConfig::new().with_urls_to_cache(["/a.css", "/b.ttf"]);
        let worker = Worker::new(config, storage.clone(), network);
        (storage, WorkerHost::new(worker))
    }

    #[test]
    fn only_activated_intercepts() {
        assert!(LifecycleState::Activated.can_intercept_fetch());
        assert!(!LifecycleState::Installed.can_intercept_fetch());
        assert!(!LifecycleState::Redundant.can_intercept_fetch());
        assert_eq!(LifecycleState::Installing.to_string(), "installing");
    }

    #[tokio::test]
    async fn start_installs_then_activates() {
        let (storage, host) = host(StaticNetwork::up());
        storage.open("board-web-v0").await.unwrap();
        let mut states = host.subscribe();

        let (installed, activated) = host.start().await.unwrap();

        assert_eq!(installed.entries, 2);
        assert_eq!(activated.deleted, vec!["board-web-v0"]);
        assert_eq!(host.state(), LifecycleState::Activated);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), LifecycleState::Activated);
        assert_eq!(storage.keys().await.unwrap(), vec!["board-web-v1"]);
    }

    #[tokio::test]
    async fn failed_install_makes_worker_redundant() {
        let (storage, host) = host(StaticNetwork::down());

        assert!(matches!(host.start().await, Err(Error::Install { .. })));
        assert_eq!(host.state(), LifecycleState::Redundant);

        // A redundant worker can be neither installed nor activated again.
        assert!(matches!(
            host.dispatch(LifecycleEvent::Activate).await,
            Err(Error::InvalidState { .. })
        ));
        assert!(
            storage
                .open("board-web-v1")
                .await
                .unwrap()
                .keys()
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn restart_offline_keeps_serving_installed_assets() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = || WorkerConfig::new().with_urls_to_cache(["/a.css", "/b.ttf"]);

        let online = WorkerHost::new(Worker::new(
            config(),
            DiskCacheStorage::new(dir.path()),
            StaticNetwork::up(),
        ));
        online.start().await.unwrap();
        online.shutdown().await;

        let offline = WorkerHost::new(Worker::new(
            config(),
            DiskCacheStorage::new(dir.path()),
            StaticNetwork::down(),
        ));
        assert!(matches!(offline.start().await, Err(Error::Install { .. })));
        assert_eq!(offline.state(), LifecycleState::Activated);

        let outcome = offline.fetch(CacheRequest::get("/b.ttf")).await;
        assert!(outcome.is_cached());
        assert_eq!(&outcome.into_response().unwrap().body[..], b"network:/b.ttf");
        assert_eq!(
            offline.worker().storage().keys().await.unwrap(),
            vec!["board-web-v1"]
        );
    }

    #[tokio::test]
    async fn failed_install_over_an_empty_cache_is_redundant() {
        let (storage, host) = host(StaticNetwork::down());
        storage.open("board-web-v1").await.unwrap();

        assert!(host.start().await.is_err());
        assert_eq!(host.state(), LifecycleState::Redundant);
    }

    #[tokio::test]
    async fn activate_requires_install() {
        let (_storage, host) = host(StaticNetwork::up());
        let err = host.dispatch(LifecycleEvent::Activate).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid worker state: expected installed, got parsed"
        );
    }

    #[tokio::test]
    async fn fetch_before_activation_bypasses_the_cache() {
        let (storage, host) = host(StaticNetwork::up());
        storage
            .open("board-web-v1")
            .await
            .unwrap()
            .put(RequestKey::get("/a.css"), CacheResponse::new(200, "cached"))
            .await
            .unwrap();

        let result = host
            .dispatch(LifecycleEvent::Fetch(CacheRequest::get("/a.css")))
            .await
            .unwrap();

        match result {
            EventResult::Fetched(FetchOutcome::Network { response, caching }) => {
                assert_eq!(caching, Caching::Bypassed);
                assert_eq!(&response.body[..], b"network:/a.css");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fetch_after_activation_is_cache_first() {
        let (_storage, host) = host(StaticNetwork::up());
        host.start().await.unwrap();
        let calls_after_install = host.worker().network().calls.load(Ordering::SeqCst);

        let outcome = host.fetch(CacheRequest::get("/b.ttf")).await;

        assert!(outcome.is_cached());
        assert_eq!(
            host.worker().network().calls.load(Ordering::SeqCst),
            calls_after_install
        );
    }

    #[tokio::test]
    async fn shutdown_waits_and_retires() {
        let (storage, host) = host(StaticNetwork::up());
        host.start().await.unwrap();
        host.fetch(CacheRequest::get("/late.js")).await;

        host.shutdown().await;

        assert_eq!(host.state(), LifecycleState::Redundant);
        assert!(
            storage
                .match_request(&RequestKey::get("/late.js"))
                .await
                .unwrap()
                .is_some()
        );
    }
}
