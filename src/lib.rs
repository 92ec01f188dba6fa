//! offline-cache - A cache-first offline asset worker.
//!
//! The worker pre-caches a fixed set of assets on install, answers requests
//! from its caches before falling back to the network (storing successful
//! same-origin responses as it goes), and deletes caches that are no longer
//! allow-listed on activation.
//!
//! # Example
//!
//! ```no_run
//! use offline_cache::{
//!     MemoryCacheStorage, NetworkConfig, ReqwestNetwork, Worker, WorkerConfig, WorkerHost,
//!     CacheRequest,
//! };
//!
//! # async fn example() -> offline_cache::Result<()> {
//! let network = ReqwestNetwork::new(&NetworkConfig::default())?;
//! let worker = Worker::new(WorkerConfig::default(), MemoryCacheStorage::new(), network);
//! let host = WorkerHost::new(worker);
//!
//! // Install the asset manifest, then take control of requests
//! host.start().await?;
//!
//! let outcome = host.fetch(CacheRequest::get("/assets/fonts/iransans.ttf")).await;
//! assert!(outcome.is_cached());
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod error;
pub mod fs;
pub mod host;
pub mod http;
pub mod network;
pub mod observer;
#[cfg(feature = "server")]
pub mod server;
pub mod stats;
pub mod storage;
pub mod worker;

// Re-export main types for convenience
pub use config::{
    AppConfig, NetworkConfig, ServerConfig, StorageBackend, StorageConfig, WorkerConfig,
};
pub use error::{Error, Result};
pub use fs::{FileSystem, TokioFileSystem};
pub use host::{EventResult, LifecycleEvent, LifecycleState, WorkerHost};
pub use http::{CacheRequest, CacheResponse, Origin, RequestKey, ResponseType};
pub use network::{Network, ReqwestNetwork};
pub use observer::{LogObserver, NoObserver, Observers, SkipReason, WorkerObserver};
pub use stats::{StatsObserver, WorkerStats};
pub use storage::{Cache, CacheStorage, DiskCacheStorage, MemoryCacheStorage};
pub use worker::{ActivateReport, Caching, FetchOutcome, InstallReport, Worker};
