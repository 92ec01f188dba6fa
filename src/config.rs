//! Configuration for the worker, its network adapter, storage and proxy server.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Name of the primary cache populated on install.
pub const CACHE_NAME: &str = "board-web-v1";

/// Assets cached unconditionally on install.
pub const URLS_TO_CACHE: &[&str] = &[
    "/assets/lib/css/hint/hint.base.min.css",
    "/assets/fonts/iransans.ttf",
];

/// Cache names that survive activation.
pub const CACHE_ALLOW_LIST: &[&str] = &[CACHE_NAME];

/// Immutable worker configuration injected into each handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Primary cache used by install and the opportunistic fetch store.
    pub cache_name: String,
    /// Asset manifest fetched and cached on install.
    pub urls_to_cache: Vec<String>,
    /// Caches kept on activation; everything else is deleted.
    pub cache_allow_list: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_name: CACHE_NAME.to_string(),
            urls_to_cache: URLS_TO_CACHE.iter().map(ToString::to_string).collect(),
            cache_allow_list: CACHE_ALLOW_LIST.iter().map(ToString::to_string).collect(),
        }
    }
}

impl WorkerConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the primary cache name.
    #[must_use]
    pub fn with_cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache_name = name.into();
        self
    }

    /// Replaces the install manifest.
    #[must_use]
    pub fn with_urls_to_cache<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.urls_to_cache = urls.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the activation allow-list.
    #[must_use]
    pub fn with_allow_list<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cache_allow_list = names.into_iter().map(Into::into).collect();
        self
    }

    /// Returns true if a cache with this name survives activation.
    #[must_use]
    pub fn is_allowed(&self, cache_name: &str) -> bool {
        self.cache_allow_list.iter().any(|n| n == cache_name)
    }
}

/// Network adapter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Origin the worker is installed on. Relative URLs resolve against it and
    /// responses from it are classified as same-origin.
    pub origin: String,
    /// Seconds an idle pooled connection is kept open.
    pub pool_idle_timeout_secs: u64,
    /// Maximum idle pooled connections per host.
    pub pool_max_idle_per_host: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost:8080".to_string(),
            pool_idle_timeout_secs: 60,
            pool_max_idle_per_host: 8,
        }
    }
}

impl NetworkConfig {
    /// Sets the origin.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }
}

/// Proxy server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9724,
        }
    }
}

/// Which cache storage backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-lifetime, in-memory storage.
    Memory,
    /// Persistent storage under [`StorageConfig::dir`].
    Disk,
}

/// Cache storage configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage backend.
    pub backend: StorageBackend,
    /// Root directory of the disk backend.
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            backend: StorageBackend::Disk,
            dir: data_dir.join("offline-cache"),
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Worker configuration.
    pub worker: WorkerConfig,
    /// Network configuration.
    pub network: NetworkConfig,
    /// Server configuration.
    pub server: ServerConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
}

impl AppConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses configuration from a TOML string. Missing sections use defaults.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if the TOML is malformed.
    pub fn from_toml(text: &str) -> crate::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&text)?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Loads configuration from `path` if given, otherwise from defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a given file cannot be read or parsed.
    pub fn load_or_default(path: Option<&Path>) -> crate::Result<Self> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_worker_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.cache_name, "board-web-v1");
        assert_eq!(
            config.urls_to_cache,
            vec![
                "/assets/lib/css/hint/hint.base.min.css",
                "/assets/fonts/iransans.ttf"
            ]
        );
        assert_eq!(config.cache_allow_list, vec!["board-web-v1"]);
    }

    #[test]
    fn worker_config_builder_pattern() {
        let config = WorkerConfig::new()
            .with_cache_name("board-web-v2")
            .with_urls_to_cache(["/a.css", "/b.ttf"])
            .with_allow_list(["board-web-v2", "fonts-v1"]);

        assert_eq!(config.cache_name, "board-web-v2");
        assert_eq!(config.urls_to_cache, vec!["/a.css", "/b.ttf"]);
        assert!(config.is_allowed("fonts-v1"));
        assert!(!config.is_allowed("board-web-v1"));
    }

    #[test]
    fn default_server_and_network_config() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "127.0.0.1");
        assert_eq!(server.port, 9724);

        let network = NetworkConfig::default();
        assert_eq!(network.pool_idle_timeout_secs, 60);
        assert_eq!(network.pool_max_idle_per_host, 8);
    }

    #[test]
    fn default_storage_config_is_disk() {
        let config = StorageConfig::default();
        assert_eq!(config.backend, StorageBackend::Disk);
        assert!(config.dir.to_string_lossy().contains("offline-cache"));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
[worker]
cache_name = "board-web-v2"
cache_allow_list = ["board-web-v2"]

[network]
origin = "https://board.example"

[storage]
backend = "memory"
"#,
        )
        .unwrap();

        assert_eq!(config.worker.cache_name, "board-web-v2");
        assert_eq!(config.worker.urls_to_cache.len(), 2);
        assert_eq!(config.network.origin, "https://board.example");
        assert_eq!(config.network.pool_max_idle_per_host, 8);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.server.port, 9724);
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let err = AppConfig::from_toml("[worker\ncache_name = 1").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn config_serializes_to_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized = AppConfig::from_toml(&toml_str).unwrap();
        assert_eq!(deserialized, config);
    }

    #[test]
    fn load_or_default_without_path() {
        let config = AppConfig::load_or_default(None).unwrap();
        assert_eq!(config.worker.cache_name, CACHE_NAME);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("offline-cache.toml");
        std::fs::write(&path, "[server]\nport = 8000\n").unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.server.port, 8000);
    }
}
