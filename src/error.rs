//! Error types for the offline-cache library.

use thiserror::Error;

/// Errors that can occur during cache and worker operations.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP transport error from the network adapter.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error from a storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed.
    #[error("Invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    /// Entry metadata or the storage index could not be (de)serialized.
    #[error("Metadata error: {0}")]
    Json(#[from] serde_json::Error),

    /// A request URL could not be parsed or resolved against the origin.
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A manifest asset could not be cached, failing the whole install step.
    #[error("Install failed for {url}: {reason}")]
    Install {
        /// Manifest URL that failed.
        url: String,
        /// Underlying failure.
        reason: String,
    },

    /// A lifecycle event arrived in a state that does not accept it.
    #[error("Invalid worker state: expected {expected}, got {actual}")]
    InvalidState {
        /// State the event requires.
        expected: String,
        /// State the worker was in.
        actual: String,
    },

    /// A cache storage operation failed.
    #[error("Cache error: {0}")]
    Cache(String),

    /// The proxy server could not be started.
    #[error("Server error: {0}")]
    Server(String),
}

impl Error {
    /// Builds an [`Error::InvalidUrl`] from any displayable reason.
    pub fn invalid_url(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}

/// A specialized `Result` type for offline-cache operations.
pub type Result<T> = std::result::Result<T, Error>;
