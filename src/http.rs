//! Request and response values stored in and served from caches.
//!
//! Bodies are immutable [`Bytes`], so a request or response can be
//! snapshotted into two independent copies before one of them is handed to
//! code that consumes it (the network, a background store).

use std::fmt;

use bytes::Bytes;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identity of a cached entry: method plus URL, treated as an opaque key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    /// Upper-cased request method.
    pub method: String,
    /// Request URL as given by the caller.
    pub url: String,
}

impl RequestKey {
    /// Creates a key, normalising the method to upper case.
    #[must_use]
    pub fn new(method: &str, url: impl Into<String>) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            url: url.into(),
        }
    }

    /// Key for a `GET` of `url`.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// An outgoing resource request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRequest {
    /// Upper-cased request method.
    pub method: String,
    /// Absolute or origin-relative URL.
    pub url: String,
    /// Request headers in arrival order.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Bytes,
}

impl CacheRequest {
    /// Creates a body-less request.
    #[must_use]
    pub fn new(method: &str, url: impl Into<String>) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            url: url.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Creates a `GET` request for `url`.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the cache identity of this request, with the URL as given.
    #[must_use]
    pub fn key(&self) -> RequestKey {
        RequestKey {
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }

    /// Returns the cache identity with the URL resolved against `origin`, so
    /// relative and absolute spellings of one resource share an entry. URLs
    /// that do not resolve are kept as given.
    #[must_use]
    pub fn key_for(&self, origin: Option<&Origin>) -> RequestKey {
        match origin.map(|o| o.resolve(&self.url)) {
            Some(Ok(url)) => RequestKey {
                method: self.method.clone(),
                url: url.to_string(),
            },
            _ => self.key(),
        }
    }

    /// Splits the request into two independent copies.
    #[must_use]
    pub fn snapshot(self) -> (Self, Self) {
        (self.clone(), self)
    }
}

/// Classification of a response relative to the worker's origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// Same-origin response.
    Basic,
    /// Cross-origin response the remote explicitly shared.
    Cors,
    /// Cross-origin response without sharing headers.
    Opaque,
    /// Network error; carries no status or body.
    Error,
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic => write!(f, "basic"),
            Self::Cors => write!(f, "cors"),
            Self::Opaque => write!(f, "opaque"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A response, either fresh from the network or stored in a cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheResponse {
    /// HTTP status code; `0` for network errors.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Bytes,
    /// Origin classification.
    pub kind: ResponseType,
    /// Final URL the response came from, if known.
    pub url: Option<String>,
}

impl CacheResponse {
    /// Creates a same-origin response with the given status and body.
    #[must_use]
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            kind: ResponseType::Basic,
            url: None,
        }
    }

    /// The empty response produced by a failed network fetch.
    #[must_use]
    pub const fn network_error() -> Self {
        Self {
            status: 0,
            headers: Vec::new(),
            body: Bytes::new(),
            kind: ResponseType::Error,
            url: None,
        }
    }

    /// Sets the response type.
    #[must_use]
    pub fn with_kind(mut self, kind: ResponseType) -> Self {
        self.kind = kind;
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Returns the first header value with this name, case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// True for a 2xx status.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// True if the fetch handler may store this response: it is not an empty
    /// network-error response, has status 200, and is same-origin.
    #[must_use]
    pub fn is_storable(&self) -> bool {
        self.kind == ResponseType::Basic && self.status == 200
    }

    /// Splits the response into two independent copies.
    #[must_use]
    pub fn snapshot(self) -> (Self, Self) {
        (self.clone(), self)
    }
}

/// Scheme, host and port of a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    scheme: String,
    host: String,
    port: Option<u16>,
}

impl Origin {
    /// Parses the origin of an absolute URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if `url` is not absolute or has no host.
    pub fn parse(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|e| Error::invalid_url(url, e))?;
        Self::of(&parsed).ok_or_else(|| Error::invalid_url(url, "URL has no host"))
    }

    /// Origin of a parsed URL, or `None` for host-less URLs.
    #[must_use]
    pub fn of(url: &Url) -> Option<Self> {
        Some(Self {
            scheme: url.scheme().to_string(),
            host: url.host_str()?.to_ascii_lowercase(),
            port: url.port_or_known_default(),
        })
    }

    /// Resolves `url` against this origin; absolute URLs pass through.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if the result is not a valid URL.
    pub fn resolve(&self, url: &str) -> Result<Url> {
        let base = Url::parse(&self.to_string()).map_err(|e| Error::invalid_url(url, e))?;
        base.join(url).map_err(|e| Error::invalid_url(url, e))
    }

    /// Classifies a response from `url` relative to this origin.
    #[must_use]
    pub fn classify(&self, url: &Url, shared: bool) -> ResponseType {
        match Self::of(url) {
            Some(other) if other == *self => ResponseType::Basic,
            _ if shared => ResponseType::Cors,
            _ => ResponseType::Opaque,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) if Some(port) != default_port(&self.scheme) => {
                write!(f, "{}://{}:{port}", self.scheme, self.host)
            }
            _ => write!(f, "{}://{}", self.scheme, self.host),
        }
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}
