//! Network access for cache misses and install-time manifest fetches.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;

use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::http::{CacheRequest, CacheResponse, Origin};

/// Sends requests to the network.
///
/// Takes the request by value: a request can be sent once, so callers that
/// still need it afterwards must [`snapshot`](CacheRequest::snapshot) it first.
#[async_trait]
pub trait Network: Send + Sync {
    /// Performs the request and returns the full response.
    async fn fetch(&self, request: CacheRequest) -> Result<CacheResponse>;

    /// Origin relative URLs are resolved against, if there is one. Cache
    /// keys are resolved against it too.
    fn origin(&self) -> Option<&Origin> {
        None
    }
}

/// Builds a pooled HTTP client for origin and asset requests.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialised.
pub fn build_http_client(config: &NetworkConfig) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .tcp_keepalive(Duration::from_secs(30))
        .build()
}

/// [`Network`] implementation backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestNetwork {
    client: reqwest::Client,
    origin: Origin,
}

impl ReqwestNetwork {
    /// Creates a network adapter for the configured origin.
    ///
    /// # Errors
    ///
    /// Returns an error if the origin is not an absolute URL or the HTTP
    /// client cannot be built.
    pub fn new(config: &NetworkConfig) -> Result<Self> {
        Ok(Self::with_client(
            build_http_client(config)?,
            Origin::parse(&config.origin)?,
        ))
    }

    /// Creates a network adapter around an existing client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client, origin: Origin) -> Self {
        Self { client, origin }
    }
}

#[async_trait]
impl Network for ReqwestNetwork {
    async fn fetch(&self, request: CacheRequest) -> Result<CacheResponse> {
        let url = self.origin.resolve(&request.url)?;
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| Error::invalid_url(&request.url, e))?;

        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let final_url = response.url().clone();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let shared = response
            .headers()
            .contains_key(reqwest::header::ACCESS_CONTROL_ALLOW_ORIGIN);
        let kind = self.origin.classify(&final_url, shared);
        let body = response.bytes().await?;

        log::debug!("{} {final_url} -> {status} ({kind})", request.method);

        Ok(CacheResponse {
            status,
            headers,
            body,
            kind,
            url: Some(final_url.to_string()),
        })
    }

    fn origin(&self) -> Option<&Origin> {
        Some(&self.origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_origin() {
        let config = NetworkConfig::default().with_origin("/not-an-origin");
        assert!(matches!(
            ReqwestNetwork::new(&config),
            Err(Error::InvalidUrl { .. })
        ));
    }

    #[test]
    fn keeps_configured_origin() {
        let config = NetworkConfig::default().with_origin("https://board.example/app/");
        let network = ReqwestNetwork::new(&config).unwrap();
        assert_eq!(network.origin().unwrap().to_string(), "https://board.example");
    }

    #[tokio::test]
    async fn unreachable_host_is_an_http_error() {
        // Port 9 (discard) on localhost is closed in test environments.
        let config = NetworkConfig::default().with_origin("http://127.0.0.1:9");
        let network = ReqwestNetwork::new(&config).unwrap();
        let result = network.fetch(CacheRequest::get("/a.css")).await;
        assert!(matches!(result, Err(Error::Http(_))));
    }

    #[tokio::test]
    async fn invalid_method_is_rejected_before_sending() {
        let config = NetworkConfig::default().with_origin("http://127.0.0.1:9");
        let network = ReqwestNetwork::new(&config).unwrap();
        let result = network.fetch(CacheRequest::new("BAD METHOD", "/a.css")).await;
        assert!(matches!(result, Err(Error::InvalidUrl { .. })));
    }
}
