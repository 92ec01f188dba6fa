//! HTTP proxy that answers every request through the worker's fetch path.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Serialize;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::host::WorkerHost;
use crate::http::{CacheRequest, CacheResponse};
use crate::network::Network;
use crate::stats::{StatsObserver, WorkerStats};
use crate::storage::CacheStorage;
use crate::worker::{Caching, FetchOutcome};

/// Largest request body the proxy buffers.
const MAX_REQUEST_BODY: usize = 16 * 1024 * 1024;

/// Header telling clients how a response was produced.
pub const CACHE_STATUS_HEADER: &str = "x-offline-cache";

/// Connection-level headers that are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

struct AppState<S, N> {
    host: Arc<WorkerHost<S, N>>,
    stats: Arc<StatsObserver>,
}

impl<S, N> Clone for AppState<S, N> {
    fn clone(&self) -> Self {
        Self {
            host: Arc::clone(&self.host),
            stats: Arc::clone(&self.stats),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    state: String,
}

#[derive(Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    stats: WorkerStats,
    hit_ratio: f64,
    pending_stores: usize,
}

fn is_forwarded(name: &str) -> bool {
    !HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

async fn api_health<S, N>(State(state): State<AppState<S, N>>) -> impl IntoResponse
where
    S: CacheStorage + 'static,
    N: Network + 'static,
{
    axum::Json(HealthResponse {
        status: "ok".to_string(),
        state: state.host.state().to_string(),
    })
}

async fn api_stats<S, N>(State(state): State<AppState<S, N>>) -> impl IntoResponse
where
    S: CacheStorage + 'static,
    N: Network + 'static,
{
    let stats = state.stats.snapshot();
    axum::Json(StatsResponse {
        hit_ratio: stats.hit_ratio(),
        stats,
        pending_stores: state.host.worker().pending_tasks(),
    })
}

async fn into_cache_request(request: Request) -> Result<CacheRequest> {
    let (parts, body) = request.into_parts();
    let url = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), ToString::to_string);
    let headers = parts
        .headers
        .iter()
        .filter(|(name, _)| is_forwarded(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let body = to_bytes(body, MAX_REQUEST_BODY)
        .await
        .map_err(|e| Error::Server(format!("failed to read request body: {e}")))?;

    Ok(CacheRequest {
        method: parts.method.as_str().to_string(),
        url,
        headers,
        body,
    })
}

fn into_http_response(response: CacheResponse, cache_status: &'static str) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = HeaderMap::new();
    for (name, value) in &response.headers {
        if !is_forwarded(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    headers.insert(
        HeaderName::from_static(CACHE_STATUS_HEADER),
        HeaderValue::from_static(cache_status),
    );
    (status, headers, Body::from(response.body)).into_response()
}

async fn proxy<S, N>(State(state): State<AppState<S, N>>, request: Request) -> Response
where
    S: CacheStorage + 'static,
    N: Network + 'static,
{
    let request = match into_cache_request(request).await {
        Ok(request) => request,
        Err(e) => return (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()).into_response(),
    };

    match state.host.fetch(request).await {
        FetchOutcome::Cached(response) => into_http_response(response, "hit"),
        FetchOutcome::Network { response, caching } => {
            let cache_status = match caching {
                Caching::Scheduled | Caching::Skipped(_) => "miss",
                Caching::Bypassed => "bypass",
            };
            into_http_response(response, cache_status)
        }
        // Stand-in for the browser's own network error page.
        FetchOutcome::NoResponse(e) => (
            StatusCode::BAD_GATEWAY,
            [(CACHE_STATUS_HEADER, "error")],
            format!("No response: {e}"),
        )
            .into_response(),
    }
}

/// Builds the proxy router.
///
/// `/_worker/health` and `/_worker/stats` report on the worker; every other
/// path is answered cache first.
pub fn router<S, N>(host: Arc<WorkerHost<S, N>>, stats: Arc<StatsObserver>) -> Router
where
    S: CacheStorage + 'static,
    N: Network + 'static,
{
    let state = AppState { host, stats };
    Router::new()
        .route("/_worker/health", get(api_health::<S, N>))
        .route("/_worker/stats", get(api_stats::<S, N>))
        .fallback(proxy::<S, N>)
        .with_state(state)
}

/// Serves the proxy until Ctrl-C, then lets pending cache writes finish.
///
/// # Errors
///
/// Returns an error if the address is invalid or cannot be bound.
pub async fn run_server<S, N>(
    host: Arc<WorkerHost<S, N>>,
    stats: Arc<StatsObserver>,
    config: &ServerConfig,
) -> Result<()>
where
    S: CacheStorage + 'static,
    N: Network + 'static,
{
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| Error::Server(format!("invalid bind address: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("Serving offline cache on http://{addr}");

    let app = router(Arc::clone(&host), stats);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("Received SIGINT");
        })
        .await?;

    host.shutdown().await;
    log::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        assert!(!is_forwarded("Connection"));
        assert!(!is_forwarded("host"));
        assert!(!is_forwarded("Transfer-Encoding"));
        assert!(is_forwarded("content-type"));
        assert!(is_forwarded("etag"));
    }

    #[tokio::test]
    async fn response_conversion_keeps_status_headers_and_body() {
        let response = CacheResponse::new(200, "body{}")
            .with_header("Content-Type", "text/css")
            .with_header("Content-Length", "999");

        let http = into_http_response(response, "hit");

        assert_eq!(http.status(), StatusCode::OK);
        assert_eq!(http.headers()["content-type"], "text/css");
        assert_eq!(http.headers()[CACHE_STATUS_HEADER], "hit");
        assert_ne!(http.headers().get("content-length").map(|v| v.as_bytes()), Some(&b"999"[..]));
        let body = to_bytes(http.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"body{}");
    }

    #[tokio::test]
    async fn request_conversion_keeps_path_query_and_body() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/items?page=2")
            .header("host", "localhost:9724")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();

        let converted = into_cache_request(request).await.unwrap();

        assert_eq!(converted.method, "POST");
        assert_eq!(converted.url, "/api/items?page=2");
        assert_eq!(
            converted.headers,
            vec![("content-type".to_string(), "application/json".to_string())]
        );
        assert_eq!(&converted.body[..], b"{}");
    }
}
