//! Request forwarding to backend instances with event-stream relay.
//!
//! Buffered responses are read in full and returned with the backend's status
//! and headers. Responses whose content type is `text/event-stream` are
//! relayed chunk by chunk as they arrive.

use axum::{
    body::Body,
    http::{header::CONTENT_TYPE, request::Parts, HeaderMap, HeaderName},
    response::Response,
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{redirect, Client};
use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::instance::Instance;
use crate::config::ProxyConfig;
use crate::error::{AppError, Result};

/// Headers the transport manages on each hop and that are never forwarded.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

const EVENT_STREAM: &str = "text/event-stream";

fn should_forward_header(name: &HeaderName) -> bool {
    !HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Copy of `headers` without hop-by-hop and framing headers
pub fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if should_forward_header(name) {
            filtered.append(name.clone(), value.clone());
        }
    }
    filtered
}

/// Whether the response should be relayed as a live stream
pub fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().to_ascii_lowercase().starts_with(EVENT_STREAM))
        .unwrap_or(false)
}

/// Lives inside a relayed body and logs when it is released, whichever side
/// ended it
struct RelayGuard {
    instance: String,
    chunks: usize,
    active: Arc<AtomicUsize>,
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        debug!(
            instance = %self.instance,
            chunks = self.chunks,
            "Event stream relay closed"
        );
    }
}

/// Forwards requests to instances over a shared connection pool
pub struct ProxyEngine {
    client: Client,
    max_body_bytes: Option<usize>,
    active_streams: Arc<AtomicUsize>,
}

impl ProxyEngine {
    /// Create an engine with no total request timeout so long-lived streams
    /// are never cut off; only the connect phase is bounded.
    ///
    /// Redirects are returned to the client as-is and environment proxy
    /// settings are ignored, so each request reaches exactly one instance once.
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .redirect(redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_body_bytes: config.max_body_bytes,
            active_streams: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Number of event streams currently being relayed
    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::SeqCst)
    }

    /// Read the whole client body, honoring the configured limit
    pub async fn read_body(&self, body: Body) -> Result<Bytes> {
        let limit = self.max_body_bytes.unwrap_or(usize::MAX);

        axum::body::to_bytes(body, limit).await.map_err(|e| {
            let too_large = std::error::Error::source(&e)
                .is_some_and(|s| s.is::<http_body_util::LengthLimitError>());
            if too_large {
                AppError::PayloadTooLarge(limit)
            } else {
                AppError::InvalidRequest(format!("Failed to read request body: {}", e))
            }
        })
    }

    /// Forward one request to `instance` and relay the response
    pub async fn forward(&self, instance: &Arc<Instance>, parts: &Parts, body: Bytes) -> Result<Response> {
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target_url = instance.url_for(path_and_query);

        info!(
            method = %parts.method,
            target = %target_url,
            body_bytes = body.len(),
            "Proxying request"
        );
        debug!(headers = ?parts.headers, "Request headers");

        let upstream = self
            .client
            .request(parts.method.clone(), &target_url)
            .headers(filter_headers(&parts.headers))
            .body(body)
            .send()
            .await
            .map_err(|e| AppError::BackendUnreachable {
                instance: instance.to_string(),
                reason: e.to_string(),
            })?;

        let status = upstream.status();
        let headers = filter_headers(upstream.headers());

        info!(instance = %instance, status = status.as_u16(), "Received response from instance");

        let body = if is_event_stream(&headers) {
            debug!(instance = %instance, "Relaying event stream");
            self.relay_stream(&instance.to_string(), upstream.bytes_stream())
        } else {
            let bytes = upstream
                .bytes()
                .await
                .map_err(|e| AppError::BackendUnreachable {
                    instance: instance.to_string(),
                    reason: e.to_string(),
                })?;
            Body::from(bytes)
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;

        Ok(response)
    }

    /// Relay body chunks in arrival order. Dropping the returned body, e.g.
    /// when the client disconnects, drops the upstream connection with it.
    fn relay_stream<S, E>(&self, instance: &str, upstream: S) -> Body
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
        E: Display + 'static,
    {
        self.active_streams.fetch_add(1, Ordering::SeqCst);
        let mut guard = RelayGuard {
            instance: instance.to_string(),
            chunks: 0,
            active: self.active_streams.clone(),
        };

        let stream = upstream.map(move |item| {
            // Borrow the whole guard so the closure owns it, not just a field
            let guard = &mut guard;
            match item {
                Ok(chunk) => {
                    guard.chunks += 1;
                    Ok(chunk)
                }
                Err(e) => {
                    let err = AppError::BackendStreamInterrupted {
                        instance: guard.instance.clone(),
                        reason: e.to_string(),
                    };
                    warn!(error = %err, chunks = guard.chunks, "Terminating client stream");
                    Err(err)
                }
            }
        });

        Body::from_stream(stream)
    }
}
