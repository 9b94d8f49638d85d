//! # Forwarder Module
//!
//! Sends a copy of every extracted request to the mirror destination and forgets about it.
//!
//! ```text
//! ┌──────────────┐ submit() ┌───────────┐ spawn ┌──────────────┐ HTTP/1.1 ┌─────────────┐
//! │ StreamReader │─────────▶│ Forwarder │──────▶│ forward task │─────────▶│ destination │
//! └──────────────┘          │ (permits) │       │ (timeout)    │          └─────────────┘
//!                           └───────────┘       └──────────────┘
//! ```
//!
//! The number of forwards in flight is capped; a request arriving while every slot is busy
//! is dropped rather than queued, so a slow destination never stalls the readers. Responses
//! are read to the end and discarded.

use super::types::{ForwardStats, MirrorRequest};
use crate::configuration::types::{ForwarderSettings, MirrorTarget};
use crate::error_handling::types::ForwardError;
use crate::http_framing::stream_reader::RequestSink;
use crate::http_framing::types::HttpRequest;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, HOST};
use http::{Request, StatusCode, Uri, Version};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PORT: HeaderName = HeaderName::from_static("x-forwarded-port");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Rewrites a captured request for the mirror destination.
///
/// Every original header is kept. `X-Forwarded-For` is always replaced by the flow's client
/// address; `X-Forwarded-Port`, `X-Forwarded-Proto` and `X-Forwarded-Host` are only added
/// when the request doesn't carry them already, so an upstream proxy chain survives.
pub fn mirror_request(
    target: &MirrorTarget,
    request: &HttpRequest,
) -> Result<MirrorRequest, ForwardError> {
    // Absolute-form targets keep only their path and query.
    let path = match request.uri.path_and_query() {
        Some(pq) if pq.as_str().starts_with('/') => pq.as_str(),
        _ => "/",
    };
    let url = Uri::builder()
        .scheme("http")
        .authority(target.authority().as_str())
        .path_and_query(path)
        .build()
        .map_err(|e| ForwardError::InvalidTarget(format!("{}: {}", target, e)))?;

    let mut headers = request.headers.clone();
    let source = HeaderValue::try_from(request.source.to_string()).map_err(http::Error::from)?;
    headers.insert(X_FORWARDED_FOR, source);
    if !headers.contains_key(&X_FORWARDED_PORT) {
        headers.insert(X_FORWARDED_PORT, HeaderValue::from(request.destination_port));
    }
    if !headers.contains_key(&X_FORWARDED_PROTO) {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }
    if !headers.contains_key(&X_FORWARDED_HOST) {
        if let Some(host) = request.headers.get(HOST) {
            headers.insert(X_FORWARDED_HOST, host.clone());
        }
    }

    Ok(MirrorRequest {
        method: request.method.clone(),
        url,
        headers,
        body: request.body.clone(),
        flow_id: request.flow_id,
    })
}

struct Inner {
    client: Client<HttpConnector, Full<Bytes>>,
    target: MirrorTarget,
    timeout: Duration,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    sent: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Fire-and-forget HTTP/1.1 client for the mirror destination. Cheap to clone.
#[derive(Clone)]
pub struct Forwarder {
    inner: Arc<Inner>,
}

impl Forwarder {
    pub fn new(target: MirrorTarget, settings: &ForwarderSettings) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .http1_title_case_headers(true)
            .build_http();
        let max_in_flight = settings.max_in_flight.clamp(1, Semaphore::MAX_PERMITS);

        Self {
            inner: Arc::new(Inner {
                client,
                target,
                timeout: settings.timeout,
                permits: Arc::new(Semaphore::new(max_in_flight)),
                max_in_flight,
                sent: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn target(&self) -> &MirrorTarget {
        &self.inner.target
    }

    /// Sends one mirrored request and waits for the destination to answer.
    ///
    /// The whole exchange, response body included, is bounded by the forward timeout.
    pub async fn forward(&self, mirror: MirrorRequest) -> Result<StatusCode, ForwardError> {
        let mut request = Request::new(Full::new(mirror.body));
        *request.method_mut() = mirror.method;
        *request.uri_mut() = mirror.url;
        *request.version_mut() = Version::HTTP_11;
        *request.headers_mut() = mirror.headers;

        let exchange = async {
            let response = self.inner.client.request(request).await?;
            let status = response.status();
            response
                .into_body()
                .collect()
                .await
                .map_err(|e: hyper::Error| ForwardError::Body(e.to_string()))?;
            Ok::<_, ForwardError>(status)
        };

        match tokio::time::timeout(self.inner.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ForwardError::Timeout(self.inner.timeout)),
        }
    }

    pub fn stats(&self) -> ForwardStats {
        ForwardStats {
            sent: self.inner.sent.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.max_in_flight - self.inner.permits.available_permits()
    }

    /// Waits until every forward in flight has finished.
    pub async fn wait_idle(&self) {
        let all = u32::try_from(self.inner.max_in_flight).unwrap_or(u32::MAX);
        // Permits are released right away, the semaphore is never closed.
        let _ = self.inner.permits.acquire_many(all).await;
    }
}

impl RequestSink for Forwarder {
    fn submit(&self, request: HttpRequest) {
        let permit = match Arc::clone(&self.inner.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "[{}] {} forwards in flight, dropping {} {}",
                    request.flow_id, self.inner.max_in_flight, request.method, request.uri
                );
                return;
            }
        };

        let mirror = match mirror_request(&self.inner.target, &request) {
            Ok(mirror) => mirror,
            Err(e) => {
                self.inner.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "[{}] unable to mirror {} {}: {}",
                    request.flow_id, request.method, request.uri, e
                );
                return;
            }
        };

        let forwarder = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let flow_id = mirror.flow_id;
            let method = mirror.method.clone();
            let url = mirror.url.clone();
            match forwarder.forward(mirror).await {
                Ok(status) => {
                    forwarder.inner.sent.fetch_add(1, Ordering::Relaxed);
                    debug!("[{}] mirrored {} {} ({})", flow_id, method, url, status);
                }
                Err(e) => {
                    forwarder.inner.failed.fetch_add(1, Ordering::Relaxed);
                    warn!("[{}] failed to mirror {} {}: {}", flow_id, method, url, e);
                }
            }
        });
    }
}
