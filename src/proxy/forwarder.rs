use bytes::Bytes;
use http::header::{
    ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING,
};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode};
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::ForwarderConfig;
use crate::error::RouterError;
use crate::proxy::context::full_body;
use crate::upstream::{build_upstream_client, Backend, Outcome, ServerPool, Source, UpstreamClient};

/// Inbound request reduced to what is forwarded upstream.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    /// Path after the service prefix, with its leading `/` (may be empty).
    pub rest: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub trace_id: String,
}

/// Upstream answer as returned to the caller.
#[derive(Debug)]
pub struct ForwardedResponse {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
    /// Backend that produced the response.
    pub backend: String,
    /// Attempts made, the successful one included.
    pub attempts: u32,
}

/// Failed forward together with the attempts it took.
#[derive(Debug)]
pub struct ForwardError {
    pub error: RouterError,
    pub backend: String,
    pub attempts: u32,
}

/// How far an attempt got before it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// No connection to the backend; the request never left.
    Connect,
    /// The request may have reached the backend (timeout, broken response).
    Sent,
}

/// A failed attempt may be replayed on another backend when the request
/// never left, or when replaying it cannot duplicate a write.
pub fn is_retryable(method: &Method, stage: Stage) -> bool {
    stage == Stage::Connect || method.is_idempotent()
}

struct AttemptError {
    error: RouterError,
    stage: Stage,
}

/// Sends a request to one backend of a pool, retrying transport failures on
/// backends not yet tried.
pub struct RequestForwarder {
    client: UpstreamClient,
    max_retries: u32,
    backoff: Duration,
    request_timeout: Duration,
    trace_header: HeaderName,
}

impl RequestForwarder {
    pub fn new(cfg: &ForwarderConfig) -> Result<Self, RouterError> {
        let trace_header = HeaderName::from_bytes(cfg.trace_header.as_bytes())
            .map_err(|e| RouterError::generic("invalid trace header name", e))?;
        Ok(Self {
            client: build_upstream_client(cfg),
            max_retries: cfg.max_retries,
            backoff: cfg.backoff(),
            request_timeout: cfg.request_timeout(),
            trace_header,
        })
    }

    pub fn trace_header(&self) -> &HeaderName {
        &self.trace_header
    }

    /// Select, send, record. Any upstream status counts as a successful
    /// transport and is returned as is. Connect failures are retried for every
    /// method, later failures only for idempotent ones (see [`is_retryable`]).
    /// Dropping the returned future aborts the in-flight call.
    pub async fn forward(
        &self,
        pool: &ServerPool,
        req: &ForwardRequest,
    ) -> Result<ForwardedResponse, ForwardError> {
        let mut tried: Vec<Arc<Backend>> = Vec::new();
        let mut last_error: Option<RouterError> = None;
        let mut last_backend = String::new();

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                metrics::counter!(
                    "router_upstream_retries_total",
                    "pool" => pool.name().to_string(),
                )
                .increment(1);
                tokio::time::sleep(self.backoff).await;
            }

            let backend = match pool.select_backend_excluding(&tried).await {
                Ok(b) => b,
                Err(e) => {
                    // Nothing left to try: surface the transport error if there was one.
                    return Err(ForwardError {
                        error: last_error.unwrap_or(e),
                        backend: last_backend,
                        attempts: attempt,
                    });
                }
            };
            last_backend = backend.url().to_string();

            match self.send_once(&backend, req).await {
                Ok((status, content_type, body)) => {
                    backend.record(Outcome::Success, Source::Request);
                    pool.store().save(&backend).await;
                    return Ok(ForwardedResponse {
                        status,
                        content_type,
                        body,
                        backend: last_backend,
                        attempts: attempt + 1,
                    });
                }
                Err(AttemptError { error, stage }) => {
                    backend.record(Outcome::Failure, Source::Request);
                    pool.store().save(&backend).await;
                    warn!(
                        pool = %pool.name(),
                        backend = %backend.url(),
                        attempt = attempt + 1,
                        trace_id = %req.trace_id,
                        error = %error,
                        "proxy: upstream call failed"
                    );
                    if !is_retryable(&req.method, stage) {
                        debug!(
                            method = %req.method,
                            trace_id = %req.trace_id,
                            "proxy: not replaying non-idempotent request"
                        );
                        return Err(ForwardError {
                            error,
                            backend: last_backend,
                            attempts: attempt + 1,
                        });
                    }
                    tried.push(backend);
                    last_error = Some(error);
                }
            }
        }

        Err(ForwardError {
            error: last_error.unwrap_or_else(|| RouterError::no_backend_available(pool.name())),
            backend: last_backend,
            attempts: self.max_retries + 1,
        })
    }

    async fn send_once(
        &self,
        backend: &Backend,
        req: &ForwardRequest,
    ) -> Result<(StatusCode, Option<HeaderValue>, Bytes), AttemptError> {
        let target = backend.target_url(&req.rest, req.query.as_deref());
        let upstream_req = self.build_request(&target, req).map_err(|error| AttemptError {
            error,
            stage: Stage::Connect,
        })?;

        let call = async {
            let resp = self.client.request(upstream_req).await.map_err(|e| AttemptError {
                stage: if e.is_connect() { Stage::Connect } else { Stage::Sent },
                error: RouterError::integration(format!("error calling {}", target), e),
            })?;
            let (parts, body) = resp.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| AttemptError {
                    error: RouterError::integration(
                        format!("error reading response from {}", target),
                        e,
                    ),
                    stage: Stage::Sent,
                })?
                .to_bytes();
            Ok::<_, AttemptError>((parts.status, parts.headers.get(CONTENT_TYPE).cloned(), body))
        };

        let started = Instant::now();
        // a timeout cannot tell a slow dial from a slow backend, so it counts as sent
        let result = match tokio::time::timeout(self.request_timeout, call).await {
            Ok(res) => res,
            Err(_) => Err(AttemptError {
                error: RouterError::integration(
                    format!("error calling {}", target),
                    format!("timed out after {:?}", self.request_timeout),
                ),
                stage: Stage::Sent,
            }),
        };
        debug!(
            target = %target,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "proxy: upstream attempt"
        );
        result
    }

    fn build_request(
        &self,
        target: &str,
        req: &ForwardRequest,
    ) -> Result<Request<crate::proxy::BoxBody>, RouterError> {
        let mut headers = req.headers.clone();
        strip_headers(&mut headers);
        if let Ok(v) = HeaderValue::from_str(&req.trace_id) {
            headers.insert(self.trace_header.clone(), v);
        }

        let mut builder = Request::builder().method(req.method.clone()).uri(target);
        if let Some(h) = builder.headers_mut() {
            *h = headers;
        }
        builder
            .body(full_body(req.body.clone()))
            .map_err(|e| RouterError::generic(format!("failed to build request to {}", target), e))
    }
}

/// Drop headers that must not reach the backend: `Accept-Encoding` (the
/// body is relayed without decoding), `Host` (set from the target URL) and
/// connection-scoped hop-by-hop headers. `Content-Length` is recomputed from
/// the buffered body.
pub fn strip_headers(headers: &mut HeaderMap) {
    let denied: [HeaderName; 11] = [
        ACCEPT_ENCODING,
        HOST,
        CONTENT_LENGTH,
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailer"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];
    for h in &denied {
        headers.remove(h);
    }
}
