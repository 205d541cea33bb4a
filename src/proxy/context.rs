use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderName, HeaderValue, StatusCode};
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::time::Instant;

use crate::error::RouterError;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Build a response without going through the fallible `Response::builder()`.
pub fn json_response(status: StatusCode, body: impl Into<Bytes>) -> hyper::Response<BoxBody> {
    let mut resp = hyper::Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

/// Per-request bookkeeping for metrics and the access log.
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub client_ip: IpAddr,
    pub trace_id: String,
    pub trace_header: HeaderName,
    /// Service prefix, empty until the path has been parsed.
    pub pool: String,
    /// URL of the backend that produced the response (last one tried on failure).
    pub backend: String,
    pub attempts: u32,
    pub start: Instant,
    pub upstream_start: Option<Instant>,
}

impl RequestContext {
    pub fn new(
        method: String,
        path: String,
        client_ip: IpAddr,
        trace_id: String,
        trace_header: HeaderName,
    ) -> Self {
        Self {
            method,
            path,
            client_ip,
            trace_id,
            trace_header,
            pool: String::new(),
            backend: String::new(),
            attempts: 0,
            start: Instant::now(),
            upstream_start: None,
        }
    }

    /// The single mapping from [`RouterError`] to the JSON error envelope.
    pub fn error_response(&self, err: &RouterError) -> hyper::Response<BoxBody> {
        let envelope = err.to_envelope(&self.trace_id);
        let body = serde_json::to_vec(&envelope).unwrap_or_default();
        let mut resp = json_response(err.status(), body);
        self.stamp_trace_id(&mut resp);
        resp
    }

    /// Echo the trace id to the caller.
    pub fn stamp_trace_id(&self, resp: &mut hyper::Response<BoxBody>) {
        if let Ok(v) = HeaderValue::from_str(&self.trace_id) {
            resp.headers_mut().insert(self.trace_header.clone(), v);
        }
    }

    pub fn finalize_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "router_http_requests_total",
            "pool" => self.pool.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        metrics::histogram!(
            "router_http_request_duration_seconds",
            "pool" => self.pool.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        if let Some(upstream_start) = self.upstream_start {
            metrics::histogram!(
                "router_upstream_request_duration_seconds",
                "pool" => self.pool.clone(),
            )
            .record(upstream_start.elapsed().as_secs_f64());
        }
    }

    /// Record metrics and emit the access-log line.
    pub fn log(&self, resp_status: u16) {
        self.finalize_metrics(resp_status);

        let total_ms = self.start.elapsed().as_millis();
        let upstream_ms = self
            .upstream_start
            .map(|s| s.elapsed().as_millis())
            .unwrap_or(0);

        tracing::info!(
            client_ip = %self.client_ip,
            method = %self.method,
            path = %self.path,
            status = resp_status,
            pool = %self.pool,
            backend = %self.backend,
            attempts = self.attempts,
            trace_id = %self.trace_id,
            latency_ms = %total_ms,
            upstream_ms = %upstream_ms,
            "access"
        );
    }
}
