use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::debug;

use crate::error::RouterError;
use crate::proxy::context::{full_body, json_response, BoxBody, RequestContext};
use crate::proxy::forwarder::ForwardRequest;
use crate::server::RouterState;

/// Resource paths are `/api/{service_prefix}/{rest...}`.
const API_ROOT: &str = "/api/";

/// Handle one inbound request:
///
/// 1. `GET /` answers the liveness probe directly.
/// 2. Method check, then `/api/{prefix}/{rest}` is split and the pool looked up.
/// 3. The body is buffered and the request handed to the forwarder.
/// 4. Status, content type and body are relayed; errors become the envelope.
pub async fn handle_request(
    req: Request<Incoming>,
    state: RouterState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let trace_header = state.forwarder.trace_header().clone();
    let trace_id = resolve_trace_id(req.headers(), &trace_header);
    let mut ctx = RequestContext::new(
        req.method().as_str().to_string(),
        req.uri().path().to_string(),
        client_ip(req.headers(), peer_addr),
        trace_id,
        trace_header,
    );

    let resp = match route(req, &state, &mut ctx).await {
        Ok(resp) => resp,
        Err(err) => {
            debug!(
                path = %ctx.path,
                trace_id = %ctx.trace_id,
                error = %err,
                "proxy: request rejected"
            );
            ctx.error_response(&err)
        }
    };
    ctx.log(resp.status().as_u16());
    Ok(resp)
}

async fn route(
    req: Request<Incoming>,
    state: &RouterState,
    ctx: &mut RequestContext,
) -> Result<Response<BoxBody>, RouterError> {
    if req.uri().path() == "/" && req.method() == Method::GET {
        let mut resp = json_response(StatusCode::OK, r#"{"status":"up"}"#);
        ctx.stamp_trace_id(&mut resp);
        return Ok(resp);
    }

    if !req.uri().path().starts_with(API_ROOT) {
        return Err(RouterError::not_found(format!(
            "no route for path \"{}\"",
            req.uri().path()
        )));
    }

    if !is_forwardable_method(req.method()) {
        return Err(
            RouterError::bad_request(format!("method {} not allowed", req.method()))
                .with_status(StatusCode::METHOD_NOT_ALLOWED),
        );
    }

    let (prefix, rest) = parse_resource_path(req.uri().path())?;
    ctx.pool = prefix.to_string();
    let rest = rest.to_string();

    let pool = state
        .registry
        .pool(&ctx.pool)
        .cloned()
        .ok_or_else(|| RouterError::bad_request(format!("pool not found for \"{}\"", ctx.pool)))?;

    let query = req.uri().query().map(str::to_string);
    let method = req.method().clone();
    let (parts, body) = req.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| RouterError::bad_request(format!("failed to read request body: {}", e)))?
        .to_bytes();

    let forward_req = ForwardRequest {
        method,
        rest,
        query,
        headers: parts.headers,
        body,
        trace_id: ctx.trace_id.clone(),
    };

    ctx.upstream_start = Some(Instant::now());
    match state.forwarder.forward(&pool, &forward_req).await {
        Ok(out) => {
            ctx.backend = out.backend;
            ctx.attempts = out.attempts;
            let mut resp = Response::new(full_body(out.body));
            *resp.status_mut() = out.status;
            if let Some(ct) = out.content_type {
                resp.headers_mut().insert(CONTENT_TYPE, ct);
            }
            ctx.stamp_trace_id(&mut resp);
            Ok(resp)
        }
        Err(fail) => {
            ctx.backend = fail.backend;
            ctx.attempts = fail.attempts;
            Err(fail.error)
        }
    }
}

fn is_forwardable_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// Split `/api/{prefix}/{rest...}` into `(prefix, "/{rest...}")`. The rest
/// keeps its leading slash and may be empty.
pub fn parse_resource_path(path: &str) -> Result<(&str, &str), RouterError> {
    let tail = path
        .strip_prefix(API_ROOT)
        .ok_or_else(|| RouterError::bad_request(format!("malformed resource path \"{}\"", path)))?;
    let (prefix, rest) = match tail.find('/') {
        Some(idx) => (&tail[..idx], &tail[idx..]),
        None => (tail, ""),
    };
    if prefix.is_empty() {
        return Err(RouterError::bad_request(format!(
            "malformed resource path \"{}\"",
            path
        )));
    }
    Ok((prefix, rest))
}

/// Trace id from the configured header, else the trace-id field of a W3C
/// `traceparent`, else a fresh random 128-bit id.
pub fn resolve_trace_id(headers: &HeaderMap, trace_header: &HeaderName) -> String {
    if let Some(id) = headers
        .get(trace_header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return id.to_string();
    }

    if let Some(id) = headers
        .get("traceparent")
        .and_then(|v| v.to_str().ok())
        .and_then(traceparent_trace_id)
    {
        return id.to_string();
    }

    format!("{:032x}", rand::random::<u128>())
}

fn traceparent_trace_id(value: &str) -> Option<&str> {
    let mut parts = value.trim().split('-');
    let _version = parts.next()?;
    let trace_id = parts.next()?;
    let valid = trace_id.len() == 32
        && trace_id.bytes().all(|b| b.is_ascii_hexdigit())
        && trace_id.bytes().any(|b| b != b'0');
    valid.then_some(trace_id)
}

/// Left-most `X-Forwarded-For` entry when present, else the TCP peer.
fn client_ip(headers: &HeaderMap, peer_addr: SocketAddr) -> std::net::IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse::<std::net::IpAddr>().ok())
        .unwrap_or_else(|| peer_addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use http::HeaderValue;

    #[test]
    fn test_parse_resource_path() {
        assert_eq!(
            parse_resource_path("/api/app1/users/42").unwrap(),
            ("app1", "/users/42")
        );
        assert_eq!(parse_resource_path("/api/app1/").unwrap(), ("app1", "/"));
        assert_eq!(parse_resource_path("/api/app1").unwrap(), ("app1", ""));
    }

    #[test]
    fn test_parse_resource_path_malformed() {
        for path in ["/api/", "/api//users", "/other/app1"] {
            let err = parse_resource_path(path).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::BadRequest, "path {}", path);
        }
    }

    #[test]
    fn test_forwardable_methods() {
        for m in [Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE] {
            assert!(is_forwardable_method(&m));
        }
        for m in [Method::HEAD, Method::OPTIONS, Method::TRACE, Method::CONNECT] {
            assert!(!is_forwardable_method(&m));
        }
    }

    #[test]
    fn test_trace_id_from_header() {
        let name = HeaderName::from_static("x-trace-id");
        let mut headers = HeaderMap::new();
        headers.insert("x-trace-id", HeaderValue::from_static("req-123"));
        headers.insert(
            "traceparent",
            HeaderValue::from_static("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"),
        );
        assert_eq!(resolve_trace_id(&headers, &name), "req-123");
    }

    #[test]
    fn test_trace_id_from_traceparent() {
        let name = HeaderName::from_static("x-trace-id");
        let mut headers = HeaderMap::new();
        headers.insert(
            "traceparent",
            HeaderValue::from_static("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"),
        );
        assert_eq!(
            resolve_trace_id(&headers, &name),
            "4bf92f3577b34da6a3ce929d0e0e4736"
        );
    }

    #[test]
    fn test_trace_id_generated() {
        let name = HeaderName::from_static("x-trace-id");
        let mut headers = HeaderMap::new();
        headers.insert(
            "traceparent",
            HeaderValue::from_static("00-00000000000000000000000000000000-00f067aa0ba902b7-01"),
        );
        let a = resolve_trace_id(&headers, &name);
        let b = resolve_trace_id(&HeaderMap::new(), &name);
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let peer: SocketAddr = "10.0.0.9:5555".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, peer).to_string(), "10.0.0.9");
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4, 10.0.0.1"));
        assert_eq!(client_ip(&headers, peer).to_string(), "1.2.3.4");
    }
}
