use http::StatusCode;
use hyper::body::Incoming;
use hyper::{Request, Response};
use serde::Serialize;

use super::RouterState;
use crate::proxy::context::{full_body, json_response, BoxBody};
use crate::upstream::{CountsSnapshot, ServerPool, Source};

#[derive(Serialize)]
struct PoolView<'a> {
    name: &'a str,
    alive: usize,
    backends: Vec<BackendView<'a>>,
}

#[derive(Serialize)]
struct BackendView<'a> {
    url: &'a str,
    zone: &'a str,
    alive: bool,
    requests: CountsSnapshot,
    probes: CountsSnapshot,
    updated_at: String,
}

fn pool_view(pool: &ServerPool) -> PoolView<'_> {
    let backends: Vec<BackendView<'_>> = pool
        .backends()
        .iter()
        .map(|b| BackendView {
            url: b.url(),
            zone: b.zone(),
            alive: b.is_alive(),
            requests: b.counts(Source::Request).snapshot(),
            probes: b.counts(Source::Probe).snapshot(),
            updated_at: humantime::format_rfc3339_seconds(b.updated_at()).to_string(),
        })
        .collect();
    PoolView {
        name: pool.name(),
        alive: backends.iter().filter(|b| b.alive).count(),
        backends,
    }
}

pub fn handle_admin(
    req: Request<Incoming>,
    state: RouterState,
) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#)),

        "/ready" | "/readyz" => {
            let (status, label) = if state.is_ready() {
                (StatusCode::OK, "ready")
            } else {
                (StatusCode::SERVICE_UNAVAILABLE, "starting")
            };
            Ok(json_response(
                status,
                format!(
                    r#"{{"status":"{}","pools":{},"backends":{}}}"#,
                    label,
                    state.registry.pools().count(),
                    state.registry.backend_count(),
                ),
            ))
        }

        "/metrics" => {
            let body = state.metrics.as_ref().map(|m| m.render()).unwrap_or_default();
            let mut resp = Response::new(full_body(body));
            resp.headers_mut().insert(
                http::header::CONTENT_TYPE,
                http::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            Ok(resp)
        }

        "/pools" => {
            let pools: Vec<PoolView<'_>> = state.registry.pools().map(|p| pool_view(p)).collect();
            let zones: Vec<PoolView<'_>> =
                state.registry.zone_pools().map(|p| pool_view(p)).collect();
            let body = serde_json::to_string_pretty(&serde_json::json!({
                "store": state.registry.store().backend_kind(),
                "reporter": state.registry.store().reporter(),
                "pools": pools,
                "zones": zones,
            }))
            .unwrap_or_default();
            Ok(json_response(StatusCode::OK, body))
        }

        _ => Ok(json_response(StatusCode::NOT_FOUND, r#"{"message":"not found"}"#)),
    }
}
