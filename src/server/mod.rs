mod admin;
pub mod bootstrap;
mod state;

pub use state::RouterState;

use anyhow::Result;
use futures_util::FutureExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::RouterError;
use crate::proxy::{self, BoxBody};

const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Bind `listen` and serve the proxy until `shutdown` is cancelled.
pub async fn run_proxy_server(
    listen: &str,
    state: RouterState,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    serve_proxy(listener, state, shutdown).await
}

/// Serve the proxy on an already bound listener.
///
/// On shutdown the listener stops accepting and in-flight connections get up
/// to `DRAIN_TIMEOUT` to finish.
pub async fn serve_proxy(
    listener: TcpListener,
    state: RouterState,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("server: proxy listening, addr={}", listener.local_addr()?);

    // metrics gauges are write-only, keep our own count for draining
    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.cancelled() => {
                info!("server: proxy: stop accepting new connections, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!("router_connections_total", "status" => "accepted").increment(1);
                v
            }
            Err(e) => {
                error!("server: proxy: accept failed, error={}", e);
                metrics::counter!("router_connections_total", "status" => "error").increment(1);
                continue;
            }
        };

        metrics::gauge!("router_connections_active").increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let state = state.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { Ok::<_, hyper::Error>(guarded_handle(req, state, peer_addr).await) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!(
                        "server: proxy: connection error, peer={}, error={}",
                        peer_addr, e
                    );
                }
            }

            metrics::gauge!("router_connections_active").decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    let active = active_conns.load(Ordering::Relaxed);
    if active > 0 {
        info!(
            "server: proxy: waiting for {} active connections to drain",
            active
        );
        let drain = async {
            while active_conns.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        };
        match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
            Ok(_) => info!("server: proxy: all connections drained"),
            Err(_) => info!(
                "server: proxy: drain timeout ({}s), {} connections still active",
                DRAIN_TIMEOUT.as_secs(),
                active_conns.load(Ordering::Relaxed)
            ),
        }
    }

    Ok(())
}

/// Run the request handler, turning a panic into a 500 envelope instead of a
/// dropped connection.
async fn guarded_handle(
    req: Request<Incoming>,
    state: RouterState,
    peer_addr: SocketAddr,
) -> Response<BoxBody> {
    let trace_id = proxy::resolve_trace_id(req.headers(), state.forwarder.trace_header());
    match AssertUnwindSafe(proxy::handle_request(req, state, peer_addr))
        .catch_unwind()
        .await
    {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            let err = RouterError::generic("request handling failed", e);
            envelope_response(&err, &trace_id)
        }
        Err(payload) => {
            let err = RouterError::from_panic(payload);
            error!(
                peer = %peer_addr,
                trace_id = %trace_id,
                error = %err,
                "server: proxy: handler panicked"
            );
            envelope_response(&err, &trace_id)
        }
    }
}

fn envelope_response(err: &RouterError, trace_id: &str) -> Response<BoxBody> {
    let body = serde_json::to_vec(&err.to_envelope(trace_id)).unwrap_or_default();
    proxy::context::json_response(err.status(), body)
}

/// Bind `listen` and serve the admin API until `shutdown` is cancelled.
pub async fn run_admin_server(
    listen: &str,
    state: RouterState,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    serve_admin(listener, state, shutdown).await
}

/// Health, readiness, metrics and pool inspection.
pub async fn serve_admin(
    listener: TcpListener,
    state: RouterState,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("server: admin listening, addr={}", listener.local_addr()?);

    loop {
        let (stream, _) = tokio::select! {
            result = listener.accept() => result?,
            _ = shutdown.cancelled() => return Ok(()),
        };
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}
