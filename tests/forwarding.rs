//! End-to-end tests: a real proxy listener in front of in-process hyper
//! backends.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use upstream_router::config::{HealthCheckTarget, RouterConfig, ServerConfig};
use upstream_router::server::{serve_proxy, RouterState};
use upstream_router::store::HealthStateStore;
use upstream_router::upstream::{PoolRegistry, Source};

struct MockBackend {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl MockBackend {
    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Backend that echoes what it received as JSON.
async fn spawn_backend(name: &'static str) -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let counter = counter.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req: Request<Incoming>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    echo(name, req)
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });

    MockBackend { addr, hits }
}

async fn echo(
    name: &'static str,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();
    let headers = req.headers().clone();
    let body = req.into_body().collect().await?.to_bytes();

    let header = |n: &str| {
        headers
            .get(n)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let payload = serde_json::json!({
        "backend": name,
        "method": method,
        "path": path,
        "query": query,
        "accept_encoding": header("accept-encoding"),
        "x_custom": header("x-custom"),
        "trace_id": header("x-trace-id"),
        "body": String::from_utf8_lossy(&body),
    });
    let status = if path == "/fail" { 500 } else { 200 };

    let resp = Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .header("x-backend", name)
        .body(Full::new(Bytes::from(payload.to_string())))
        .unwrap();
    Ok(resp)
}

/// Backend that reads requests and never answers.
struct HangingBackend {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    closed: Arc<Notify>,
}

impl HangingBackend {
    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

async fn spawn_hanging_backend() -> HangingBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(Notify::new());

    let (count, notify) = (accepted.clone(), closed.clone());
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            count.fetch_add(1, Ordering::SeqCst);
            let notify = notify.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => {
                            notify.notify_one();
                            return;
                        }
                        Ok(_) => {}
                    }
                }
            });
        }
    });

    HangingBackend {
        addr,
        accepted,
        closed,
    }
}

/// Address nothing listens on.
async fn closed_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

fn server(prefix: &str, url: &str) -> ServerConfig {
    ServerConfig {
        service_prefix: prefix.to_string(),
        server_name: String::new(),
        endpoint_url: url.to_string(),
        zone: String::new(),
        healthcheck: HealthCheckTarget::default(),
    }
}

struct Router {
    base: String,
    registry: Arc<PoolRegistry>,
    shutdown: CancellationToken,
}

impl Drop for Router {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_router(servers: Vec<ServerConfig>) -> Router {
    start_router_with_timeout(servers, 5.0).await
}

async fn start_router_with_timeout(servers: Vec<ServerConfig>, request_timeout: f64) -> Router {
    let mut cfg = RouterConfig::default();
    cfg.servers = servers;
    cfg.forwarder.backoff_ms = 1;
    cfg.forwarder.request_timeout = request_timeout;

    let store = Arc::new(HealthStateStore::in_memory());
    let registry = Arc::new(PoolRegistry::from_servers(&cfg.servers, store).unwrap());
    let state = RouterState::new(cfg, registry.clone(), None).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(serve_proxy(listener, state, shutdown.clone()));

    Router {
        base: format!("http://{}", addr),
        registry,
        shutdown,
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

#[tokio::test]
async fn test_forwards_method_path_query_body_and_headers() {
    let a = spawn_backend("a").await;
    let router = start_router(vec![server("app1", &a.url())]).await;

    let resp = client()
        .post(format!("{}/api/app1/users/42?verbose=1", router.base))
        .header("accept-encoding", "gzip")
        .header("x-custom", "kept")
        .header("x-trace-id", "trace-123")
        .body("hello")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "application/json");
    assert_eq!(resp.headers()["x-trace-id"], "trace-123");
    assert!(resp.headers().get("x-backend").is_none());

    let echoed: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(echoed["method"], "POST");
    assert_eq!(echoed["path"], "/users/42");
    assert_eq!(echoed["query"], "verbose=1");
    assert_eq!(echoed["body"], "hello");
    assert_eq!(echoed["x_custom"], "kept");
    assert_eq!(echoed["trace_id"], "trace-123");
    assert!(echoed["accept_encoding"].is_null());
    assert_eq!(a.hits(), 1);
}

#[tokio::test]
async fn test_round_robin_across_backends() {
    let a = spawn_backend("a").await;
    let b = spawn_backend("b").await;
    let router = start_router(vec![server("app1", &a.url()), server("app1", &b.url())]).await;

    let mut order = Vec::new();
    for _ in 0..4 {
        let echoed: serde_json::Value = client()
            .get(format!("{}/api/app1/ping", router.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        order.push(echoed["backend"].as_str().unwrap().to_string());
    }
    assert_eq!(order, vec!["a", "b", "a", "b"]);
}

#[tokio::test]
async fn test_upstream_status_is_relayed() {
    let a = spawn_backend("a").await;
    let router = start_router(vec![server("app1", &a.url())]).await;

    let resp = client()
        .get(format!("{}/api/app1/fail", router.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    // a 5xx is still a completed call: no retry
    assert_eq!(a.hits(), 1);
}

#[tokio::test]
async fn test_unknown_prefix_is_rejected_without_upstream_call() {
    let a = spawn_backend("a").await;
    let router = start_router(vec![server("app1", &a.url())]).await;

    let resp = client()
        .get(format!("{}/api/nope/users", router.base))
        .header("x-trace-id", "t-1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let envelope: serde_json::Value = resp.json().await.unwrap();
    assert!(envelope["message"]
        .as_str()
        .unwrap()
        .contains("pool not found"));
    assert_eq!(envelope["trace_id"], "t-1");
    assert_eq!(a.hits(), 0);
}

#[tokio::test]
async fn test_retries_on_alternate_backend() {
    let dead = closed_addr().await;
    let b = spawn_backend("b").await;
    let router = start_router(vec![server("app1", &dead), server("app1", &b.url())]).await;

    for _ in 0..5 {
        let resp = client()
            .get(format!("{}/api/app1/ping", router.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let echoed: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(echoed["backend"], "b");
    }
    assert_eq!(b.hits(), 5);
}

#[tokio::test]
async fn test_all_backends_down() {
    let dead = closed_addr().await;
    let router = start_router(vec![server("app1", &dead)]).await;

    // transport failures surface as 502 until the backend is marked dead
    for _ in 0..3 {
        let resp = client()
            .get(format!("{}/api/app1/ping", router.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 502);
        let envelope: serde_json::Value = resp.json().await.unwrap();
        assert!(envelope["message"].as_str().unwrap().contains("error calling"));
    }

    let resp = client()
        .get(format!("{}/api/app1/ping", router.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
}

#[tokio::test]
async fn test_root_status_and_generated_trace_id() {
    let router = start_router(Vec::new()).await;

    let resp = client().get(format!("{}/", router.base)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let trace_id = resp.headers()["x-trace-id"].to_str().unwrap().to_string();
    assert_eq!(trace_id.len(), 32);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "up");
}

#[tokio::test]
async fn test_traceparent_is_honoured() {
    let a = spawn_backend("a").await;
    let router = start_router(vec![server("app1", &a.url())]).await;

    let resp = client()
        .get(format!("{}/api/app1/ping", router.base))
        .header(
            "traceparent",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        )
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers()["x-trace-id"], "4bf92f3577b34da6a3ce929d0e0e4736");
    let echoed: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(echoed["trace_id"], "4bf92f3577b34da6a3ce929d0e0e4736");
}

#[tokio::test]
async fn test_unsupported_method_and_unknown_path() {
    let a = spawn_backend("a").await;
    let router = start_router(vec![server("app1", &a.url())]).await;

    let resp = client()
        .request(reqwest::Method::OPTIONS, format!("{}/api/app1/ping", router.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 405);

    let resp = client()
        .get(format!("{}/other/path", router.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    assert_eq!(a.hits(), 0);
}

#[tokio::test]
async fn test_client_disconnect_aborts_upstream_call() {
    let a = spawn_backend("a").await;
    let slow = spawn_hanging_backend().await;
    let router = start_router(vec![server("app1", &a.url()), server("slow", &slow.url())]).await;

    let resp = client()
        .get(format!("{}/api/app1/ping", router.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let fast = router.registry.pool("app1").unwrap().backends()[0].clone();
    let recorded = fast.counts(Source::Request).snapshot();
    assert_eq!(recorded.total_successes, 1);

    // the client gives up long before the router's own 5s timeout
    let impatient = reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_millis(300))
        .build()
        .unwrap();
    let res = impatient
        .post(format!("{}/api/slow/orders", router.base))
        .body("{}")
        .send()
        .await;
    assert!(res.unwrap_err().is_timeout());

    tokio::time::timeout(Duration::from_secs(3), slow.closed.notified())
        .await
        .expect("upstream connection still open after client left");
    assert_eq!(slow.accepted(), 1);

    assert_eq!(fast.counts(Source::Request).snapshot(), recorded);
    let hung = router.registry.pool("slow").unwrap().backends()[0].clone();
    assert_eq!(hung.counts(Source::Request).snapshot().requests, 0);
}

#[tokio::test]
async fn test_timed_out_post_is_not_replayed() {
    let slow = spawn_hanging_backend().await;
    let b = spawn_backend("b").await;
    let router =
        start_router_with_timeout(vec![server("app1", &slow.url()), server("app1", &b.url())], 0.3)
            .await;

    // cursor starts on the hanging backend
    let resp = client()
        .post(format!("{}/api/app1/orders", router.base))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
    assert_eq!(slow.accepted(), 1);
    assert_eq!(b.hits(), 0);

    // GET lands on b, the next GET times out on the hanging one and is replayed on b
    for _ in 0..2 {
        let resp = client()
            .get(format!("{}/api/app1/orders", router.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }
    assert_eq!(slow.accepted(), 2);
    assert_eq!(b.hits(), 2);

    let hung = router.registry.pool("app1").unwrap().backends()[0].clone();
    assert_eq!(hung.counts(Source::Request).snapshot().total_failures, 2);
}
