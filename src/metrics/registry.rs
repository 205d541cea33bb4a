use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering the `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric descriptions.
    /// Fails if a recorder is already installed in this process.
    pub fn install() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )?
            .install_recorder()?;

        describe_all();
        Ok(Self { handle })
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn describe_all() {
    // request path
    describe_counter!(
        "router_http_requests_total",
        Unit::Count,
        "Total HTTP requests processed"
    );
    describe_histogram!(
        "router_http_request_duration_seconds",
        Unit::Seconds,
        "Total request duration from client perspective"
    );
    describe_histogram!(
        "router_upstream_request_duration_seconds",
        Unit::Seconds,
        "Time spent in upstream calls, retries and backoff included"
    );
    describe_counter!(
        "router_upstream_retries_total",
        Unit::Count,
        "Upstream retry attempts after a transport failure"
    );
    describe_counter!(
        "router_selection_failures_total",
        Unit::Count,
        "Selections that found no alive backend in the pool"
    );

    // health
    describe_counter!(
        "router_health_check_total",
        Unit::Count,
        "Probe attempts by result"
    );
    describe_histogram!(
        "router_health_check_duration_seconds",
        Unit::Seconds,
        "Probe duration"
    );
    describe_gauge!(
        "router_backend_alive",
        Unit::Count,
        "Backend liveness after the last probe: 1=alive 0=down"
    );
    describe_counter!(
        "router_store_errors_total",
        Unit::Count,
        "Failed health store reads and writes"
    );

    // connections
    describe_gauge!(
        "router_connections_active",
        Unit::Count,
        "Number of active downstream connections"
    );
    describe_counter!(
        "router_connections_total",
        Unit::Count,
        "Total connections accepted"
    );
}
