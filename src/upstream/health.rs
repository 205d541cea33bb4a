use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::{Backend, Source};
use super::counts::Outcome;
use super::registry::PoolRegistry;
use crate::config::{HealthCheckConfig, HealthCheckType};
use crate::error::RouterError;

/// Periodically probes every backend of every prefix pool and mirrors the
/// result to the health store.
pub struct HealthProber {
    registry: Arc<PoolRegistry>,
    client: reqwest::Client,
    interval: Duration,
    timeout: Duration,
    concurrency: usize,
}

/// Tally of one probe round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeRound {
    pub healthy: usize,
    pub unhealthy: usize,
}

impl HealthProber {
    pub fn new(registry: Arc<PoolRegistry>, cfg: &HealthCheckConfig) -> Result<Self, RouterError> {
        let timeout = cfg.probe_timeout();
        Ok(Self {
            registry,
            client: build_health_check_client(timeout)?,
            interval: cfg.interval(),
            timeout,
            concurrency: cfg.concurrency.max(1),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Probe every backend once. Each probe is bounded by the probe timeout; a
    /// timeout counts as a failure.
    pub async fn run_once(&self) -> ProbeRound {
        let backends: Vec<Arc<Backend>> = self.registry.backends().cloned().collect();
        if backends.is_empty() {
            return ProbeRound::default();
        }

        let results: Vec<bool> = stream::iter(backends)
            .map(|backend| async move { self.probe_and_record(&backend).await })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let healthy = results.iter().filter(|ok| **ok).count();
        ProbeRound {
            healthy,
            unhealthy: results.len() - healthy,
        }
    }

    /// Tick until `shutdown` is cancelled. The first round runs immediately.
    /// Cancellation is observed between rounds only.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            timeout_ms = self.timeout.as_millis() as u64,
            backends = self.registry.backend_count(),
            "health: prober started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("health: prober stopped");
                    return;
                }
                _ = ticker.tick() => {
                    // a started round always completes; each probe has its own timeout
                    let round = self.run_once().await;
                    debug!(
                        healthy = round.healthy,
                        unhealthy = round.unhealthy,
                        "health: round complete"
                    );
                }
            }
        }
    }

    async fn probe_and_record(&self, backend: &Backend) -> bool {
        let started = Instant::now();
        let result = tokio::time::timeout(self.timeout, self.probe(backend)).await;
        let healthy = match result {
            Ok(Ok(())) => true,
            Ok(Err(reason)) => {
                debug!(
                    prefix = %backend.service_prefix(),
                    backend = %backend.url(),
                    reason = %reason,
                    "health: probe failed"
                );
                false
            }
            Err(_) => {
                debug!(
                    prefix = %backend.service_prefix(),
                    backend = %backend.url(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "health: probe timed out"
                );
                false
            }
        };

        let was_alive = backend.is_alive();
        backend.record(
            if healthy { Outcome::Success } else { Outcome::Failure },
            Source::Probe,
        );
        let alive = backend.is_alive();
        if was_alive && !alive {
            warn!(
                prefix = %backend.service_prefix(),
                backend = %backend.url(),
                consecutive_failures = backend.counts(Source::Probe).consecutive_failures(),
                "health: backend marked down"
            );
        } else if !was_alive && alive {
            info!(
                prefix = %backend.service_prefix(),
                backend = %backend.url(),
                "health: backend back up"
            );
        }

        metrics::counter!(
            "router_health_check_total",
            "pool" => backend.service_prefix().to_string(),
            "result" => if healthy { "success" } else { "failure" }
        )
        .increment(1);
        metrics::histogram!("router_health_check_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        metrics::gauge!(
            "router_backend_alive",
            "pool" => backend.service_prefix().to_string(),
            "backend" => backend.url().to_string()
        )
        .set(if alive { 1.0 } else { 0.0 });

        self.registry.store().save(backend).await;
        healthy
    }

    async fn probe(&self, backend: &Backend) -> Result<(), String> {
        match backend.health_check().kind {
            HealthCheckType::Tcp => {
                let addr = backend.socket_addr();
                let stream = TcpStream::connect(&addr)
                    .await
                    .map_err(|e| format!("dial {}: {}", addr, e))?;
                drop(stream);
                Ok(())
            }
            HealthCheckType::Http => {
                let url = backend.health_url();
                let resp = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| format!("GET {}: {}", url, e))?;
                if resp.status() == reqwest::StatusCode::OK {
                    Ok(())
                } else {
                    Err(format!("GET {}: status {}", url, resp.status()))
                }
            }
        }
    }
}

/// Shared HTTP client for probes. Proxies from the environment are ignored
/// and `Accept-Encoding` is never sent.
pub fn build_health_check_client(timeout: Duration) -> Result<reqwest::Client, RouterError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .no_proxy()
        .build()
        .map_err(|e| RouterError::generic("failed to build health check client", e))
}
