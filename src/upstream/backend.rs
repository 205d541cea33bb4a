use http::Uri;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use super::counts::{Counts, Outcome};
use crate::config::{HealthCheckTarget, HealthCheckType, ServerConfig};
use crate::error::RouterError;
use crate::store::HealthRecord;

/// Consecutive failures (on either source) after which a backend is skipped.
pub const FAILURE_THRESHOLD: u32 = 3;

/// Which [`Counts`] an outcome belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Live traffic forwarded by the proxy.
    Request,
    /// Synthetic health check.
    Probe,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Request => "request",
            Source::Probe => "probe",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    #[serde(rename = "type", default)]
    pub kind: HealthCheckType,
    #[serde(default)]
    pub endpoint: String,
}

impl From<&HealthCheckTarget> for HealthCheckSpec {
    fn from(t: &HealthCheckTarget) -> Self {
        Self {
            kind: t.check_type,
            endpoint: t.endpoint.clone(),
        }
    }
}

/// One upstream instance and its live health counters.
#[derive(Debug)]
pub struct Backend {
    service_prefix: String,
    /// Base URL without trailing slash.
    url: String,
    uri: Uri,
    zone: String,
    health_check: HealthCheckSpec,
    request_counts: Counts,
    probe_counts: Counts,
    updated_at: Mutex<SystemTime>,
}

impl Backend {
    pub fn new(
        service_prefix: impl Into<String>,
        url: &str,
        zone: impl Into<String>,
        health_check: HealthCheckSpec,
    ) -> Result<Self, RouterError> {
        let url = url.trim().trim_end_matches('/').to_string();
        let uri: Uri = url
            .parse()
            .map_err(|e| RouterError::generic(format!("invalid backend url \"{}\"", url), e))?;
        if uri.scheme().is_none() || uri.authority().is_none() {
            return Err(RouterError::generic(
                format!("invalid backend url \"{}\"", url),
                "scheme and host are required",
            ));
        }
        Ok(Self {
            service_prefix: service_prefix.into(),
            url,
            uri,
            zone: zone.into(),
            health_check,
            request_counts: Counts::new(),
            probe_counts: Counts::new(),
            updated_at: Mutex::new(SystemTime::now()),
        })
    }

    pub fn from_config(server: &ServerConfig) -> Result<Self, RouterError> {
        Self::new(
            server.service_prefix.clone(),
            &server.endpoint_url,
            server.zone.clone(),
            HealthCheckSpec::from(&server.healthcheck),
        )
    }

    pub fn service_prefix(&self) -> &str {
        &self.service_prefix
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn health_check(&self) -> &HealthCheckSpec {
        &self.health_check
    }

    pub fn counts(&self, source: Source) -> &Counts {
        match source {
            Source::Request => &self.request_counts,
            Source::Probe => &self.probe_counts,
        }
    }

    pub fn updated_at(&self) -> SystemTime {
        *self.updated_at.lock()
    }

    /// Count one outcome and bump the last-updated timestamp.
    pub fn record(&self, outcome: Outcome, source: Source) {
        self.counts(source).record(outcome);
        *self.updated_at.lock() = SystemTime::now();
    }

    pub fn is_alive(&self) -> bool {
        self.request_counts.consecutive_failures() < FAILURE_THRESHOLD
            && self.probe_counts.consecutive_failures() < FAILURE_THRESHOLD
    }

    /// `host:port` dialed by TCP probes. Without an explicit port, 443 for
    /// https and 80 otherwise.
    pub fn socket_addr(&self) -> String {
        let host = self.uri.host().unwrap_or_default();
        let port = self.uri.port_u16().unwrap_or_else(|| {
            if self.uri.scheme_str() == Some("https") {
                443
            } else {
                80
            }
        });
        format!("{}:{}", host, port)
    }

    /// URL GET by HTTP probes.
    pub fn health_url(&self) -> &str {
        if self.health_check.endpoint.is_empty() {
            &self.url
        } else {
            &self.health_check.endpoint
        }
    }

    /// Base URL + `rest` (the path after the service prefix) + optional query.
    pub fn target_url(&self, rest: &str, query: Option<&str>) -> String {
        let mut target = String::with_capacity(self.url.len() + rest.len() + 16);
        target.push_str(&self.url);
        if !rest.is_empty() && !rest.starts_with('/') {
            target.push('/');
        }
        target.push_str(rest);
        if let Some(q) = query.filter(|q| !q.is_empty()) {
            target.push('?');
            target.push_str(q);
        }
        target
    }

    pub fn to_record(&self) -> HealthRecord {
        HealthRecord {
            service_prefix: self.service_prefix.clone(),
            url: self.url.clone(),
            zone: self.zone.clone(),
            health_check: Some(self.health_check.clone()),
            alive: self.is_alive(),
            request_counts: self.request_counts.snapshot(),
            probe_counts: self.probe_counts.snapshot(),
            updated_at: humantime::format_rfc3339_millis(self.updated_at()).to_string(),
            reporter: String::new(),
        }
    }

    /// Overwrite both Counts (and the timestamp, when parseable) from a stored
    /// record. Returns `false` and leaves the backend untouched when the record
    /// describes a different URL.
    pub fn apply_record(&self, record: &HealthRecord) -> bool {
        if record.url.trim_end_matches('/') != self.url {
            return false;
        }
        self.request_counts.restore(record.request_counts);
        self.probe_counts.restore(record.probe_counts);
        if let Ok(ts) = humantime::parse_rfc3339_weak(&record.updated_at) {
            *self.updated_at.lock() = ts;
        }
        true
    }
}
