pub mod etcd;
pub mod types;


pub use types::*;

use anyhow::Result;
use std::collections::HashSet;
use std::path::Path;

impl RouterConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides for infrastructure settings. When the file does not
    /// exist, built-in defaults are used.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: RouterConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::parse(&content, path.extension().and_then(|e| e.to_str()))?
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            RouterConfig::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());

        config.validate()?;
        tracing::info!(
            servers = config.servers.len(),
            store = ?config.health_store.backend,
            discovery = config.discovery.enabled,
            "loaded router configuration"
        );
        Ok(config)
    }

    /// Parse a config document; `ext` selects the format.
    pub fn parse(content: &str, ext: Option<&str>) -> Result<Self> {
        Ok(match ext {
            Some("toml") => toml::from_str(content)?,
            Some("json") => serde_json::from_str(content)?,
            Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
            None => anyhow::bail!("config file has no extension, use .toml or .json"),
        })
    }

    /// Apply `ROUTER_*` overrides for connection/infra settings. The backend
    /// list itself comes from the config file or etcd discovery only.
    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // etcd
        if let Some(v) = var("ROUTER_ETCD_ENDPOINTS") {
            self.etcd.endpoints = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = var("ROUTER_ETCD_USERNAME") {
            self.etcd.username = Some(v);
        }
        if let Some(v) = var("ROUTER_ETCD_PASSWORD") {
            self.etcd.password = Some(v);
        }

        // health store
        if let Some(v) = var("ROUTER_HEALTH_STORE_BACKEND") {
            match v.as_str() {
                "memory" => self.health_store.backend = StoreBackend::Memory,
                "etcd" => self.health_store.backend = StoreBackend::Etcd,
                other => tracing::warn!("ignoring ROUTER_HEALTH_STORE_BACKEND={}", other),
            }
        }
        if let Some(v) = var("ROUTER_HEALTH_STORE_KEY_PREFIX") {
            self.health_store.key_prefix = v;
        }

        // discovery
        if let Some(v) = var("ROUTER_DISCOVERY_ENABLED") {
            self.discovery.enabled = v == "true" || v == "1";
        }
        if let Some(v) = var("ROUTER_DISCOVERY_PREFIX") {
            self.discovery.prefix = v;
        }

        // health checks
        if let Some(v) = var("ROUTER_HEALTH_CHECK_INTERVAL") {
            if let Ok(n) = v.parse::<u64>() {
                self.health_check.interval = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen: HashSet<(&str, &str)> = HashSet::new();
        for (i, server) in self.servers.iter().enumerate() {
            let prefix = server.service_prefix.as_str();
            if prefix.is_empty() {
                anyhow::bail!("servers[{}]: service_prefix is empty", i);
            }
            if prefix.contains('/') {
                anyhow::bail!("servers[{}]: service_prefix '{}' must not contain '/'", i, prefix);
            }
            validate_url(&server.endpoint_url)
                .map_err(|e| anyhow::anyhow!("servers[{}] ('{}'): endpoint_url {}", i, prefix, e))?;
            if server.healthcheck.check_type == HealthCheckType::Http
                && !server.healthcheck.endpoint.is_empty()
            {
                validate_url(&server.healthcheck.endpoint).map_err(|e| {
                    anyhow::anyhow!("servers[{}] ('{}'): healthcheck endpoint {}", i, prefix, e)
                })?;
            }
            if !seen.insert((prefix, server.endpoint_url.trim_end_matches('/'))) {
                anyhow::bail!(
                    "servers[{}]: duplicate backend '{}' for '{}'",
                    i,
                    server.endpoint_url,
                    prefix
                );
            }
        }

        if self.needs_etcd() && self.etcd.endpoints.is_empty() {
            anyhow::bail!("etcd endpoints are required by the etcd health store or discovery");
        }
        if self.health_store.key_prefix.is_empty() {
            anyhow::bail!("health_store.key_prefix must not be empty");
        }
        if !positive_secs(self.etcd.dial_timeout) || !positive_secs(self.etcd.request_timeout) {
            anyhow::bail!("etcd dial_timeout and request_timeout must be positive");
        }
        if !positive_secs(self.health_store.timeout) {
            anyhow::bail!("health_store.timeout must be positive");
        }
        if self.health_check.interval == 0 {
            anyhow::bail!("health_check.interval must be at least 1 second");
        }
        if !positive_secs(self.health_check.timeout) {
            anyhow::bail!("health_check.timeout must be positive");
        }
        if !positive_secs(self.forwarder.request_timeout)
            || !positive_secs(self.forwarder.connect_timeout)
        {
            anyhow::bail!("forwarder timeouts must be positive");
        }
        if http::HeaderName::from_bytes(self.forwarder.trace_header.as_bytes()).is_err() {
            anyhow::bail!(
                "forwarder.trace_header '{}' is not a valid header name",
                self.forwarder.trace_header
            );
        }
        Ok(())
    }

    /// Whether an etcd connection has to be opened at startup.
    pub fn needs_etcd(&self) -> bool {
        self.health_store.backend == StoreBackend::Etcd || self.discovery.enabled
    }
}

/// Usable as `Duration::from_secs_f64`: finite and above zero.
fn positive_secs(secs: f64) -> bool {
    secs.is_finite() && secs > 0.0
}

/// Absolute http(s) URL with a host.
pub(crate) fn validate_url(url: &str) -> Result<()> {
    let uri: http::Uri = url
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("'{}' is not a valid URL: {}", url, e))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => anyhow::bail!("'{}' must use http or https", url),
    }
    if uri.host().map(str::is_empty).unwrap_or(true) {
        anyhow::bail!("'{}' has no host", url);
    }
    Ok(())
}
