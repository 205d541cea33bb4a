use anyhow::Result;
use std::collections::HashSet;
use tracing::{info, warn};

use crate::config::{validate_url, DiscoveryConfig, HealthCheckTarget, ServerConfig};
use crate::etcd::EtcdClient;

/// Read every `<prefix><service>` key and turn its comma-separated URL list
/// into backends of pool `<service>`.
pub async fn load_discovered_servers(
    client: &EtcdClient,
    cfg: &DiscoveryConfig,
) -> Result<Vec<ServerConfig>> {
    let prefix = normalize_prefix(&cfg.prefix);
    let entries = client.get_prefix(&prefix).await?;
    let servers = parse_discovered(&prefix, &entries, cfg);
    info!(
        "etcd: discovery loaded, prefix={}, keys={}, backends={}",
        prefix,
        entries.len(),
        servers.len()
    );
    Ok(servers)
}

/// Pure half of [`load_discovered_servers`].
pub fn parse_discovered(
    prefix: &str,
    entries: &[(String, String)],
    cfg: &DiscoveryConfig,
) -> Vec<ServerConfig> {
    let mut out = Vec::new();
    for (key, value) in entries {
        let service = key.strip_prefix(prefix).unwrap_or(key).trim_matches('/');
        if service.is_empty() || service.contains('/') {
            warn!("etcd: discovery key skipped, key={}", key);
            continue;
        }
        for url in value.split(',').map(str::trim).filter(|u| !u.is_empty()) {
            if let Err(e) = validate_url(url) {
                warn!(
                    "etcd: discovery url skipped, service={}, error={}",
                    service, e
                );
                continue;
            }
            out.push(ServerConfig {
                service_prefix: service.to_string(),
                server_name: String::new(),
                endpoint_url: url.to_string(),
                zone: String::new(),
                healthcheck: HealthCheckTarget {
                    check_type: cfg.health_check_type,
                    endpoint: String::new(),
                },
            });
        }
    }
    out
}

/// Static servers first, then discovered ones not already declared.
pub fn merge_servers(
    static_servers: &[ServerConfig],
    discovered: Vec<ServerConfig>,
) -> Vec<ServerConfig> {
    let mut seen: HashSet<(String, String)> = static_servers
        .iter()
        .map(|s| {
            (
                s.service_prefix.clone(),
                s.endpoint_url.trim_end_matches('/').to_string(),
            )
        })
        .collect();
    let mut merged = static_servers.to_vec();
    for s in discovered {
        let key = (
            s.service_prefix.clone(),
            s.endpoint_url.trim_end_matches('/').to_string(),
        );
        if seen.insert(key) {
            merged.push(s);
        }
    }
    merged
}

/// Ensure the prefix ends with exactly one `/`.
pub fn normalize_prefix(prefix: &str) -> String {
    format!("{}/", prefix.trim_end_matches('/'))
}
