use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::backend::Backend;
use super::pool::ServerPool;
use crate::config::ServerConfig;
use crate::error::RouterError;
use crate::store::HealthStateStore;

/// Service prefix → pool and zone → pool. Built once at startup and shared
/// read-only by the forwarder, the prober and the admin API.
///
/// Zone pools hold the same `Arc<Backend>`s as the prefix pools, so an
/// outcome recorded through one is visible through the other.
pub struct PoolRegistry {
    by_prefix: BTreeMap<String, Arc<ServerPool>>,
    by_zone: BTreeMap<String, Arc<ServerPool>>,
    store: Arc<HealthStateStore>,
}

impl PoolRegistry {
    /// Group backends into pools, keeping declaration order inside each pool.
    /// A second backend with the same prefix and URL is dropped.
    pub fn build(backends: Vec<Backend>, store: Arc<HealthStateStore>) -> Self {
        let mut by_prefix: BTreeMap<String, ServerPool> = BTreeMap::new();
        let mut by_zone: BTreeMap<String, ServerPool> = BTreeMap::new();

        for backend in backends {
            let pool = by_prefix
                .entry(backend.service_prefix().to_string())
                .or_insert_with(|| ServerPool::new(backend.service_prefix(), store.clone()));
            if pool.backends().iter().any(|b| b.url() == backend.url()) {
                warn!(
                    prefix = %backend.service_prefix(),
                    url = %backend.url(),
                    "registry: duplicate backend ignored"
                );
                continue;
            }

            let backend = Arc::new(backend);
            pool.push(backend.clone());

            if !backend.zone().is_empty() {
                by_zone
                    .entry(backend.zone().to_string())
                    .or_insert_with(|| ServerPool::new(backend.zone(), store.clone()))
                    .push(backend);
            }
        }

        let registry = Self {
            by_prefix: by_prefix.into_iter().map(|(k, v)| (k, Arc::new(v))).collect(),
            by_zone: by_zone.into_iter().map(|(k, v)| (k, Arc::new(v))).collect(),
            store,
        };
        info!(
            pools = registry.by_prefix.len(),
            zones = registry.by_zone.len(),
            backends = registry.backend_count(),
            "registry: built"
        );
        registry
    }

    pub fn from_servers(
        servers: &[ServerConfig],
        store: Arc<HealthStateStore>,
    ) -> Result<Self, RouterError> {
        let backends = servers
            .iter()
            .map(Backend::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::build(backends, store))
    }

    pub fn pool(&self, prefix: &str) -> Option<&Arc<ServerPool>> {
        self.by_prefix.get(prefix)
    }

    pub fn zone_pool(&self, zone: &str) -> Option<&Arc<ServerPool>> {
        self.by_zone.get(zone)
    }

    /// Prefix pools, ordered by name.
    pub fn pools(&self) -> impl Iterator<Item = &Arc<ServerPool>> {
        self.by_prefix.values()
    }

    pub fn zone_pools(&self) -> impl Iterator<Item = &Arc<ServerPool>> {
        self.by_zone.values()
    }

    /// Every backend exactly once (zone pools are not walked).
    pub fn backends(&self) -> impl Iterator<Item = &Arc<Backend>> {
        self.by_prefix.values().flat_map(|p| p.backends().iter())
    }

    pub fn backend_count(&self) -> usize {
        self.by_prefix.values().map(|p| p.len()).sum()
    }

    pub fn store(&self) -> &Arc<HealthStateStore> {
        &self.store
    }

    /// Load persisted counters for every backend. Backends without a record
    /// keep fresh counters.
    pub async fn seed_from_store(&self) -> usize {
        let mut seeded = 0;
        for backend in self.backends() {
            if self.store.refresh(backend).await {
                seeded += 1;
            }
        }
        info!(
            seeded,
            total = self.backend_count(),
            store = self.store.backend_kind(),
            "registry: seeded health state"
        );
        seeded
    }
}
