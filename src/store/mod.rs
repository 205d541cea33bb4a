pub mod etcd;
pub mod memory;
pub mod record;

pub use etcd::EtcdKvStore;
pub use memory::MemoryKvStore;
pub use record::HealthRecord;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{HealthStoreConfig, KeyScope};
use crate::error::RouterError;
use crate::upstream::Backend;

/// Raw string key-value store holding health records.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<String>, RouterError>;

    async fn put(&self, key: &str, value: String) -> Result<(), RouterError>;

    /// Short label for logs and metrics.
    fn kind(&self) -> &'static str;
}

/// Read-through / write-through bridge between in-memory [`Backend`] state
/// and a shared [`KvStore`].
///
/// Failures never reach the forwarding path: a failed read leaves the
/// in-memory counters in charge, a failed write is logged and dropped.
pub struct HealthStateStore {
    kv: Arc<dyn KvStore>,
    key_prefix: String,
    key_scope: KeyScope,
    timeout: Duration,
    reporter: String,
}

impl HealthStateStore {
    pub fn new(kv: Arc<dyn KvStore>, cfg: &HealthStoreConfig, reporter: impl Into<String>) -> Self {
        Self {
            kv,
            key_prefix: cfg.key_prefix.clone(),
            key_scope: cfg.key_scope,
            timeout: cfg.timeout(),
            reporter: reporter.into(),
        }
    }

    /// Process-local store with default settings.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryKvStore::new()),
            &HealthStoreConfig::default(),
            generate_instance_id(),
        )
    }

    pub fn reporter(&self) -> &str {
        &self.reporter
    }

    pub fn backend_kind(&self) -> &'static str {
        self.kv.kind()
    }

    /// `<prefix>-<service>` or `<prefix>-<service>-<url>`, see [`KeyScope`].
    pub fn key_for(&self, backend: &Backend) -> String {
        let per_backend = match self.key_scope {
            KeyScope::Auto => !backend.zone().is_empty(),
            KeyScope::Pool => false,
            KeyScope::Backend => true,
        };
        if per_backend {
            format!(
                "{}-{}-{}",
                self.key_prefix,
                backend.service_prefix(),
                backend.url()
            )
        } else {
            format!("{}-{}", self.key_prefix, backend.service_prefix())
        }
    }

    /// Fetch and decode one record. A missing key is `NotFound`; transport
    /// errors, timeouts and undecodable values are `Integration`.
    pub async fn get(&self, key: &str) -> Result<HealthRecord, RouterError> {
        let raw = match tokio::time::timeout(self.timeout, self.kv.get(key)).await {
            Ok(res) => res?,
            Err(_) => {
                return Err(RouterError::integration(
                    format!("health store get \"{}\" failed", key),
                    format!("timed out after {:?}", self.timeout),
                ))
            }
        };
        let raw = raw.ok_or_else(|| RouterError::not_found(format!("key \"{}\" not found", key)))?;
        serde_json::from_str(&raw).map_err(|e| {
            RouterError::integration(format!("health store value at \"{}\" is not a record", key), e)
        })
    }

    pub async fn put(&self, key: &str, record: &HealthRecord) -> Result<(), RouterError> {
        let value = serde_json::to_string(record)
            .map_err(|e| RouterError::generic("failed to encode health record", e))?;
        match tokio::time::timeout(self.timeout, self.kv.put(key, value)).await {
            Ok(res) => res,
            Err(_) => Err(RouterError::integration(
                format!("health store put \"{}\" failed", key),
                format!("timed out after {:?}", self.timeout),
            )),
        }
    }

    /// Overwrite the backend's counters from the store. Returns `true` when a
    /// matching record was applied. Misses, errors and records describing a
    /// different URL leave the backend as it is.
    pub async fn refresh(&self, backend: &Backend) -> bool {
        let key = self.key_for(backend);
        match self.get(&key).await {
            Ok(record) => {
                let applied = backend.apply_record(&record);
                if !applied {
                    debug!(
                        key = %key,
                        backend = %backend.url(),
                        record_url = %record.url,
                        "store: record belongs to another backend, ignored"
                    );
                }
                applied
            }
            Err(e) if e.is_not_found() => false,
            Err(e) => {
                metrics::counter!("router_store_errors_total", "op" => "get").increment(1);
                warn!(key = %key, error = %e, "store: read failed, using in-memory state");
                false
            }
        }
    }

    /// Mirror the backend's current state to the store. Errors are logged and
    /// dropped.
    pub async fn save(&self, backend: &Backend) {
        let key = self.key_for(backend);
        let mut record = backend.to_record();
        record.reporter = self.reporter.clone();
        if let Err(e) = self.put(&key, &record).await {
            metrics::counter!("router_store_errors_total", "op" => "put").increment(1);
            warn!(key = %key, error = %e, "store: write failed, dropped");
        }
    }
}

/// `<hostname>-<8 hex digits>`, unique per process start.
pub fn generate_instance_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let rand_suffix: u32 = rand::random();
    format!("{}-{:08x}", hostname, rand_suffix)
}
