use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// Treat JSON `null` like a missing field (`T::default()`). Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level router configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub app: AppConfig,

    #[serde(default)]
    pub etcd: EtcdConfig,

    /// Where backend health records are shared between router instances.
    #[serde(default)]
    pub health_store: HealthStoreConfig,

    /// Backend lists published in etcd under a prefix key.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub forwarder: ForwarderConfig,

    /// Static backend list. Entries sharing a `service_prefix` form one pool,
    /// in declaration order.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,

    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            listen: default_listen(),
            admin_listen: default_admin_listen(),
        }
    }
}

fn default_app_name() -> String {
    "upstream-router".to_string()
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_admin_listen() -> String {
    "0.0.0.0:9091".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    #[serde(default = "default_etcd_endpoints")]
    pub endpoints: Vec<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Connect timeout (seconds).
    #[serde(default = "default_etcd_dial_timeout")]
    pub dial_timeout: f64,

    /// Whole-request timeout (seconds), independent of any inbound deadline.
    #[serde(default = "default_etcd_request_timeout")]
    pub request_timeout: f64,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: default_etcd_endpoints(),
            username: None,
            password: None,
            dial_timeout: default_etcd_dial_timeout(),
            request_timeout: default_etcd_request_timeout(),
        }
    }
}

impl EtcdConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.dial_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout)
    }
}

fn default_etcd_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}

fn default_etcd_dial_timeout() -> f64 {
    2.0
}

fn default_etcd_request_timeout() -> f64 {
    10.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local map. Health state is not shared between instances.
    #[default]
    Memory,
    /// etcd v3 via the HTTP/JSON gateway.
    Etcd,
}

/// How the health-record key is derived for a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyScope {
    /// `<prefix>-<service>-<url>` when the backend has a zone, else `<prefix>-<service>`.
    #[default]
    Auto,
    /// Always `<prefix>-<service>`.
    Pool,
    /// Always `<prefix>-<service>-<url>`.
    Backend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default)]
    pub key_scope: KeyScope,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound for a single get/put against the store (seconds).
    #[serde(default = "default_etcd_request_timeout")]
    pub timeout: f64,
}

impl Default for HealthStoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            key_scope: KeyScope::default(),
            key_prefix: default_key_prefix(),
            timeout: default_etcd_request_timeout(),
        }
    }
}

impl HealthStoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }
}

fn default_key_prefix() -> String {
    "servers".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Each key `<prefix><service>` holds a comma-separated list of backend URLs.
    #[serde(default = "default_discovery_prefix")]
    pub prefix: String,

    /// Probe type assigned to discovered backends.
    #[serde(default)]
    pub health_check_type: HealthCheckType,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prefix: default_discovery_prefix(),
            health_check_type: HealthCheckType::default(),
        }
    }
}

fn default_discovery_prefix() -> String {
    "/services/prefix/".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between probe ticks.
    #[serde(default = "default_hc_interval")]
    pub interval: u64,

    /// Per-probe timeout (seconds). Clamped to the interval at runtime.
    #[serde(default = "default_hc_timeout")]
    pub timeout: f64,

    /// Prevents probe storms when a pool has many backends.
    #[serde(default = "default_hc_concurrency")]
    pub concurrency: usize,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_hc_interval(),
            timeout: default_hc_timeout(),
            concurrency: default_hc_concurrency(),
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout).min(self.interval())
    }
}

fn default_hc_interval() -> u64 {
    10
}

fn default_hc_timeout() -> f64 {
    2.0
}

fn default_hc_concurrency() -> usize {
    32
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    /// Extra attempts after the first one, each against a backend not yet tried.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed wait before each retry (milliseconds).
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Upstream connect timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f64,

    /// Upper bound for one upstream attempt, response body included (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout: f64,

    /// Verify upstream certificates. Off by default.
    #[serde(default)]
    pub tls_verify: bool,

    #[serde(default = "default_trace_header")]
    pub trace_header: String,

    #[serde(default)]
    pub keepalive_pool: KeepalivePoolConfig,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            tls_verify: false,
            trace_header: default_trace_header(),
            keepalive_pool: KeepalivePoolConfig::default(),
        }
    }
}

impl ForwarderConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout)
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    10
}

fn default_connect_timeout() -> f64 {
    2.0
}

fn default_request_timeout() -> f64 {
    30.0
}

fn default_trace_header() -> String {
    "x-trace-id".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeepalivePoolConfig {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    #[serde(default = "default_pool_size")]
    pub size: usize,
}

impl Default for KeepalivePoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            size: default_pool_size(),
        }
    }
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_pool_size() -> usize {
    64
}

/// One backend instance registered under a service prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub service_prefix: String,

    #[serde(default)]
    pub server_name: String,

    /// Base URL requests are forwarded to, e.g. `http://10.0.0.1:8080`.
    pub endpoint_url: String,

    /// Deployment zone. Also selects per-backend health-record keys (`KeyScope::Auto`).
    #[serde(default, alias = "zone_aws")]
    pub zone: String,

    #[serde(default)]
    pub healthcheck: HealthCheckTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckType {
    /// TCP connect to the backend's host:port.
    #[default]
    Tcp,
    /// GET the health endpoint, expecting 200.
    Http,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckTarget {
    #[serde(rename = "type", default)]
    pub check_type: HealthCheckType,

    /// Full URL for `http` probes. Empty means the backend's own URL.
    #[serde(default)]
    pub endpoint: String,
}
