pub mod backend;
pub mod client;
pub mod counts;
pub mod health;
pub mod pool;
pub mod registry;

pub use backend::{Backend, HealthCheckSpec, Source, FAILURE_THRESHOLD};
pub use client::{build_upstream_client, UpstreamClient};
pub use counts::{Counts, CountsSnapshot, Outcome};
pub use health::{build_health_check_client, HealthProber, ProbeRound};
pub use pool::ServerPool;
pub use registry::PoolRegistry;
