use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::RouterConfig;
use crate::error::RouterError;
use crate::metrics::Metrics;
use crate::proxy::RequestForwarder;
use crate::upstream::PoolRegistry;

/// Shared router state, cheaply cloneable.
///
/// Everything behind it is fixed after startup except the readiness flag.
#[derive(Clone)]
pub struct RouterState {
    pub config: Arc<RouterConfig>,
    pub registry: Arc<PoolRegistry>,
    pub forwarder: Arc<RequestForwarder>,
    /// `None` when no global recorder was installed (embedded use, tests).
    pub metrics: Option<Metrics>,
    ready: Arc<AtomicBool>,
}

impl RouterState {
    pub fn new(
        config: RouterConfig,
        registry: Arc<PoolRegistry>,
        metrics: Option<Metrics>,
    ) -> Result<Self, RouterError> {
        let forwarder = RequestForwarder::new(&config.forwarder)?;
        Ok(Self {
            config: Arc::new(config),
            registry,
            forwarder: Arc::new(forwarder),
            metrics,
            ready: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }
}
