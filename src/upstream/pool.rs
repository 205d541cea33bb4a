use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::backend::Backend;
use crate::error::RouterError;
use crate::store::HealthStateStore;

/// Backends serving one service prefix (or one zone) plus the round-robin
/// cursor.
///
/// Membership is fixed once the pool is handed to the registry; only the
/// cursor and the backends' counters change afterwards.
pub struct ServerPool {
    name: String,
    backends: Vec<Arc<Backend>>,
    cursor: AtomicU64,
    store: Arc<HealthStateStore>,
}

impl ServerPool {
    pub fn new(name: impl Into<String>, store: Arc<HealthStateStore>) -> Self {
        Self {
            name: name.into(),
            backends: Vec::new(),
            cursor: AtomicU64::new(0),
            store,
        }
    }

    pub(crate) fn push(&mut self, backend: Arc<Backend>) {
        self.backends.push(backend);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn store(&self) -> &Arc<HealthStateStore> {
        &self.store
    }

    /// Failure-aware round robin: start at the cursor, return the first
    /// backend that is alive after a read-through refresh.
    pub async fn select_backend(&self) -> Result<Arc<Backend>, RouterError> {
        self.select_backend_excluding(&[]).await
    }

    /// Same as [`select_backend`](Self::select_backend) but never returns a
    /// backend contained in `tried`.
    pub async fn select_backend_excluding(
        &self,
        tried: &[Arc<Backend>],
    ) -> Result<Arc<Backend>, RouterError> {
        let len = self.backends.len();
        if len == 0 {
            return Err(RouterError::no_backend_available(&self.name));
        }

        let ticket = self.cursor.fetch_add(1, Ordering::Relaxed);
        let next = (ticket % len as u64) as usize;

        for offset in 0..len {
            let idx = (next + offset) % len;
            let candidate = &self.backends[idx];
            if tried.iter().any(|t| Arc::ptr_eq(t, candidate)) {
                continue;
            }

            self.store.refresh(candidate).await;
            if !candidate.is_alive() {
                continue;
            }

            if offset > 0 {
                // Resume after the chosen backend. Losing this race to a
                // concurrent selector is harmless.
                let _ = self.cursor.compare_exchange(
                    ticket + 1,
                    ticket + 1 + offset as u64,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
            }
            return Ok(candidate.clone());
        }

        metrics::counter!("router_selection_failures_total", "pool" => self.name.clone())
            .increment(1);
        Err(RouterError::no_backend_available(&self.name))
    }
}
