//! Authoritative registry of backend endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use super::backend::{BackendSlot, BackendSnapshot, BackendSpec, BackendState};
use super::error::{PoolError, PoolResult};

/// Owns every [`BackendSpec`] registered with the system and is the only
/// place backend counters and states mutate. Listings are immutable
/// snapshots sorted by id so selection strategies see a stable order.
#[derive(Default)]
pub struct BackendPool {
    backends: RwLock<HashMap<String, Arc<BackendSlot>>>,
}

impl BackendPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a backend. New backends start `Online`.
    pub fn add(&self, spec: BackendSpec) -> PoolResult<()> {
        if spec.id.is_empty() {
            return Err(PoolError::InvalidSpec {
                reason: "backend id must be non-empty".to_string(),
            });
        }
        if spec.weight < 1 {
            return Err(PoolError::InvalidSpec {
                reason: format!("backend {} weight must be >= 1", spec.id),
            });
        }
        if spec.max_inflight < 1 {
            return Err(PoolError::InvalidSpec {
                reason: format!("backend {} max_inflight must be >= 1", spec.id),
            });
        }

        let mut backends = self.backends.write();
        if backends.contains_key(&spec.id) {
            return Err(PoolError::DuplicateBackend {
                id: spec.id.clone(),
            });
        }
        info!(backend = %spec.id, address = %spec.address, "backend registered");
        backends.insert(spec.id.clone(), Arc::new(BackendSlot::new(spec)));
        Ok(())
    }

    /// Deregisters a backend.
    pub fn remove(&self, id: &str) -> PoolResult<()> {
        match self.backends.write().remove(id) {
            Some(_) => {
                info!(backend = %id, "backend removed");
                Ok(())
            }
            None => Err(PoolError::UnknownBackend { id: id.to_string() }),
        }
    }

    /// Snapshot of every backend, sorted by id.
    pub fn list(&self) -> Vec<BackendSnapshot> {
        let mut all: Vec<BackendSnapshot> = self
            .backends
            .read()
            .values()
            .map(|slot| slot.snapshot())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Snapshot of backends currently `Online`, sorted by id.
    pub fn list_online(&self) -> Vec<BackendSnapshot> {
        let mut online: Vec<BackendSnapshot> = self
            .backends
            .read()
            .values()
            .filter(|slot| slot.state() == BackendState::Online)
            .map(|slot| slot.snapshot())
            .collect();
        online.sort_by(|a, b| a.id.cmp(&b.id));
        online
    }

    /// Snapshot of one backend.
    pub fn snapshot(&self, id: &str) -> Option<BackendSnapshot> {
        self.backends.read().get(id).map(|slot| slot.snapshot())
    }

    /// Attempts to take an inflight slot on `id`. Returns `Ok(false)` when
    /// the backend is saturated or not online.
    pub fn reserve(&self, id: &str) -> PoolResult<bool> {
        Ok(self.slot(id)?.reserve())
    }

    /// Returns a slot taken by [`BackendPool::reserve`], recording latency
    /// and outcome.
    pub fn release(&self, id: &str, latency_ms: u64, ok: bool) -> PoolResult<()> {
        self.slot(id)?.release(latency_ms, ok);
        Ok(())
    }

    /// Operator state override, e.g. for maintenance windows.
    pub fn set_state(&self, id: &str, state: BackendState) -> PoolResult<()> {
        self.slot(id)?.set_state(state);
        Ok(())
    }

    /// Feeds a health-check observation into the backend's state machine.
    pub fn record_health_check(&self, id: &str, ok: bool) -> PoolResult<()> {
        self.slot(id)?.record_health_check(ok);
        Ok(())
    }

    fn slot(&self, id: &str) -> PoolResult<Arc<BackendSlot>> {
        self.backends
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| PoolError::UnknownBackend { id: id.to_string() })
    }
}

impl std::fmt::Debug for BackendPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendPool")
            .field("backends", &self.backends.read().len())
            .finish()
    }
}
