//! Backend state and per-backend counters.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Consecutive failed checks that demote `Online` to `Degraded`.
pub const ONLINE_TO_DEGRADED_FAILS: u32 = 3;
/// Additional consecutive failures that demote `Degraded` to `Offline`.
pub const DEGRADED_TO_OFFLINE_FAILS: u32 = 5;
/// Consecutive successes that promote `Degraded` back to `Online`.
pub const DEGRADED_TO_ONLINE_OKS: u32 = 3;
/// Successes that promote `Offline` back to `Degraded`.
pub const OFFLINE_TO_DEGRADED_OKS: u32 = 1;

/// Reachability state of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    /// Serving traffic.
    Online,
    /// Failing health checks; kept out of selection until it recovers.
    Degraded,
    /// Considered dead; only health checks reach it.
    Offline,
    /// Operator-parked; untouched by automatic transitions.
    Maintenance,
}

impl BackendState {
    /// Stable lowercase name.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::Online => "online",
            BackendState::Degraded => "degraded",
            BackendState::Offline => "offline",
            BackendState::Maintenance => "maintenance",
        }
    }
}

impl std::fmt::Display for BackendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of a backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSpec {
    /// Unique identifier.
    pub id: String,
    /// Reachable address, e.g. `http://10.0.0.5:11434`.
    pub address: String,
    /// Relative weight for the `weighted` strategy; at least 1.
    pub weight: u32,
    /// Reservation capacity; at least 1.
    pub max_inflight: u32,
}

impl BackendSpec {
    /// Creates a spec with weight 1 and the given capacity.
    pub fn new(id: impl Into<String>, address: impl Into<String>, max_inflight: u32) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            weight: 1,
            max_inflight,
        }
    }

    /// Sets the selection weight.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

/// Immutable view of a backend, returned by pool listings.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendSnapshot {
    /// Unique identifier.
    pub id: String,
    /// Reachable address.
    pub address: String,
    /// Selection weight.
    pub weight: u32,
    /// Reservation capacity.
    pub max_inflight: u32,
    /// Current state.
    pub state: BackendState,
    /// Unreleased reservations.
    pub inflight: u32,
    /// Completed calls, successes and failures combined.
    pub total: u64,
    /// Failed calls.
    pub failures: u64,
    /// Rolling mean latency; zero until the first sample.
    pub mean_latency_ms: f64,
    /// Consecutive successful health checks.
    pub consecutive_ok: u32,
    /// Consecutive failed health checks.
    pub consecutive_fail: u32,
    /// When the last health check ran.
    pub last_check_at: Option<Instant>,
}

struct HealthState {
    state: BackendState,
    consecutive_ok: u32,
    consecutive_fail: u32,
    last_check_at: Option<Instant>,
}

/// Live backend record. Counters are atomics; the health state machine sits
/// behind its own lock so transitions and consecutive counts stay coherent.
pub(crate) struct BackendSlot {
    spec: BackendSpec,
    inflight: AtomicU32,
    total: AtomicU64,
    failures: AtomicU64,
    sum_latency_ms: AtomicU64,
    health: Mutex<HealthState>,
}

impl BackendSlot {
    pub(crate) fn new(spec: BackendSpec) -> Self {
        Self {
            spec,
            inflight: AtomicU32::new(0),
            total: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            sum_latency_ms: AtomicU64::new(0),
            health: Mutex::new(HealthState {
                state: BackendState::Online,
                consecutive_ok: 0,
                consecutive_fail: 0,
                last_check_at: None,
            }),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.spec.id
    }

    pub(crate) fn state(&self) -> BackendState {
        self.health.lock().state
    }

    /// Atomically takes one inflight slot iff the backend is online and has
    /// capacity. `0 <= inflight <= max_inflight` holds at all times.
    pub(crate) fn reserve(&self) -> bool {
        if self.state() != BackendState::Online {
            return false;
        }
        loop {
            let current = self.inflight.load(Ordering::Acquire);
            if current >= self.spec.max_inflight {
                return false;
            }
            if self
                .inflight
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // A state change may have raced the increment; back out so a
                // freshly-offlined backend never reports new reservations.
                if self.state() != BackendState::Online {
                    self.inflight.fetch_sub(1, Ordering::AcqRel);
                    return false;
                }
                return true;
            }
        }
    }

    /// Returns a slot and folds the observation into the rolling counters.
    pub(crate) fn release(&self, latency_ms: u64, ok: bool) {
        let previous = self
            .inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous.is_err() {
            warn!(backend = %self.spec.id, "release without matching reserve");
            return;
        }
        self.total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.sum_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    /// Operator override; the only way in or out of `Maintenance`.
    pub(crate) fn set_state(&self, state: BackendState) {
        let mut health = self.health.lock();
        let old = health.state;
        health.state = state;
        health.consecutive_ok = 0;
        health.consecutive_fail = 0;
        info!(backend = %self.spec.id, from = %old, to = %state, "state override");
    }

    /// Feeds one health-check observation through the state machine.
    pub(crate) fn record_health_check(&self, ok: bool) {
        let mut health = self.health.lock();
        health.last_check_at = Some(Instant::now());

        if health.state == BackendState::Maintenance {
            return;
        }

        if ok {
            health.consecutive_fail = 0;
            health.consecutive_ok += 1;
            match health.state {
                BackendState::Degraded if health.consecutive_ok >= DEGRADED_TO_ONLINE_OKS => {
                    health.state = BackendState::Online;
                    health.consecutive_ok = 0;
                    info!(backend = %self.spec.id, "degraded -> online");
                }
                BackendState::Offline if health.consecutive_ok >= OFFLINE_TO_DEGRADED_OKS => {
                    health.state = BackendState::Degraded;
                    health.consecutive_ok = 0;
                    info!(backend = %self.spec.id, "offline -> degraded");
                }
                _ => {}
            }
        } else {
            health.consecutive_ok = 0;
            health.consecutive_fail += 1;
            match health.state {
                BackendState::Online if health.consecutive_fail >= ONLINE_TO_DEGRADED_FAILS => {
                    health.state = BackendState::Degraded;
                    health.consecutive_fail = 0;
                    warn!(backend = %self.spec.id, "online -> degraded");
                }
                BackendState::Degraded if health.consecutive_fail >= DEGRADED_TO_OFFLINE_FAILS => {
                    health.state = BackendState::Offline;
                    health.consecutive_fail = 0;
                    warn!(backend = %self.spec.id, "degraded -> offline");
                }
                _ => {}
            }
        }
    }

    pub(crate) fn snapshot(&self) -> BackendSnapshot {
        let health = self.health.lock();
        let total = self.total.load(Ordering::Relaxed);
        let sum_latency = self.sum_latency_ms.load(Ordering::Relaxed);
        BackendSnapshot {
            id: self.spec.id.clone(),
            address: self.spec.address.clone(),
            weight: self.spec.weight,
            max_inflight: self.spec.max_inflight,
            state: health.state,
            inflight: self.inflight.load(Ordering::Acquire),
            total,
            failures: self.failures.load(Ordering::Relaxed),
            mean_latency_ms: if total > 0 {
                sum_latency as f64 / total as f64
            } else {
                0.0
            },
            consecutive_ok: health.consecutive_ok,
            consecutive_fail: health.consecutive_fail,
            last_check_at: health.last_check_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(max_inflight: u32) -> BackendSlot {
        BackendSlot::new(BackendSpec::new("b1", "http://localhost:11434", max_inflight))
    }

    #[test]
    fn reserve_respects_capacity() {
        let slot = slot(2);
        assert!(slot.reserve());
        assert!(slot.reserve());
        assert!(!slot.reserve());
        slot.release(10, true);
        assert!(slot.reserve());
    }

    #[test]
    fn reserve_refused_when_not_online() {
        let slot = slot(4);
        slot.set_state(BackendState::Degraded);
        assert!(!slot.reserve());
        slot.set_state(BackendState::Online);
        assert!(slot.reserve());
    }

    #[test]
    fn release_updates_rolling_mean() {
        let slot = slot(4);
        assert!(slot.reserve());
        slot.release(100, true);
        assert!(slot.reserve());
        slot.release(200, false);

        let view = slot.snapshot();
        assert_eq!(view.total, 2);
        assert_eq!(view.failures, 1);
        assert!((view.mean_latency_ms - 150.0).abs() < f64::EPSILON);
        assert_eq!(view.inflight, 0);
    }

    #[test]
    fn three_fails_demote_to_degraded() {
        let slot = slot(1);
        for _ in 0..2 {
            slot.record_health_check(false);
            assert_eq!(slot.state(), BackendState::Online);
        }
        slot.record_health_check(false);
        assert_eq!(slot.state(), BackendState::Degraded);
    }

    #[test]
    fn five_more_fails_demote_to_offline() {
        let slot = slot(1);
        for _ in 0..3 {
            slot.record_health_check(false);
        }
        assert_eq!(slot.state(), BackendState::Degraded);
        for _ in 0..4 {
            slot.record_health_check(false);
            assert_eq!(slot.state(), BackendState::Degraded);
        }
        slot.record_health_check(false);
        assert_eq!(slot.state(), BackendState::Offline);
    }

    #[test]
    fn recovery_path_offline_to_online() {
        let slot = slot(1);
        for _ in 0..8 {
            slot.record_health_check(false);
        }
        assert_eq!(slot.state(), BackendState::Offline);

        slot.record_health_check(true);
        assert_eq!(slot.state(), BackendState::Degraded);
        for _ in 0..3 {
            slot.record_health_check(true);
        }
        assert_eq!(slot.state(), BackendState::Online);
    }

    #[test]
    fn maintenance_ignores_health_checks() {
        let slot = slot(1);
        slot.set_state(BackendState::Maintenance);
        for _ in 0..10 {
            slot.record_health_check(false);
        }
        assert_eq!(slot.state(), BackendState::Maintenance);
        for _ in 0..10 {
            slot.record_health_check(true);
        }
        assert_eq!(slot.state(), BackendState::Maintenance);
    }

    #[test]
    fn mixed_results_reset_streaks() {
        let slot = slot(1);
        slot.record_health_check(false);
        slot.record_health_check(false);
        slot.record_health_check(true);
        slot.record_health_check(false);
        slot.record_health_check(false);
        assert_eq!(slot.state(), BackendState::Online);
    }
}
