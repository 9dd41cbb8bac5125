//! Backend selection strategies.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use rand::Rng;

use super::backend::BackendSnapshot;
use super::error::BalancerError;
use super::pool::BackendPool;
use crate::fingerprint::hash_to_u64;

/// Fallback client address for `ip_hash` when the caller supplies none.
pub const DEFAULT_CLIENT_IP: &str = "0.0.0.0";

/// Selection strategy, switchable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Cycle through the online list.
    #[default]
    RoundRobin,
    /// Fewest unreleased reservations; ties broken by id.
    LeastInflight,
    /// Lowest rolling mean latency; unsampled backends fall back to
    /// round-robin.
    LeastLatency,
    /// Stable mapping from client address, for session affinity.
    IpHash,
    /// Weighted random by backend weight.
    Weighted,
    /// Uniform random.
    Random,
}

impl Strategy {
    /// Stable lowercase name, matching the configuration value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastInflight => "least_inflight",
            Strategy::LeastLatency => "least_latency",
            Strategy::IpHash => "ip_hash",
            Strategy::Weighted => "weighted",
            Strategy::Random => "random",
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Strategy::RoundRobin),
            "least_inflight" => Ok(Strategy::LeastInflight),
            "least_latency" => Ok(Strategy::LeastLatency),
            "ip_hash" => Ok(Strategy::IpHash),
            "weighted" => Ok(Strategy::Weighted),
            "random" => Ok(Strategy::Random),
            other => Err(format!("unknown balancing strategy: {other}")),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-pick inputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct PickHints<'a> {
    /// Client address for `ip_hash`.
    pub client_ip: Option<&'a str>,
    /// Backends to skip, e.g. ones that just refused a reservation.
    pub exclude: &'a [String],
}

/// Chooses a backend for each request. Reads the pool, never mutates it;
/// reservation stays with the caller.
pub struct LoadBalancer {
    pool: Arc<BackendPool>,
    strategy: RwLock<Strategy>,
    rr_index: AtomicUsize,
}

impl LoadBalancer {
    /// Creates a balancer over `pool` with the given initial strategy.
    pub fn new(pool: Arc<BackendPool>, strategy: Strategy) -> Self {
        Self {
            pool,
            strategy: RwLock::new(strategy),
            rr_index: AtomicUsize::new(0),
        }
    }

    /// Returns the active strategy.
    pub fn strategy(&self) -> Strategy {
        *self.strategy.read()
    }

    /// Switches the strategy at runtime.
    pub fn set_strategy(&self, strategy: Strategy) {
        *self.strategy.write() = strategy;
    }

    /// Picks an online backend, or [`BalancerError::NoBackend`] when none
    /// qualify. Never returns an offline or maintenance backend.
    pub fn pick(&self, hints: PickHints<'_>) -> Result<BackendSnapshot, BalancerError> {
        let mut online = self.pool.list_online();
        if !hints.exclude.is_empty() {
            online.retain(|b| !hints.exclude.contains(&b.id));
        }
        if online.is_empty() {
            return Err(BalancerError::NoBackend);
        }

        let chosen = match self.strategy() {
            Strategy::RoundRobin => self.pick_round_robin(&online),
            Strategy::LeastInflight => online
                .iter()
                .min_by(|a, b| a.inflight.cmp(&b.inflight).then_with(|| a.id.cmp(&b.id)))
                .expect("list is non-empty")
                .clone(),
            Strategy::LeastLatency => {
                let sampled: Vec<&BackendSnapshot> =
                    online.iter().filter(|b| b.total > 0).collect();
                if sampled.is_empty() {
                    self.pick_round_robin(&online)
                } else {
                    (*sampled
                        .iter()
                        .min_by(|a, b| {
                            a.mean_latency_ms
                                .partial_cmp(&b.mean_latency_ms)
                                .unwrap_or(std::cmp::Ordering::Equal)
                                .then_with(|| a.id.cmp(&b.id))
                        })
                        .expect("sampled list is non-empty"))
                    .clone()
                }
            }
            Strategy::IpHash => {
                let ip = hints.client_ip.unwrap_or(DEFAULT_CLIENT_IP);
                let index = (hash_to_u64(ip.as_bytes()) % online.len() as u64) as usize;
                online[index].clone()
            }
            Strategy::Weighted => {
                let total: u64 = online.iter().map(|b| b.weight as u64).sum();
                let mut roll = rand::thread_rng().gen_range(0..total);
                let mut chosen = online.last().expect("list is non-empty");
                for backend in &online {
                    if roll < backend.weight as u64 {
                        chosen = backend;
                        break;
                    }
                    roll -= backend.weight as u64;
                }
                chosen.clone()
            }
            Strategy::Random => {
                let index = rand::thread_rng().gen_range(0..online.len());
                online[index].clone()
            }
        };

        Ok(chosen)
    }

    fn pick_round_robin(&self, online: &[BackendSnapshot]) -> BackendSnapshot {
        let index = self.rr_index.fetch_add(1, Ordering::Relaxed) % online.len();
        online[index].clone()
    }
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("strategy", &self.strategy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::backend::{BackendSpec, BackendState};
    use std::collections::HashSet;

    fn pool_with(ids: &[&str]) -> Arc<BackendPool> {
        let pool = Arc::new(BackendPool::new());
        for id in ids {
            pool.add(BackendSpec::new(*id, format!("http://{id}:11434"), 4))
                .unwrap();
        }
        pool
    }

    #[test]
    fn strategy_parses_from_config_values() {
        assert_eq!("round_robin".parse::<Strategy>(), Ok(Strategy::RoundRobin));
        assert_eq!("weighted".parse::<Strategy>(), Ok(Strategy::Weighted));
        assert!("fastest".parse::<Strategy>().is_err());
    }

    #[test]
    fn empty_pool_yields_no_backend() {
        let lb = LoadBalancer::new(Arc::new(BackendPool::new()), Strategy::RoundRobin);
        assert_eq!(lb.pick(PickHints::default()), Err(BalancerError::NoBackend));
    }

    #[test]
    fn round_robin_cycles() {
        let lb = LoadBalancer::new(pool_with(&["b1", "b2", "b3"]), Strategy::RoundRobin);
        let picks: Vec<String> = (0..6)
            .map(|_| lb.pick(PickHints::default()).unwrap().id)
            .collect();
        assert_eq!(picks[0..3], picks[3..6]);
        let distinct: HashSet<&String> = picks.iter().collect();
        assert_eq!(distinct.len(), 3);
    }

    #[test]
    fn least_inflight_breaks_ties_by_id() {
        let pool = pool_with(&["b2", "b1"]);
        let lb = LoadBalancer::new(Arc::clone(&pool), Strategy::LeastInflight);
        assert_eq!(lb.pick(PickHints::default()).unwrap().id, "b1");

        assert!(pool.reserve("b1").unwrap());
        assert_eq!(lb.pick(PickHints::default()).unwrap().id, "b2");
    }

    #[test]
    fn least_latency_prefers_fast_backends() {
        let pool = pool_with(&["fast", "slow"]);
        let lb = LoadBalancer::new(Arc::clone(&pool), Strategy::LeastLatency);

        assert!(pool.reserve("fast").unwrap());
        pool.release("fast", 10, true).unwrap();
        assert!(pool.reserve("slow").unwrap());
        pool.release("slow", 900, true).unwrap();

        assert_eq!(lb.pick(PickHints::default()).unwrap().id, "fast");
    }

    #[test]
    fn ip_hash_is_stable_per_client() {
        let lb = LoadBalancer::new(pool_with(&["b1", "b2", "b3"]), Strategy::IpHash);
        let hints = PickHints {
            client_ip: Some("192.168.1.7"),
            exclude: &[],
        };
        let first = lb.pick(hints).unwrap().id;
        for _ in 0..5 {
            assert_eq!(lb.pick(hints).unwrap().id, first);
        }
    }

    #[test]
    fn never_picks_offline_or_maintenance() {
        let pool = pool_with(&["b1", "b2", "b3"]);
        pool.set_state("b1", BackendState::Offline).unwrap();
        pool.set_state("b2", BackendState::Maintenance).unwrap();

        for strategy in [
            Strategy::RoundRobin,
            Strategy::LeastInflight,
            Strategy::LeastLatency,
            Strategy::IpHash,
            Strategy::Weighted,
            Strategy::Random,
        ] {
            let lb = LoadBalancer::new(Arc::clone(&pool), strategy);
            for _ in 0..8 {
                assert_eq!(lb.pick(PickHints::default()).unwrap().id, "b3");
            }
        }
    }

    #[test]
    fn exclusion_set_is_honoured() {
        let lb = LoadBalancer::new(pool_with(&["b1", "b2"]), Strategy::LeastInflight);
        let exclude = vec!["b1".to_string()];
        let hints = PickHints {
            client_ip: None,
            exclude: &exclude,
        };
        assert_eq!(lb.pick(hints).unwrap().id, "b2");
    }

    #[test]
    fn weighted_reaches_every_backend() {
        let pool = Arc::new(BackendPool::new());
        pool.add(BackendSpec::new("heavy", "http://heavy:11434", 4).with_weight(8))
            .unwrap();
        pool.add(BackendSpec::new("light", "http://light:11434", 4).with_weight(1))
            .unwrap();
        let lb = LoadBalancer::new(pool, Strategy::Weighted);

        let mut seen = HashSet::new();
        for _ in 0..200 {
            seen.insert(lb.pick(PickHints::default()).unwrap().id);
        }
        assert!(seen.contains("heavy") && seen.contains("light"));
    }
}
