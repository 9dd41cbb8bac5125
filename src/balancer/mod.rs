//! Health-tracked backend pool and load balancing.

mod backend;
mod error;
mod health;
mod pool;
mod strategy;

pub use backend::{
    BackendSnapshot, BackendSpec, BackendState, DEGRADED_TO_OFFLINE_FAILS, DEGRADED_TO_ONLINE_OKS,
    OFFLINE_TO_DEGRADED_OKS, ONLINE_TO_DEGRADED_FAILS,
};
pub use error::{BalancerError, PoolError, PoolResult};
pub use health::HealthChecker;
pub use pool::BackendPool;
pub use strategy::{DEFAULT_CLIENT_IP, LoadBalancer, PickHints, Strategy};
