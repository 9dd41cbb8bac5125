//! Environment-backed configuration.
//!
//! One structured [`Config`] consumed at startup. Every knob has a
//! documented default; `AGENTD_*` environment variables override them.
//! Malformed numeric values fall back to the default; structured values
//! (strategy, router variants) fail loudly.

pub mod error;

#[cfg(test)]
mod tests;

pub use error::ConfigError;

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::balancer::Strategy;
use crate::cache::CacheConfig;
use crate::constants::{DEFAULT_EMBEDDING_DIM, validate_embedding_dim};
use crate::dispatcher::DispatcherConfig;
use crate::memory::MemoryConfig;
use crate::router::ModelVariant;

const GIB: u64 = 1024 * 1024 * 1024;

/// Balancer settings.
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Initial selection strategy.
    pub strategy: Strategy,
    /// Period of backend health checks.
    pub health_interval: Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::RoundRobin,
            health_interval: Duration::from_secs(60),
        }
    }
}

/// Complete startup configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for the experience log, vector index and checkpoints.
    pub data_dir: PathBuf,

    /// Secret the cache's secret box derives its key from.
    pub secret: String,

    /// Cache sizing and lifetimes.
    pub cache: CacheConfig,

    /// Balancing strategy and health cadence.
    pub balancer: BalancerConfig,

    /// Adaptive memory budget and admission floor.
    pub memory: MemoryConfig,

    /// Embedding dimension of the recall index.
    pub vector_dimension: usize,

    /// Model variants, heaviest first.
    pub router_variants: Vec<ModelVariant>,

    /// Dispatch concurrency, deadlines and retries.
    pub dispatcher: DispatcherConfig,

    /// Period of the background resource sampler.
    pub probe_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./.data"),
            secret: "agentd-insecure-default".to_string(),
            cache: CacheConfig::default(),
            balancer: BalancerConfig::default(),
            memory: MemoryConfig::default(),
            vector_dimension: DEFAULT_EMBEDDING_DIM,
            router_variants: vec![
                ModelVariant::new("gemma3:12b-it-q4_K_M", 10 * GIB, 0.9),
                ModelVariant::new("gemma3:12b-it-q2_K", 6 * GIB, 0.7),
                ModelVariant::new("gemma3:4b-it-q4_K_M", 3 * GIB, 0.5),
            ],
            dispatcher: DispatcherConfig::default(),
            probe_interval: Duration::from_secs(1),
        }
    }
}

impl Config {
    const ENV_DATA_DIR: &'static str = "AGENTD_DATA_DIR";
    const ENV_SECRET: &'static str = "AGENTD_SECRET";
    const ENV_CACHE_MAX_ENTRIES: &'static str = "AGENTD_CACHE_MAX_ENTRIES";
    const ENV_CACHE_DEFAULT_TTL: &'static str = "AGENTD_CACHE_DEFAULT_TTL_SECS";
    const ENV_CACHE_CLEANUP_INTERVAL: &'static str = "AGENTD_CACHE_CLEANUP_INTERVAL_SECS";
    const ENV_BALANCER_STRATEGY: &'static str = "AGENTD_BALANCER_STRATEGY";
    const ENV_BALANCER_HEALTH_INTERVAL: &'static str = "AGENTD_BALANCER_HEALTH_INTERVAL_SECS";
    const ENV_MEMORY_MAX_TOKENS: &'static str = "AGENTD_MEMORY_MAX_TOKENS";
    const ENV_MEMORY_IMPORTANCE_THRESHOLD: &'static str = "AGENTD_MEMORY_IMPORTANCE_THRESHOLD";
    const ENV_MEMORY_PERSIST_PATH: &'static str = "AGENTD_MEMORY_PERSIST_PATH";
    const ENV_VECTOR_DIMENSION: &'static str = "AGENTD_VECTOR_DIMENSION";
    const ENV_ROUTER_VARIANTS: &'static str = "AGENTD_ROUTER_VARIANTS";
    const ENV_PARALLEL_WORKERS: &'static str = "AGENTD_DISPATCHER_PARALLEL_WORKERS";
    const ENV_MAX_QUEUE_SIZE: &'static str = "AGENTD_DISPATCHER_MAX_QUEUE_SIZE";
    const ENV_DEFAULT_TIMEOUT: &'static str = "AGENTD_DISPATCHER_DEFAULT_TIMEOUT_SECS";
    const ENV_MAX_RETRIES: &'static str = "AGENTD_DISPATCHER_MAX_RETRIES";
    const ENV_BACKOFF_BASE_MS: &'static str = "AGENTD_DISPATCHER_BACKOFF_BASE_MS";
    const ENV_RAM_FLOOR_BYTES: &'static str = "AGENTD_DISPATCHER_RAM_FLOOR_BYTES";
    const ENV_PROBE_INTERVAL: &'static str = "AGENTD_PROBE_INTERVAL_SECS";

    /// Reads configuration from the environment over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let data_dir = parse_path(Self::ENV_DATA_DIR, defaults.data_dir);
        let secret = parse_string(Self::ENV_SECRET, defaults.secret);

        let cache = CacheConfig {
            max_entries: parse_usize(Self::ENV_CACHE_MAX_ENTRIES, defaults.cache.max_entries),
            default_ttl: parse_secs(Self::ENV_CACHE_DEFAULT_TTL, defaults.cache.default_ttl),
            cleanup_interval: parse_secs(
                Self::ENV_CACHE_CLEANUP_INTERVAL,
                defaults.cache.cleanup_interval,
            ),
        };

        let balancer = BalancerConfig {
            strategy: parse_strategy(Self::ENV_BALANCER_STRATEGY, defaults.balancer.strategy)?,
            health_interval: parse_secs(
                Self::ENV_BALANCER_HEALTH_INTERVAL,
                defaults.balancer.health_interval,
            ),
        };

        let memory = MemoryConfig {
            max_tokens: parse_u32(Self::ENV_MEMORY_MAX_TOKENS, defaults.memory.max_tokens),
            importance_threshold: parse_f64(
                Self::ENV_MEMORY_IMPORTANCE_THRESHOLD,
                defaults.memory.importance_threshold,
            ),
            persist_path: env::var(Self::ENV_MEMORY_PERSIST_PATH)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .or_else(|| Some(data_dir.join("memory.json"))),
        };

        let vector_dimension =
            parse_usize(Self::ENV_VECTOR_DIMENSION, defaults.vector_dimension);

        let router_variants = match env::var(Self::ENV_ROUTER_VARIANTS) {
            Ok(value) => parse_variants(&value)?,
            Err(_) => defaults.router_variants,
        };

        let dispatcher = DispatcherConfig {
            parallel_workers: parse_usize(
                Self::ENV_PARALLEL_WORKERS,
                defaults.dispatcher.parallel_workers,
            ),
            max_queue_size: parse_usize(
                Self::ENV_MAX_QUEUE_SIZE,
                defaults.dispatcher.max_queue_size,
            ),
            default_timeout: parse_secs(
                Self::ENV_DEFAULT_TIMEOUT,
                defaults.dispatcher.default_timeout,
            ),
            max_retries: parse_u32(Self::ENV_MAX_RETRIES, defaults.dispatcher.max_retries),
            backoff_base: parse_millis(
                Self::ENV_BACKOFF_BASE_MS,
                defaults.dispatcher.backoff_base,
            ),
            ram_floor_bytes: parse_u64(
                Self::ENV_RAM_FLOOR_BYTES,
                defaults.dispatcher.ram_floor_bytes,
            ),
            context_examples: defaults.dispatcher.context_examples,
            context_neighbors: defaults.dispatcher.context_neighbors,
        };

        let probe_interval = parse_secs(Self::ENV_PROBE_INTERVAL, defaults.probe_interval);

        let config = Self {
            data_dir,
            secret,
            cache,
            balancer,
            memory,
            vector_dimension,
            router_variants,
            dispatcher,
            probe_interval,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_embedding_dim(self.vector_dimension)
            .map_err(|e| ConfigError::Invalid {
                reason: e.to_string(),
            })?;
        if self.router_variants.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "router needs at least one variant".to_string(),
            });
        }
        if self.dispatcher.parallel_workers == 0 {
            return Err(ConfigError::Invalid {
                reason: "dispatcher.parallel_workers must be >= 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.memory.importance_threshold) {
            return Err(ConfigError::Invalid {
                reason: "memory.importance_threshold must be within [0, 1]".to_string(),
            });
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigError::Invalid {
                reason: "cache.max_entries must be >= 1".to_string(),
            });
        }
        Ok(())
    }

    /// Path of the append-only experience log.
    pub fn experience_log_path(&self) -> PathBuf {
        self.data_dir.join("experience.log")
    }

    /// Path of the vector index snapshot.
    pub fn vector_index_path(&self) -> PathBuf {
        self.data_dir.join("vector.index")
    }
}

fn parse_string(var: &str, default: String) -> String {
    env::var(var).unwrap_or(default)
}

fn parse_path(var: &str, default: PathBuf) -> PathBuf {
    env::var(var).map(PathBuf::from).unwrap_or(default)
}

fn parse_u64(var: &str, default: u64) -> u64 {
    env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_u32(var: &str, default: u32) -> u32 {
    env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_usize(var: &str, default: usize) -> usize {
    env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_f64(var: &str, default: f64) -> f64 {
    env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_secs(var: &str, default: Duration) -> Duration {
    env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn parse_millis(var: &str, default: Duration) -> Duration {
    env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn parse_strategy(var: &str, default: Strategy) -> Result<Strategy, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidStrategy { value }),
        Err(_) => Ok(default),
    }
}

/// Parses `name|min_ram_bytes|quality` triples separated by commas.
fn parse_variants(value: &str) -> Result<Vec<ModelVariant>, ConfigError> {
    let mut variants = Vec::new();
    for part in value.split(',').filter(|p| !p.trim().is_empty()) {
        let fields: Vec<&str> = part.trim().split('|').collect();
        if fields.len() != 3 {
            return Err(ConfigError::InvalidVariant {
                value: part.trim().to_string(),
            });
        }
        let min_ram_bytes: u64 = fields[1].parse().map_err(|_| ConfigError::InvalidVariant {
            value: part.trim().to_string(),
        })?;
        let quality_score: f32 = fields[2].parse().map_err(|_| ConfigError::InvalidVariant {
            value: part.trim().to_string(),
        })?;
        variants.push(ModelVariant::new(fields[0], min_ram_bytes, quality_score));
    }
    if variants.is_empty() {
        return Err(ConfigError::InvalidVariant {
            value: value.to_string(),
        });
    }
    Ok(variants)
}
