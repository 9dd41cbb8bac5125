//! # agentd-core
//!
//! Resource-aware dispatch core for local LLM agents.
//!
//! Agentd sits between a caller (agent/server) and a fleet of local model
//! runtimes.
//!
//! ```text
//! Task → admission → router → cache → context → balancer → runtime
//!                                   ↘ experience log / vector recall ↙
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agentd::{AgentCore, BackendSpec, Config, Task};
//! use agentd::kv::MemoryKvStore;
//! use agentd::probe::SysinfoProbe;
//! use agentd::runtime::OllamaProvider;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let core = AgentCore::start(
//!     Config::from_env()?,
//!     Arc::new(MemoryKvStore::new()),
//!     Arc::new(OllamaProvider::new()),
//!     Arc::new(SysinfoProbe::new()),
//! )
//! .await?;
//! core.admit_backend(BackendSpec::new("local", "http://127.0.0.1:11434", 4))?;
//!
//! let result = core.dispatcher().dispatch(Task::generate("capital of France?")).await?;
//! println!("{:?}", result.output);
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! | Feature | Purpose |
//! |---------|---------|
//! | `mock` | Mock runtime/probe/KV backends for tests and examples |
//!
//! ## Modules
//!
//! - [`dispatcher`] - Admission, routing, retries, single-flight
//! - [`cache`] - Two-tier result cache (LRU + distributed KV)
//! - [`balancer`] - Backend pool, health tracking, selection strategies
//! - [`memory`] - Token-budgeted adaptive memory
//! - [`recall`] - Flat vector index over experience embeddings
//! - [`router`] - Resource-aware model variant selection
//! - [`probe`] - Host resource sampling
//! - [`runtime`] - Model runtime contract + Ollama client
//! - [`secrets`] - Symmetric encryption for sensitive cache entries
//! - [`config`] - Environment-backed configuration

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod balancer;
pub mod cache;
pub mod config;
pub mod constants;
mod core;
pub mod dispatcher;
pub mod experience;
pub mod fingerprint;
pub mod kv;
pub mod memory;
pub mod probe;
pub mod recall;
pub mod router;
pub mod runtime;
pub mod secrets;
pub mod task;

pub use crate::core::{AgentCore, CoreError};

pub use balancer::{
    BackendPool, BackendSnapshot, BackendSpec, BackendState, BalancerError, HealthChecker,
    LoadBalancer, PickHints, PoolError, Strategy,
};
pub use cache::{CacheConfig, CacheEntry, CacheStats, TieredCache};
pub use config::{BalancerConfig, Config, ConfigError};
pub use constants::{DEFAULT_EMBEDDING_DIM, DimConfig, DimValidationError, validate_embedding_dim};
pub use dispatcher::{Collaborators, DispatchError, DispatchResult, Dispatcher, DispatcherConfig};
pub use experience::{Experience, ExperienceLog};
pub use fingerprint::{fingerprint, fingerprint_hex, hash_to_u64, sha256, sha256_hex};
pub use kv::{KvError, KvStore, MemoryKvStore};
pub use memory::{AdaptiveMemory, MemoryConfig, MemoryEntry, MemoryStats};
pub use probe::{CachedProbe, SysinfoProbe, SystemProbe, SystemSnapshot};
pub use recall::{RecallError, VectorRecall, fallback_embedding};
pub use router::{ModelRouter, ModelVariant, RouterError};
pub use runtime::{
    ChatReply, Generation, ModelRuntime, OllamaProvider, OllamaRuntime, RuntimeError,
    RuntimeProvider,
};
pub use secrets::{SecretBox, SecretBoxError};
pub use task::{
    Attachment, CacheStatus, Message, ParamsError, Priority, Role, SamplingParams, Task, TaskError,
    TaskHints, TaskKind, TaskOutput, TaskResult, Usage,
};

#[cfg(any(test, feature = "mock"))]
pub use kv::FlakyKvStore;
#[cfg(any(test, feature = "mock"))]
pub use probe::StaticProbe;
#[cfg(any(test, feature = "mock"))]
pub use runtime::{MockProvider, MockRuntime};
