//! Composition root.
//!
//! [`AgentCore`] builds the whole core from a [`Config`] plus the consumed
//! external interfaces (KV store, runtime provider, system probe), wires
//! the collaborators together, starts the background jobs, and owns their
//! shutdown. There are no process-wide singletons; everything flows through
//! constructors.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::balancer::{BackendPool, BackendSpec, HealthChecker, LoadBalancer, PoolResult};
use crate::cache::TieredCache;
use crate::config::{Config, ConfigError};
use crate::dispatcher::{Collaborators, Dispatcher};
use crate::experience::{ExperienceError, ExperienceLog};
use crate::kv::KvStore;
use crate::memory::AdaptiveMemory;
use crate::probe::{CachedProbe, SystemProbe};
use crate::recall::{RecallError, VectorRecall};
use crate::router::{ModelRouter, RouterError};
use crate::runtime::RuntimeProvider;
use crate::secrets::SecretBox;

/// Startup failures.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration was inconsistent.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Router could not be built.
    #[error(transparent)]
    Router(#[from] RouterError),

    /// Experience log could not be opened.
    #[error(transparent)]
    Experience(#[from] ExperienceError),

    /// Vector index could not be created.
    #[error(transparent)]
    Recall(#[from] RecallError),
}

/// The assembled core.
pub struct AgentCore {
    config: Config,
    probe: Arc<CachedProbe>,
    pool: Arc<BackendPool>,
    balancer: Arc<LoadBalancer>,
    cache: Arc<TieredCache>,
    memory: Arc<AdaptiveMemory>,
    recall: Arc<VectorRecall>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    background: Vec<JoinHandle<()>>,
}

impl AgentCore {
    /// Builds and starts the core.
    ///
    /// Restores adaptive memory from its checkpoint and rebuilds or loads
    /// the vector index from the experience log; both tolerate missing or
    /// corrupt files (a fresh state is better than a dead process).
    pub async fn start(
        config: Config,
        kv: Arc<dyn KvStore>,
        runtimes: Arc<dyn RuntimeProvider>,
        probe: Arc<dyn SystemProbe>,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        let secrets = Arc::new(SecretBox::new(&config.secret));
        let cache = Arc::new(TieredCache::new(config.cache.clone(), kv, secrets));
        let probe = Arc::new(CachedProbe::spawn(probe, config.probe_interval));
        let router = Arc::new(ModelRouter::new(config.router_variants.clone())?);
        let pool = Arc::new(BackendPool::new());
        let balancer = Arc::new(LoadBalancer::new(
            Arc::clone(&pool),
            config.balancer.strategy,
        ));

        let memory = Arc::new(AdaptiveMemory::new(config.memory.clone()));
        if let Err(e) = memory.restore().await {
            warn!(error = %e, "memory checkpoint not restored, starting empty");
        }

        let (experiences, replayed) = ExperienceLog::open(&config.experience_log_path()).await?;
        let experiences = Arc::new(experiences);

        let recall = match VectorRecall::load(&config.vector_index_path()).await {
            Ok(index) if index.dim() == config.vector_dimension => Arc::new(index),
            Ok(index) => {
                warn!(
                    found = index.dim(),
                    configured = config.vector_dimension,
                    "vector index dimension changed, rebuilding from the experience log"
                );
                Arc::new(Self::rebuild_index(config.vector_dimension, &replayed)?)
            }
            Err(RecallError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Arc::new(Self::rebuild_index(config.vector_dimension, &replayed)?)
            }
            Err(e) => {
                warn!(error = %e, "vector index unreadable, rebuilding from the experience log");
                Arc::new(Self::rebuild_index(config.vector_dimension, &replayed)?)
            }
        };

        let dispatcher = Arc::new(Dispatcher::new(
            config.dispatcher.clone(),
            Collaborators {
                probe: Arc::clone(&probe),
                router,
                cache: Arc::clone(&cache),
                pool: Arc::clone(&pool),
                balancer: Arc::clone(&balancer),
                memory: Arc::clone(&memory),
                recall: Arc::clone(&recall),
                experiences,
                runtimes: Arc::clone(&runtimes),
            },
        ));

        let cancel = CancellationToken::new();
        let background = vec![
            cache.spawn_sweeper(cancel.child_token()),
            HealthChecker::spawn(
                Arc::clone(&pool),
                runtimes,
                config.balancer.health_interval,
                cancel.child_token(),
            ),
        ];

        info!(variants = config.router_variants.len(), "core started");
        Ok(Self {
            config,
            probe,
            pool,
            balancer,
            cache,
            memory,
            recall,
            dispatcher,
            cancel,
            background,
        })
    }

    fn rebuild_index(
        dim: usize,
        replayed: &[crate::experience::Experience],
    ) -> Result<VectorRecall, RecallError> {
        let index = VectorRecall::new(dim)?;
        let mut skipped = 0usize;
        for record in replayed {
            if record.embedding.len() == dim {
                index.upsert(record.id, &record.embedding)?;
            } else {
                skipped += 1;
            }
        }
        if skipped > 0 {
            warn!(skipped, "experiences with stale embedding dimension not indexed");
        }
        Ok(index)
    }

    /// Registers a backend endpoint.
    pub fn admit_backend(&self, spec: BackendSpec) -> PoolResult<()> {
        self.pool.add(spec)
    }

    /// The dispatch entry point.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The backend registry.
    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    /// The load balancer.
    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    /// The result cache.
    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    /// The adaptive memory.
    pub fn memory(&self) -> &Arc<AdaptiveMemory> {
        &self.memory
    }

    /// The vector recall index.
    pub fn recall(&self) -> &Arc<VectorRecall> {
        &self.recall
    }

    /// The cached resource probe.
    pub fn probe(&self) -> &Arc<CachedProbe> {
        &self.probe
    }

    /// Persists adaptive memory and the vector index.
    pub async fn checkpoint(&self) -> Result<(), CoreError> {
        if let Err(e) = self.memory.checkpoint().await {
            warn!(error = %e, "memory checkpoint failed");
        }
        self.recall
            .snapshot(&self.config.vector_index_path())
            .await?;
        Ok(())
    }

    /// Stops background jobs and persists state.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        self.probe.shutdown();
        for task in self.background.drain(..) {
            let _ = task.await;
        }
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "final checkpoint failed");
        }
        info!("core stopped");
    }
}

impl std::fmt::Debug for AgentCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentCore")
            .field("backends", &self.pool.list().len())
            .finish()
    }
}
