//! Task dispatch pipeline.
//!
//! `Dispatcher` ties the core together: admission control, the host
//! resource gate, variant routing, the result cache with per-fingerprint
//! single-flight, balanced backend selection with retries, and experience
//! recording. It holds no persistent state of its own; everything it needs
//! arrives through its constructor.

mod context;
mod error;
mod singleflight;

pub use error::{DispatchError, DispatchResult};

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use serde_json::json;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::balancer::{BackendPool, BackendSnapshot, LoadBalancer, PickHints};
use crate::cache::TieredCache;
use crate::constants::{
    CPU_DEGRADED_PCT, CPU_OVERLOAD_PCT, DEFAULT_DISPATCH_TIMEOUT_SECS, DEFAULT_RAM_FLOOR_BYTES,
    TEMP_DEGRADED_C, TEMP_OVERLOAD_C,
};
use crate::experience::{Experience, ExperienceLog};
use crate::fingerprint::{fingerprint_hex, sha256_hex};
use crate::memory::AdaptiveMemory;
use crate::probe::{CachedProbe, SystemSnapshot};
use crate::recall::{VectorRecall, fallback_embedding};
use crate::router::{ModelRouter, ModelVariant};
use crate::runtime::{ModelRuntime, RuntimeProvider, RuntimeResult};
use crate::task::{Priority, Task, TaskInput, TaskKind, TaskOutput, TaskResult, Usage};

use context::{FewShotContext, build_context};
use singleflight::{Flight, SingleFlight};

/// Dispatch concurrency, deadline and retry settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum concurrent dispatches.
    pub parallel_workers: usize,
    /// Dispatches allowed to queue for a worker before admission refuses.
    pub max_queue_size: usize,
    /// Per-call deadline; per-task hints are clamped to this.
    pub default_timeout: Duration,
    /// Retries after the first attempt fails transiently.
    pub max_retries: u32,
    /// Base of the exponential retry backoff.
    pub backoff_base: Duration,
    /// Free-RAM floor below which dispatches are refused.
    pub ram_floor_bytes: u64,
    /// Memory examples merged into the few-shot context (K).
    pub context_examples: usize,
    /// Recall neighbours cited in the few-shot context (K').
    pub context_neighbors: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            parallel_workers: 4,
            max_queue_size: 32,
            default_timeout: Duration::from_secs(DEFAULT_DISPATCH_TIMEOUT_SECS),
            max_retries: 2,
            backoff_base: Duration::from_millis(100),
            ram_floor_bytes: DEFAULT_RAM_FLOOR_BYTES,
            context_examples: 4,
            context_neighbors: 4,
        }
    }
}

/// Everything the dispatcher depends on, injected at construction.
pub struct Collaborators {
    /// Host resource snapshots.
    pub probe: Arc<CachedProbe>,
    /// Model variant selection.
    pub router: Arc<ModelRouter>,
    /// Result cache.
    pub cache: Arc<TieredCache>,
    /// Backend registry.
    pub pool: Arc<BackendPool>,
    /// Backend selection.
    pub balancer: Arc<LoadBalancer>,
    /// Few-shot example store.
    pub memory: Arc<AdaptiveMemory>,
    /// Embedding neighbourhood index.
    pub recall: Arc<VectorRecall>,
    /// Append-only experience log.
    pub experiences: Arc<ExperienceLog>,
    /// Runtime clients per backend address.
    pub runtimes: Arc<dyn RuntimeProvider>,
}

/// The dispatch entry point; see the module docs for the pipeline.
pub struct Dispatcher {
    config: DispatcherConfig,
    probe: Arc<CachedProbe>,
    router: Arc<ModelRouter>,
    cache: Arc<TieredCache>,
    pool: Arc<BackendPool>,
    balancer: Arc<LoadBalancer>,
    memory: Arc<AdaptiveMemory>,
    recall: Arc<VectorRecall>,
    experiences: Arc<ExperienceLog>,
    runtimes: Arc<dyn RuntimeProvider>,
    workers: Arc<Semaphore>,
    queue_depth: AtomicUsize,
    flights: SingleFlight,
}

impl Dispatcher {
    /// Creates a dispatcher over its collaborators.
    pub fn new(config: DispatcherConfig, parts: Collaborators) -> Self {
        let workers = Arc::new(Semaphore::new(config.parallel_workers.max(1)));
        Self {
            config,
            probe: parts.probe,
            router: parts.router,
            cache: parts.cache,
            pool: parts.pool,
            balancer: parts.balancer,
            memory: parts.memory,
            recall: parts.recall,
            experiences: parts.experiences,
            runtimes: parts.runtimes,
            workers,
            queue_depth: AtomicUsize::new(0),
            flights: SingleFlight::new(),
        }
    }

    /// Dispatches `task` with a fresh cancellation token.
    pub async fn dispatch(&self, task: Task) -> DispatchResult<TaskResult> {
        self.dispatch_with_cancel(task, CancellationToken::new())
            .await
    }

    /// Dispatches `task`; cancelling `cancel` aborts waits, releases any
    /// reserved backend slot and leaves the cache untouched.
    #[instrument(skip_all, fields(kind = %task.kind()))]
    pub async fn dispatch_with_cancel(
        &self,
        task: Task,
        cancel: CancellationToken,
    ) -> DispatchResult<TaskResult> {
        task.validate()?;

        let _permit = self.admit(&cancel).await?;
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let snapshot = self.probe.latest();
        self.resource_gate(&snapshot)?;
        let variant = self.router.choose(&snapshot).clone();

        let key = fingerprint_hex(&task, &variant.name);
        let timeout = match task.hints.timeout {
            Some(t) => t.min(self.config.default_timeout),
            None => self.config.default_timeout,
        };

        if !task.hints.allow_cache {
            return self.execute(&task, &variant, &key, timeout, &cancel).await;
        }

        if let Some(bytes) = self.cache.get(&key).await {
            match serde_json::from_slice::<TaskResult>(&bytes) {
                Ok(result) => {
                    debug!(fingerprint = %&key[..16], "cache hit");
                    return Ok(result.into_cache_hit());
                }
                Err(e) => {
                    warn!(error = %e, "cached result did not deserialize, dropping");
                    self.cache.delete(&key).await;
                }
            }
        }

        match self.flights.join(&key) {
            Flight::Leader(guard) => {
                let outcome = self.execute(&task, &variant, &key, timeout, &cancel).await;
                match &outcome {
                    // A cancelled leader must not cancel its followers;
                    // they get a retriable error instead.
                    Err(DispatchError::Cancelled) => guard.complete(Err(DispatchError::Unavailable {
                        reason: "concurrent identical request was aborted".to_string(),
                    })),
                    _ => guard.complete(outcome.clone()),
                }
                outcome
            }
            Flight::Follower(rx) => {
                debug!(fingerprint = %&key[..16], "joining in-flight computation");
                self.await_leader(rx, timeout, &cancel).await
            }
        }
    }

    /// Current cache statistics.
    pub fn cache_stats(&self) -> crate::cache::CacheStats {
        self.cache.stats()
    }

    /// Dispatches waiting for a worker right now.
    pub fn queued(&self) -> usize {
        self.queue_depth.load(Ordering::Acquire)
    }

    async fn admit(&self, cancel: &CancellationToken) -> DispatchResult<OwnedSemaphorePermit> {
        match Arc::clone(&self.workers).try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(tokio::sync::TryAcquireError::NoPermits) => {
                let queued = self.queue_depth.fetch_add(1, Ordering::AcqRel);
                if queued >= self.config.max_queue_size {
                    self.queue_depth.fetch_sub(1, Ordering::AcqRel);
                    return Err(DispatchError::Overloaded {
                        reason: "admission queue full".to_string(),
                    });
                }
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => Err(DispatchError::Cancelled),
                    permit = Arc::clone(&self.workers).acquire_owned() => {
                        permit.map_err(|_| DispatchError::Internal {
                            message: "admission semaphore closed".to_string(),
                        })
                    }
                };
                self.queue_depth.fetch_sub(1, Ordering::AcqRel);
                outcome
            }
            Err(tokio::sync::TryAcquireError::Closed) => Err(DispatchError::Internal {
                message: "admission semaphore closed".to_string(),
            }),
        }
    }

    fn resource_gate(&self, snapshot: &SystemSnapshot) -> DispatchResult<()> {
        if snapshot.cpu_pct >= CPU_OVERLOAD_PCT {
            return Err(DispatchError::Overloaded {
                reason: format!("cpu at {:.0}%", snapshot.cpu_pct),
            });
        }
        if snapshot.ram_free_bytes < self.config.ram_floor_bytes {
            return Err(DispatchError::Overloaded {
                reason: format!("{} bytes of ram free", snapshot.ram_free_bytes),
            });
        }
        if snapshot.temperature_c >= TEMP_OVERLOAD_C {
            return Err(DispatchError::Overloaded {
                reason: format!("host at {:.0}°C", snapshot.temperature_c),
            });
        }
        if snapshot.cpu_pct >= CPU_DEGRADED_PCT {
            warn!(cpu_pct = snapshot.cpu_pct, "host cpu degraded, still admitting");
        }
        if snapshot.temperature_c >= TEMP_DEGRADED_C {
            warn!(
                temperature_c = snapshot.temperature_c,
                "host temperature degraded, still admitting"
            );
        }
        Ok(())
    }

    async fn await_leader(
        &self,
        mut rx: watch::Receiver<Option<DispatchResult<TaskResult>>>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> DispatchResult<TaskResult> {
        let started = Instant::now();
        let wait = async {
            loop {
                if let Some(outcome) = rx.borrow_and_update().clone() {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    return Err(DispatchError::Internal {
                        message: "single-flight channel closed".to_string(),
                    });
                }
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(DispatchError::Cancelled),
            outcome = tokio::time::timeout(timeout, wait) => match outcome {
                Ok(outcome) => outcome,
                Err(_) => Err(DispatchError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }),
            },
        }
    }

    async fn execute(
        &self,
        task: &Task,
        variant: &ModelVariant,
        fingerprint: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> DispatchResult<TaskResult> {
        let mut exclude: Vec<String> = Vec::new();
        let mut backend = self.acquire_backend(task, &mut exclude)?;
        let mut runtime = self.runtimes.runtime_for(&backend.address);

        // Embeddings need no coaching; everything else gets prior context.
        let context = if matches!(task.input, TaskInput::Embed { .. }) {
            FewShotContext::empty()
        } else {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.release_quiet(&backend.id, Duration::ZERO, false);
                    return Err(DispatchError::Cancelled);
                }
                context = build_context(
                    task,
                    &self.memory,
                    &self.recall,
                    runtime.as_ref(),
                    self.config.context_examples,
                    self.config.context_neighbors,
                ) => context,
            }
        };

        let overall_started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            let started = Instant::now();
            let call = call_runtime(
                runtime.as_ref(),
                task,
                &variant.name,
                context.system_prompt.as_deref(),
            );
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    self.release_quiet(&backend.id, started.elapsed(), false);
                    return Err(DispatchError::Cancelled);
                }
                outcome = tokio::time::timeout(timeout, call) => outcome,
            };
            let elapsed = started.elapsed();

            match outcome {
                Ok(Ok((output, usage))) => {
                    self.release_quiet(&backend.id, elapsed, true);
                    let result = TaskResult::fresh(output, usage, elapsed.as_millis() as u64);
                    if task.hints.allow_cache {
                        match serde_json::to_vec(&result) {
                            Ok(bytes) => {
                                self.cache
                                    .set(fingerprint, &bytes, None, task.hints.sensitive)
                                    .await
                            }
                            Err(e) => warn!(error = %e, "result did not serialize for caching"),
                        }
                    }
                    self.spawn_experience(task, &result, context.query_embedding.clone());
                    return Ok(result);
                }
                Ok(Err(e)) if !e.is_transient() => {
                    // The backend did its job; the model said no.
                    self.release_quiet(&backend.id, elapsed, true);
                    return Err(DispatchError::Model {
                        message: e.to_string(),
                    });
                }
                Ok(Err(e)) => {
                    self.release_quiet(&backend.id, elapsed, false);
                    warn!(backend = %backend.id, attempt, error = %e, "transient runtime failure");
                    if attempt >= self.config.max_retries {
                        return Err(DispatchError::Unavailable {
                            reason: format!("retries exhausted: {e}"),
                        });
                    }
                }
                Err(_) => {
                    self.release_quiet(&backend.id, elapsed, false);
                    warn!(backend = %backend.id, attempt, "runtime call timed out");
                    if attempt >= self.config.max_retries {
                        return Err(DispatchError::Timeout {
                            elapsed_ms: overall_started.elapsed().as_millis() as u64,
                        });
                    }
                }
            }

            exclude.push(backend.id.clone());
            let backoff = self.backoff_delay(attempt);
            tokio::select! {
                _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
            attempt += 1;
            backend = self.acquire_backend(task, &mut exclude)?;
            runtime = self.runtimes.runtime_for(&backend.address);
        }
    }

    /// Picks and reserves a backend, re-picking once with an exclusion set
    /// when the first choice is saturated.
    fn acquire_backend(
        &self,
        task: &Task,
        exclude: &mut Vec<String>,
    ) -> DispatchResult<BackendSnapshot> {
        for _ in 0..2 {
            let backend = self
                .balancer
                .pick(PickHints {
                    client_ip: task.hints.client_ip.as_deref(),
                    exclude: &*exclude,
                })
                .map_err(|_| DispatchError::Unavailable {
                    reason: "no online backend".to_string(),
                })?;

            match self.pool.reserve(&backend.id) {
                Ok(true) => return Ok(backend),
                Ok(false) => {
                    debug!(backend = %backend.id, "backend saturated, re-picking");
                    exclude.push(backend.id);
                }
                Err(e) => {
                    debug!(backend = %backend.id, error = %e, "backend vanished, re-picking");
                    exclude.push(backend.id);
                }
            }
        }
        Err(DispatchError::Unavailable {
            reason: "all candidate backends saturated".to_string(),
        })
    }

    fn release_quiet(&self, id: &str, elapsed: Duration, ok: bool) {
        if let Err(e) = self.pool.release(id, elapsed.as_millis() as u64, ok) {
            debug!(backend = %id, error = %e, "release failed");
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.config.backoff_base.as_millis() as u64;
        let exp = base_ms.saturating_mul(1u64 << attempt.min(16));
        let jitter = rand::thread_rng().gen_range(0..base_ms.max(1));
        Duration::from_millis(exp + jitter)
    }

    /// Records the finished dispatch off the hot path.
    fn spawn_experience(&self, task: &Task, result: &TaskResult, embedding: Option<Vec<f32>>) {
        // Embedding results are not worth remembering as examples.
        if task.kind() == TaskKind::Embed {
            return;
        }

        let kind = task.kind();
        let input_text = task.input_text();
        let output_text = result.output.as_text();
        let importance = match task.hints.priority {
            Priority::High => 0.9,
            Priority::Normal => 0.7,
            Priority::Low => 0.5,
        };
        let memory = Arc::clone(&self.memory);
        let recall = Arc::clone(&self.recall);
        let experiences = Arc::clone(&self.experiences);

        tokio::spawn(async move {
            let (embedding, fallback) = match embedding {
                Some(e) => (e, false),
                None => (fallback_embedding(&input_text, recall.dim()), true),
            };
            let content = json!({ "input": input_text, "output": output_text });
            let record = Experience {
                id: experiences.next_id(),
                kind,
                input_digest: sha256_hex(input_text.as_bytes()),
                output_digest: sha256_hex(output_text.as_bytes()),
                embedding: embedding.clone(),
                fallback_embedding: fallback,
                score: importance,
                created_at: Utc::now(),
                token_cost: AdaptiveMemory::estimate_tokens(&content),
                access_count: 0,
            };
            if let Err(e) = experiences.append(&record).await {
                warn!(error = %e, "experience append failed");
            }
            if let Err(e) = recall.upsert(record.id, &embedding) {
                warn!(error = %e, "recall upsert failed");
            }
            memory.add(kind, content, importance);
        });
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("workers", &self.config.parallel_workers)
            .field("queued", &self.queued())
            .finish()
    }
}

/// Issues the runtime call matching the task kind.
async fn call_runtime(
    runtime: &dyn ModelRuntime,
    task: &Task,
    model: &str,
    system: Option<&str>,
) -> RuntimeResult<(TaskOutput, Usage)> {
    match &task.input {
        TaskInput::Generate { prompt } => runtime
            .generate(model, prompt, system, &task.params)
            .await
            .map(|g| (TaskOutput::Text(g.text), g.usage)),
        TaskInput::Chat { messages } => runtime
            .chat(model, messages, system, &task.params)
            .await
            .map(|r| (TaskOutput::Message(r.message), r.usage)),
        TaskInput::Embed { text } => runtime.embed(text).await.map(|v| {
            let usage = Usage::new(text.len() as u32 / 4, 0);
            (TaskOutput::Embedding(v), usage)
        }),
        TaskInput::Vision { prompt, attachment } | TaskInput::Audio { prompt, attachment } => {
            runtime
                .vision(model, attachment, prompt, system, &task.params)
                .await
                .map(|r| (TaskOutput::Message(r.message), r.usage))
        }
    }
}
