//! End-to-end dispatch tests over the public API, with mock backends.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use agentd::{
    AgentCore, BackendSpec, BackendState, CacheStatus, Config, DispatchError, HealthChecker,
    KvStore, MemoryKvStore, MockProvider, MockRuntime, PickHints, StaticProbe, Task, TaskHints,
    TaskOutput,
};

const EMBED_DIM: usize = 16;

struct Harness {
    core: AgentCore,
    runtime: Arc<MockRuntime>,
    provider: Arc<MockProvider>,
}

fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.data_dir = dir.to_path_buf();
    config.memory.persist_path = Some(dir.join("memory.json"));
    config.vector_dimension = EMBED_DIM;
    config.dispatcher.backoff_base = Duration::from_millis(5);
    config.dispatcher.default_timeout = Duration::from_secs(5);
    // Background cadences kept out of the way; tests drive checks manually.
    config.balancer.health_interval = Duration::from_secs(3600);
    config.cache.cleanup_interval = Duration::from_secs(3600);
    config.probe_interval = Duration::from_secs(3600);
    config
}

async fn start(dir: &Path) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let runtime = Arc::new(MockRuntime::new("Paris", EMBED_DIM));
    let provider = Arc::new(MockProvider::new(Arc::clone(&runtime)));
    let probe = Arc::new(StaticProbe::healthy());
    let core = AgentCore::start(
        test_config(dir),
        Arc::new(MemoryKvStore::new()),
        Arc::clone(&provider) as _,
        probe,
    )
    .await
    .expect("core should start");
    Harness {
        core,
        runtime,
        provider,
    }
}

fn backend(id: &str) -> BackendSpec {
    BackendSpec::new(id, format!("http://{id}:11434"), 4)
}

#[tokio::test]
async fn dispatch_returns_fresh_result() {
    let dir = tempfile::tempdir().unwrap();
    let h = start(dir.path()).await;
    h.core.admit_backend(backend("b1")).unwrap();

    let result = h
        .core
        .dispatcher()
        .dispatch(Task::generate("capital of France"))
        .await
        .unwrap();

    assert_eq!(result.output, TaskOutput::Text("Paris".into()));
    assert_eq!(result.cache, CacheStatus::Miss);
    assert!(result.usage.total_tokens > 0);
    assert_eq!(h.runtime.completion_calls(), 1);
}

#[tokio::test]
async fn repeat_dispatch_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let h = start(dir.path()).await;
    h.core.admit_backend(backend("b1")).unwrap();

    let task = || Task::generate("capital of France");
    let first = h.core.dispatcher().dispatch(task()).await.unwrap();
    let second = h.core.dispatcher().dispatch(task()).await.unwrap();

    assert_eq!(h.runtime.completion_calls(), 1, "second call must hit cache");
    assert_eq!(second.cache, CacheStatus::Hit);
    assert_eq!(second.latency_ms, 0);
    assert_eq!(second.output, first.output);
}

#[tokio::test]
async fn concurrent_identical_dispatches_share_one_runtime_call() {
    let dir = tempfile::tempdir().unwrap();
    let h = start(dir.path()).await;
    h.core.admit_backend(backend("b1")).unwrap();
    h.runtime.set_delay(Duration::from_millis(100));

    let task = || {
        let mut params = agentd::SamplingParams::default();
        params.temperature = 0.0;
        params.max_tokens = 16;
        Task::generate("capital of France").with_params(params)
    };

    let d1 = Arc::clone(h.core.dispatcher());
    let d2 = Arc::clone(h.core.dispatcher());
    let (r1, r2) = tokio::join!(d1.dispatch(task()), d2.dispatch(task()));
    let (r1, r2) = (r1.unwrap(), r2.unwrap());

    assert_eq!(
        h.runtime.completion_calls(),
        1,
        "single-flight must deduplicate the runtime call"
    );
    assert_eq!(r1.output, r2.output);
}

#[tokio::test]
async fn distinct_prompts_are_not_deduplicated() {
    let dir = tempfile::tempdir().unwrap();
    let h = start(dir.path()).await;
    h.core.admit_backend(backend("b1")).unwrap();

    let d1 = Arc::clone(h.core.dispatcher());
    let d2 = Arc::clone(h.core.dispatcher());
    let (r1, r2) = tokio::join!(
        d1.dispatch(Task::generate("capital of France")),
        d2.dispatch(Task::generate("capital of Germany"))
    );
    r1.unwrap();
    r2.unwrap();
    assert_eq!(h.runtime.completion_calls(), 2);
}

#[tokio::test]
async fn allow_cache_false_bypasses_cache_entirely() {
    let dir = tempfile::tempdir().unwrap();
    let h = start(dir.path()).await;
    h.core.admit_backend(backend("b1")).unwrap();

    let task = || {
        Task::generate("no caching please").with_hints(TaskHints {
            allow_cache: false,
            ..TaskHints::default()
        })
    };

    h.core.dispatcher().dispatch(task()).await.unwrap();
    h.core.dispatcher().dispatch(task()).await.unwrap();

    let stats = h.core.cache().stats();
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.misses, 0, "cache.get must never have been consulted");
    assert_eq!(stats.size, 0, "cache.set must never have been called");
    assert_eq!(h.runtime.completion_calls(), 2);
}

#[tokio::test]
async fn failed_health_checks_remove_backend_from_rotation() {
    let dir = tempfile::tempdir().unwrap();
    let h = start(dir.path()).await;
    h.core.admit_backend(backend("b1")).unwrap();
    h.core.admit_backend(backend("b2")).unwrap();

    // b1's runtime stops answering; b2 stays healthy.
    let sick = Arc::new(MockRuntime::new("Paris", EMBED_DIM));
    sick.set_healthy(false);
    h.provider.insert("http://b1:11434", sick);

    for _ in 0..3 {
        HealthChecker::check_all(h.core.pool(), h.provider.as_ref()).await;
    }
    assert_eq!(
        h.core.pool().snapshot("b1").unwrap().state,
        BackendState::Degraded
    );
    for _ in 0..8 {
        let picked = h.core.balancer().pick(PickHints::default()).unwrap();
        assert_eq!(picked.id, "b2", "degraded backend must not be picked");
    }

    // Three healthy rounds bring it back.
    let healed = Arc::new(MockRuntime::new("Paris", EMBED_DIM));
    h.provider.insert("http://b1:11434", healed);
    for _ in 0..3 {
        HealthChecker::check_all(h.core.pool(), h.provider.as_ref()).await;
    }
    assert_eq!(
        h.core.pool().snapshot("b1").unwrap().state,
        BackendState::Online
    );
}

#[tokio::test]
async fn cancellation_releases_slot_and_skips_cache() {
    let dir = tempfile::tempdir().unwrap();
    let h = start(dir.path()).await;
    h.core.admit_backend(backend("b1")).unwrap();
    h.runtime.set_delay(Duration::from_millis(300));

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let err = h
        .core
        .dispatcher()
        .dispatch_with_cancel(Task::generate("slow question"), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Cancelled));

    assert_eq!(
        h.core.pool().snapshot("b1").unwrap().inflight,
        0,
        "reserved slot must be released on cancel"
    );
    assert_eq!(h.core.cache().stats().size, 0, "cache must not be populated");
}

#[tokio::test]
async fn transient_failure_is_retried_on_another_backend() {
    let dir = tempfile::tempdir().unwrap();
    let h = start(dir.path()).await;
    h.core.admit_backend(backend("b1")).unwrap();
    h.core.admit_backend(backend("b2")).unwrap();
    h.runtime.fail_transient(1);

    let result = h
        .core
        .dispatcher()
        .dispatch(Task::generate("retry me"))
        .await
        .unwrap();
    assert_eq!(result.output, TaskOutput::Text("Paris".into()));
    assert_eq!(h.runtime.completion_calls(), 2, "one failure, one success");

    let total_failures: u64 = h.core.pool().list().iter().map(|b| b.failures).sum();
    assert_eq!(total_failures, 1);
}

#[tokio::test]
async fn model_errors_are_terminal_and_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let h = start(dir.path()).await;
    h.core.admit_backend(backend("b1")).unwrap();
    h.core.admit_backend(backend("b2")).unwrap();
    h.runtime.set_fail_model(true);

    let err = h
        .core
        .dispatcher()
        .dispatch(Task::generate("doomed"))
        .await
        .unwrap_err();
    match err {
        DispatchError::Model { message } => assert!(message.contains("injected model failure")),
        other => panic!("expected model error, got {other:?}"),
    }
    assert_eq!(h.runtime.completion_calls(), 1, "terminal errors never retry");
}

#[tokio::test]
async fn overloaded_host_refuses_admission() {
    let dir = tempfile::tempdir().unwrap();

    // The probe reads hot before the core starts, so the seeded snapshot
    // already carries the overload.
    let probe = Arc::new(StaticProbe::healthy());
    probe.set_cpu_pct(95.0);

    let runtime = Arc::new(MockRuntime::new("Paris", EMBED_DIM));
    let provider = Arc::new(MockProvider::new(Arc::clone(&runtime)));
    let core = AgentCore::start(
        test_config(dir.path()),
        Arc::new(MemoryKvStore::new()),
        provider,
        Arc::clone(&probe) as _,
    )
    .await
    .unwrap();
    core.admit_backend(backend("b1")).unwrap();

    let err = core
        .dispatcher()
        .dispatch(Task::generate("too hot"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Overloaded { .. }));
    assert_eq!(runtime.completion_calls(), 0);
}

#[tokio::test]
async fn no_backend_yields_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let h = start(dir.path()).await;

    let err = h
        .core
        .dispatcher()
        .dispatch(Task::generate("anyone there?"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Unavailable { .. }));
}

#[tokio::test]
async fn invalid_tasks_are_rejected_before_admission() {
    let dir = tempfile::tempdir().unwrap();
    let h = start(dir.path()).await;
    h.core.admit_backend(backend("b1")).unwrap();

    let err = h
        .core
        .dispatcher()
        .dispatch(Task::chat(Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::BadRequest(_)));
    assert_eq!(h.runtime.completion_calls(), 0);
}

#[tokio::test]
async fn successful_dispatches_leave_experiences_behind() {
    let dir = tempfile::tempdir().unwrap();
    let h = start(dir.path()).await;
    h.core.admit_backend(backend("b1")).unwrap();

    h.core
        .dispatcher()
        .dispatch(Task::generate("capital of France"))
        .await
        .unwrap();

    // Experience recording is async; give it a beat.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(h.core.memory().stats().entries >= 1, "memory learned");
    assert!(h.core.recall().live_len() >= 1, "recall indexed");

    let log = tokio::fs::read_to_string(dir.path().join("experience.log"))
        .await
        .unwrap();
    assert!(log.lines().count() >= 1, "experience log appended");
}

#[tokio::test]
async fn embeddings_flow_through_without_learning() {
    let dir = tempfile::tempdir().unwrap();
    let h = start(dir.path()).await;
    h.core.admit_backend(backend("b1")).unwrap();

    let result = h
        .core
        .dispatcher()
        .dispatch(Task::embed("vectorize me"))
        .await
        .unwrap();
    match result.output {
        TaskOutput::Embedding(v) => assert_eq!(v.len(), EMBED_DIM),
        other => panic!("expected embedding, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.core.memory().stats().entries, 0);
}

#[tokio::test]
async fn saturated_single_backend_bounds_inflight() {
    let dir = tempfile::tempdir().unwrap();
    let h = start(dir.path()).await;
    h.core
        .admit_backend(BackendSpec::new("tiny", "http://tiny:11434", 1))
        .unwrap();
    h.runtime.set_delay(Duration::from_millis(100));

    let dispatcher = Arc::clone(h.core.dispatcher());
    let tasks: Vec<_> = (0..3)
        .map(|i| {
            let d = Arc::clone(&dispatcher);
            tokio::spawn(async move { d.dispatch(Task::generate(format!("q{i}"))).await })
        })
        .collect();

    let mut ok = 0;
    let mut unavailable = 0;
    for joined in futures::future::join_all(tasks).await {
        match joined.unwrap() {
            Ok(_) => ok += 1,
            Err(DispatchError::Unavailable { .. }) => unavailable += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert!(ok >= 1);
    assert_eq!(ok + unavailable, 3);

    let view = h.core.pool().snapshot("tiny").unwrap();
    assert_eq!(view.inflight, 0, "all slots returned");
    assert!(view.max_inflight >= view.inflight);
}

#[tokio::test]
async fn sensitive_results_are_encrypted_in_the_cache() {
    let dir = tempfile::tempdir().unwrap();

    let runtime = Arc::new(MockRuntime::new("4111-1111", EMBED_DIM));
    let provider = Arc::new(MockProvider::new(Arc::clone(&runtime)));
    let kv = Arc::new(MemoryKvStore::new());
    let core = AgentCore::start(
        test_config(dir.path()),
        Arc::clone(&kv) as _,
        provider,
        Arc::new(StaticProbe::healthy()),
    )
    .await
    .unwrap();
    core.admit_backend(backend("b1")).unwrap();

    let task = || {
        Task::generate("what is my card number").with_hints(TaskHints {
            sensitive: true,
            ..TaskHints::default()
        })
    };
    core.dispatcher().dispatch(task()).await.unwrap();

    // The KV tier must hold ciphertext only.
    let keys = kv.keys("").await.unwrap();
    assert_eq!(keys.len(), 1);
    let raw = kv.get(&keys[0]).await.unwrap().unwrap();
    let entry: agentd::CacheEntry = serde_json::from_slice(&raw).unwrap();
    assert!(entry.encrypted);
    assert!(!String::from_utf8_lossy(&entry.value).contains("4111"));

    // And the same process still reads it back as a hit.
    let again = core.dispatcher().dispatch(task()).await.unwrap();
    assert_eq!(again.cache, CacheStatus::Hit);
}
