//! Mock runtime for tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::{ChatReply, Generation, ModelRuntime, RuntimeError, RuntimeProvider, RuntimeResult};
use crate::recall::fallback_embedding;
use crate::task::{Attachment, Message, Role, SamplingParams, Usage};

/// Scriptable [`ModelRuntime`] that counts calls and injects failures.
pub struct MockRuntime {
    reply: RwLock<String>,
    delay: RwLock<Duration>,
    embed_dim: usize,
    transient_failures: AtomicU32,
    fail_model: AtomicBool,
    fail_embed: AtomicBool,
    healthy: AtomicBool,
    generate_calls: AtomicU32,
    chat_calls: AtomicU32,
    embed_calls: AtomicU32,
    vision_calls: AtomicU32,
    list_calls: AtomicU32,
    pull_calls: AtomicU32,
}

impl MockRuntime {
    /// Creates a healthy runtime answering `reply` to everything.
    pub fn new(reply: impl Into<String>, embed_dim: usize) -> Self {
        Self {
            reply: RwLock::new(reply.into()),
            delay: RwLock::new(Duration::ZERO),
            embed_dim,
            transient_failures: AtomicU32::new(0),
            fail_model: AtomicBool::new(false),
            fail_embed: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            generate_calls: AtomicU32::new(0),
            chat_calls: AtomicU32::new(0),
            embed_calls: AtomicU32::new(0),
            vision_calls: AtomicU32::new(0),
            list_calls: AtomicU32::new(0),
            pull_calls: AtomicU32::new(0),
        }
    }

    /// Changes the scripted reply.
    pub fn set_reply(&self, reply: impl Into<String>) {
        *self.reply.write() = reply.into();
    }

    /// Adds an artificial latency to every call.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.write() = delay;
    }

    /// Makes the next `n` generate/chat/vision calls fail transiently.
    pub fn fail_transient(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Makes generate/chat/vision fail with a terminal model error.
    pub fn set_fail_model(&self, fail: bool) {
        self.fail_model.store(fail, Ordering::SeqCst);
    }

    /// Makes embed fail transiently, forcing the fallback embedding path.
    pub fn set_fail_embed(&self, fail: bool) {
        self.fail_embed.store(fail, Ordering::SeqCst);
    }

    /// Controls whether `list_models` (the health ping) succeeds.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Completion calls observed so far (generate + chat + vision).
    pub fn completion_calls(&self) -> u32 {
        self.generate_calls.load(Ordering::SeqCst)
            + self.chat_calls.load(Ordering::SeqCst)
            + self.vision_calls.load(Ordering::SeqCst)
    }

    /// Embed calls observed so far.
    pub fn embed_calls(&self) -> u32 {
        self.embed_calls.load(Ordering::SeqCst)
    }

    /// Health pings observed so far.
    pub fn list_calls(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Pull calls observed so far.
    pub fn pull_calls(&self) -> u32 {
        self.pull_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.delay.read();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
    }

    fn completion_gate(&self) -> RuntimeResult<()> {
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RuntimeError::Transient {
                message: "injected transient failure".to_string(),
            });
        }
        if self.fail_model.load(Ordering::SeqCst) {
            return Err(RuntimeError::Model {
                message: "injected model failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ModelRuntime for MockRuntime {
    async fn generate(
        &self,
        _model: &str,
        prompt: &str,
        _system: Option<&str>,
        _params: &SamplingParams,
    ) -> RuntimeResult<Generation> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.completion_gate()?;
        Ok(Generation {
            text: self.reply.read().clone(),
            usage: Usage::new(prompt.len() as u32 / 4, 8),
        })
    }

    async fn chat(
        &self,
        _model: &str,
        messages: &[Message],
        _system: Option<&str>,
        _params: &SamplingParams,
    ) -> RuntimeResult<ChatReply> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.completion_gate()?;
        Ok(ChatReply {
            message: Message::new(Role::Assistant, self.reply.read().clone()),
            usage: Usage::new(messages.len() as u32 * 4, 8),
        })
    }

    async fn embed(&self, text: &str) -> RuntimeResult<Vec<f32>> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_embed.load(Ordering::SeqCst) {
            return Err(RuntimeError::Transient {
                message: "injected embed failure".to_string(),
            });
        }
        Ok(fallback_embedding(text, self.embed_dim))
    }

    async fn vision(
        &self,
        _model: &str,
        _attachment: &Attachment,
        _prompt: &str,
        _system: Option<&str>,
        _params: &SamplingParams,
    ) -> RuntimeResult<ChatReply> {
        self.vision_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.completion_gate()?;
        Ok(ChatReply {
            message: Message::new(Role::Assistant, self.reply.read().clone()),
            usage: Usage::new(16, 8),
        })
    }

    async fn list_models(&self) -> RuntimeResult<Vec<String>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(vec!["mock-model".to_string()])
        } else {
            Err(RuntimeError::Transient {
                message: "mock runtime unreachable".to_string(),
            })
        }
    }

    async fn pull(&self, _name: &str) -> RuntimeResult<()> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// [`RuntimeProvider`] serving mocks, one default plus per-address overrides.
pub struct MockProvider {
    default: Arc<MockRuntime>,
    per_address: Mutex<HashMap<String, Arc<MockRuntime>>>,
}

impl MockProvider {
    /// Creates a provider serving `default` everywhere.
    pub fn new(default: Arc<MockRuntime>) -> Self {
        Self {
            default,
            per_address: Mutex::new(HashMap::new()),
        }
    }

    /// Pins a distinct mock to one backend address.
    pub fn insert(&self, address: impl Into<String>, runtime: Arc<MockRuntime>) {
        self.per_address.lock().insert(address.into(), runtime);
    }
}

impl RuntimeProvider for MockProvider {
    fn runtime_for(&self, address: &str) -> Arc<dyn ModelRuntime> {
        match self.per_address.lock().get(address) {
            Some(runtime) => Arc::clone(runtime) as Arc<dyn ModelRuntime>,
            None => Arc::clone(&self.default) as Arc<dyn ModelRuntime>,
        }
    }
}
