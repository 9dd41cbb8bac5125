//! Model runtime contract.
//!
//! The dispatcher drives any inference server through [`ModelRuntime`];
//! [`OllamaRuntime`] is the bundled implementation for Ollama-compatible
//! HTTP APIs. Failures split into transient (retriable on another backend)
//! and model-level (terminal).

mod ollama;

#[cfg(any(test, feature = "mock"))]
mod mock;

pub use ollama::{OllamaProvider, OllamaRuntime};

#[cfg(any(test, feature = "mock"))]
pub use mock::{MockProvider, MockRuntime};

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::task::{Attachment, Message, SamplingParams, Usage};

/// Runtime call failure.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// Transport-level fault; safe to retry, possibly on another backend.
    #[error("transient runtime error: {message}")]
    Transient {
        /// What went wrong.
        message: String,
    },

    /// The model rejected or failed the request; retrying will not help.
    #[error("model error: {message}")]
    Model {
        /// Runtime-provided detail, preserved for the caller.
        message: String,
    },
}

impl RuntimeError {
    /// Returns `true` when the error is worth retrying.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, RuntimeError::Transient { .. })
    }
}

/// Convenience result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// A text completion with its token accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    /// Completion text.
    pub text: String,
    /// Token accounting.
    pub usage: Usage,
}

/// A chat reply with its token accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    /// The assistant turn.
    pub message: Message,
    /// Token accounting.
    pub usage: Usage,
}

/// A local inference server.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    /// Completes `prompt` under `model`.
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        system: Option<&str>,
        params: &SamplingParams,
    ) -> RuntimeResult<Generation>;

    /// Continues a conversation under `model`.
    async fn chat(
        &self,
        model: &str,
        messages: &[Message],
        system: Option<&str>,
        params: &SamplingParams,
    ) -> RuntimeResult<ChatReply>;

    /// Embeds `text` with the runtime's embedding model.
    async fn embed(&self, text: &str) -> RuntimeResult<Vec<f32>>;

    /// Answers `prompt` about an attached image or audio clip.
    async fn vision(
        &self,
        model: &str,
        attachment: &Attachment,
        prompt: &str,
        system: Option<&str>,
        params: &SamplingParams,
    ) -> RuntimeResult<ChatReply>;

    /// Lists models available on this runtime. Doubles as the health ping.
    async fn list_models(&self) -> RuntimeResult<Vec<String>>;

    /// Downloads `name` if not already present. Idempotent.
    async fn pull(&self, name: &str) -> RuntimeResult<()>;
}

/// Maps backend addresses to runtime clients.
///
/// The dispatcher and the health checker both resolve the backend chosen by
/// the balancer through this trait, so tests can substitute per-address
/// mocks.
pub trait RuntimeProvider: Send + Sync {
    /// Returns the runtime serving `address`.
    fn runtime_for(&self, address: &str) -> Arc<dyn ModelRuntime>;
}
