//! Ollama-compatible HTTP runtime client.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{ChatReply, Generation, ModelRuntime, RuntimeError, RuntimeProvider, RuntimeResult};
use crate::task::{Attachment, Message, Role, SamplingParams, Usage};

/// Default embedding model pulled alongside the chat models.
pub const DEFAULT_EMBED_MODEL: &str = "nomic-embed-text";

#[derive(Serialize)]
struct Options {
    temperature: f32,
    num_predict: u32,
    top_p: f32,
    top_k: u32,
    repeat_penalty: f32,
}

impl From<&SamplingParams> for Options {
    fn from(p: &SamplingParams) -> Self {
        Self {
            temperature: p.temperature,
            num_predict: p.max_tokens,
            top_p: p.top_p,
            top_k: p.top_k,
            repeat_penalty: p.repetition_penalty,
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<Vec<String>>,
    options: Options,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    options: Options,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct TagsModel {
    name: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagsModel>,
}

#[derive(Serialize)]
struct PullRequest<'a> {
    name: &'a str,
    stream: bool,
}

/// [`ModelRuntime`] over the Ollama HTTP API.
pub struct OllamaRuntime {
    base_url: String,
    embed_model: String,
    http: reqwest::Client,
}

impl OllamaRuntime {
    /// Creates a client for the runtime at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_embed_model(base_url, DEFAULT_EMBED_MODEL)
    }

    /// Creates a client with a specific embedding model.
    pub fn with_embed_model(base_url: impl Into<String>, embed_model: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            embed_model: embed_model.into(),
            http: reqwest::Client::new(),
        }
    }

    /// The runtime's base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_json<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &Req,
    ) -> RuntimeResult<Resp> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        Self::decode(response).await
    }

    async fn decode<Resp: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> RuntimeResult<Resp> {
        let status = response.status();
        if status.is_success() {
            return response.json::<Resp>().await.map_err(transport_error);
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            Err(RuntimeError::Transient {
                message: format!("{status}: {body}"),
            })
        } else {
            Err(RuntimeError::Model {
                message: format!("{status}: {body}"),
            })
        }
    }
}

fn transport_error(e: reqwest::Error) -> RuntimeError {
    RuntimeError::Transient {
        message: e.to_string(),
    }
}

#[async_trait]
impl ModelRuntime for OllamaRuntime {
    #[instrument(skip(self, prompt, system, params), fields(model, prompt_len = prompt.len()))]
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        system: Option<&str>,
        params: &SamplingParams,
    ) -> RuntimeResult<Generation> {
        let request = GenerateRequest {
            model,
            prompt,
            stream: false,
            system,
            images: None,
            options: params.into(),
        };
        let response: GenerateResponse = self.post_json("/api/generate", &request).await?;
        Ok(Generation {
            text: response.response,
            usage: Usage::new(response.prompt_eval_count, response.eval_count),
        })
    }

    #[instrument(skip(self, messages, system, params), fields(model, turns = messages.len()))]
    async fn chat(
        &self,
        model: &str,
        messages: &[Message],
        system: Option<&str>,
        params: &SamplingParams,
    ) -> RuntimeResult<ChatReply> {
        let mut wire = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = system {
            wire.push(WireMessage {
                role: "system",
                content: system,
            });
        }
        wire.extend(messages.iter().map(|m| WireMessage {
            role: m.role.as_str(),
            content: &m.content,
        }));

        let request = ChatRequest {
            model,
            messages: wire,
            stream: false,
            options: params.into(),
        };
        let response: ChatResponse = self.post_json("/api/chat", &request).await?;
        Ok(ChatReply {
            message: Message::new(Role::Assistant, response.message.content),
            usage: Usage::new(response.prompt_eval_count, response.eval_count),
        })
    }

    async fn embed(&self, text: &str) -> RuntimeResult<Vec<f32>> {
        let request = EmbeddingsRequest {
            model: &self.embed_model,
            prompt: text,
        };
        let response: EmbeddingsResponse = self.post_json("/api/embeddings", &request).await?;
        Ok(response.embedding)
    }

    #[instrument(skip_all, fields(model, media_type = %attachment.media_type))]
    async fn vision(
        &self,
        model: &str,
        attachment: &Attachment,
        prompt: &str,
        system: Option<&str>,
        params: &SamplingParams,
    ) -> RuntimeResult<ChatReply> {
        let request = GenerateRequest {
            model,
            prompt,
            stream: false,
            system,
            images: Some(vec![BASE64.encode(&attachment.bytes)]),
            options: params.into(),
        };
        let response: GenerateResponse = self.post_json("/api/generate", &request).await?;
        Ok(ChatReply {
            message: Message::new(Role::Assistant, response.response),
            usage: Usage::new(response.prompt_eval_count, response.eval_count),
        })
    }

    async fn list_models(&self) -> RuntimeResult<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self.http.get(&url).send().await.map_err(transport_error)?;
        let tags: TagsResponse = Self::decode(response).await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn pull(&self, name: &str) -> RuntimeResult<()> {
        debug!(model = name, "pulling model");
        let request = PullRequest { name, stream: false };
        let _: serde_json::Value = self.post_json("/api/pull", &request).await?;
        Ok(())
    }
}

/// [`RuntimeProvider`] that lazily builds one [`OllamaRuntime`] per backend
/// address and reuses it afterwards.
pub struct OllamaProvider {
    embed_model: String,
    clients: Mutex<HashMap<String, Arc<OllamaRuntime>>>,
}

impl OllamaProvider {
    /// Creates a provider using the default embedding model.
    pub fn new() -> Self {
        Self::with_embed_model(DEFAULT_EMBED_MODEL)
    }

    /// Creates a provider with a specific embedding model.
    pub fn with_embed_model(embed_model: impl Into<String>) -> Self {
        Self {
            embed_model: embed_model.into(),
            clients: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeProvider for OllamaProvider {
    fn runtime_for(&self, address: &str) -> Arc<dyn ModelRuntime> {
        let mut clients = self.clients.lock();
        let client = clients.entry(address.to_string()).or_insert_with(|| {
            Arc::new(OllamaRuntime::with_embed_model(
                address,
                self.embed_model.clone(),
            ))
        });
        Arc::clone(client) as Arc<dyn ModelRuntime>
    }
}
