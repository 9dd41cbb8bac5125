//! Dispatch results.

use serde::{Deserialize, Serialize};

use super::Message;

/// Token accounting reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: u32,
    /// Tokens produced by the completion.
    pub completion_tokens: u32,
    /// Sum of the two.
    pub total_tokens: u32,
}

impl Usage {
    /// Builds a usage record, computing the total.
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Whether a result was served from cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    /// Served from cache without a runtime call.
    Hit,
    /// Produced by a runtime call.
    Miss,
}

impl CacheStatus {
    /// Marker value, e.g. for an `x-cache` response header.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Miss => "miss",
        }
    }
}

/// Kind-specific result content; exactly one variant per result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutput {
    /// Completion or transcription text.
    Text(String),
    /// Chat reply.
    Message(Message),
    /// Embedding vector.
    Embedding(Vec<f32>),
}

impl TaskOutput {
    /// Flat text rendering, used for digests and experience records.
    pub fn as_text(&self) -> String {
        match self {
            TaskOutput::Text(t) => t.clone(),
            TaskOutput::Message(m) => m.content.clone(),
            TaskOutput::Embedding(v) => format!("<embedding dim={}>", v.len()),
        }
    }
}

/// The outcome of a successful dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Result content.
    pub output: TaskOutput,
    /// Token accounting.
    pub usage: Usage,
    /// Wall-clock latency of the runtime call; zero on cache hits.
    pub latency_ms: u64,
    /// Cache marker.
    pub cache: CacheStatus,
}

impl TaskResult {
    /// Builds a freshly-computed (cache-miss) result.
    pub fn fresh(output: TaskOutput, usage: Usage, latency_ms: u64) -> Self {
        Self {
            output,
            usage,
            latency_ms,
            cache: CacheStatus::Miss,
        }
    }

    /// Re-marks a cached result as a hit with zero latency.
    pub fn into_cache_hit(mut self) -> Self {
        self.latency_ms = 0;
        self.cache = CacheStatus::Hit;
        self
    }
}
