//! Typed inference tasks.
//!
//! A [`Task`] is the unit of work handed to the dispatcher. One variant per
//! kind, each carrying only the fields valid for that kind, so presence
//! checks happen at construction rather than at dispatch time.

mod params;
mod result;

pub use params::{ParamsError, SamplingParams};
pub use result::{CacheStatus, TaskOutput, TaskResult, Usage};

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Task kind discriminant, used for filtering and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Free-text completion.
    Generate,
    /// Multi-turn chat.
    Chat,
    /// Text embedding.
    Embed,
    /// Image understanding.
    Vision,
    /// Audio transcription.
    Audio,
}

impl TaskKind {
    /// Stable lowercase name, used in fingerprints and logs.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Generate => "generate",
            TaskKind::Chat => "chat",
            TaskKind::Embed => "embed",
            TaskKind::Vision => "vision",
            TaskKind::Audio => "audio",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Instruction context.
    System,
    /// End-user turn.
    User,
    /// Model turn.
    Assistant,
}

impl Role {
    /// Wire name as understood by chat runtimes.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One turn of a chat conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who produced the turn.
    pub role: Role,
    /// Turn text.
    pub content: String,
}

impl Message {
    /// Convenience constructor.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// A user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// An assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Opaque media blob attached to vision/audio tasks.
///
/// Fingerprints never embed the raw bytes; they use the SHA-256 digest.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    /// Raw media bytes.
    pub bytes: Vec<u8>,
    /// Media-type hint, e.g. `image/png` or `audio/wav`.
    pub media_type: String,
}

impl Attachment {
    /// Creates an attachment from bytes and a media-type hint.
    pub fn new(bytes: Vec<u8>, media_type: impl Into<String>) -> Self {
        Self {
            bytes,
            media_type: media_type.into(),
        }
    }
}

/// Caller priority hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work.
    Low,
    /// Interactive work.
    #[default]
    Normal,
    /// Latency-sensitive work.
    High,
}

/// Optional caller hints attached to a task.
#[derive(Debug, Clone)]
pub struct TaskHints {
    /// Set to `false` to bypass the cache entirely (no get, no set).
    pub allow_cache: bool,
    /// Marks the result as sensitive; cached copies are encrypted.
    pub sensitive: bool,
    /// Scheduling priority.
    pub priority: Priority,
    /// Client address for session-affine balancing.
    pub client_ip: Option<String>,
    /// Per-task deadline; clamped to the dispatcher default.
    pub timeout: Option<Duration>,
}

impl Default for TaskHints {
    fn default() -> Self {
        Self {
            allow_cache: true,
            sensitive: false,
            priority: Priority::Normal,
            client_ip: None,
            timeout: None,
        }
    }
}

/// Kind-specific task payload.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskInput {
    /// Free-text completion of `prompt`.
    Generate {
        /// The prompt.
        prompt: String,
    },
    /// Chat over an ordered message history.
    Chat {
        /// Conversation so far; must be non-empty.
        messages: Vec<Message>,
    },
    /// Embedding of `text`.
    Embed {
        /// Text to embed; must be non-empty.
        text: String,
    },
    /// Image understanding.
    Vision {
        /// Instruction for the model.
        prompt: String,
        /// The image.
        attachment: Attachment,
    },
    /// Audio transcription.
    Audio {
        /// Instruction for the model.
        prompt: String,
        /// The audio clip.
        attachment: Attachment,
    },
}

/// A typed unit of work.
#[derive(Debug, Clone)]
pub struct Task {
    /// Kind-specific payload.
    pub input: TaskInput,
    /// Sampling parameters.
    pub params: SamplingParams,
    /// Caller hints.
    pub hints: TaskHints,
}

/// Validation failure for a task or its parameters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    /// Chat task with an empty message history.
    #[error("chat task requires at least one message")]
    EmptyMessages,
    /// Embed task with empty text.
    #[error("embed task requires non-empty text")]
    EmptyEmbedText,
    /// Generate task with an empty prompt.
    #[error("generate task requires a non-empty prompt")]
    EmptyPrompt,
    /// Vision/audio task with an empty attachment.
    #[error("{kind} task requires a non-empty attachment")]
    EmptyAttachment {
        /// The offending kind.
        kind: TaskKind,
    },
    /// A sampling parameter is out of range.
    #[error(transparent)]
    Params(#[from] ParamsError),
}

impl Task {
    /// Creates a generate task with default params and hints.
    pub fn generate(prompt: impl Into<String>) -> Self {
        Self::from_input(TaskInput::Generate {
            prompt: prompt.into(),
        })
    }

    /// Creates a chat task with default params and hints.
    pub fn chat(messages: Vec<Message>) -> Self {
        Self::from_input(TaskInput::Chat { messages })
    }

    /// Creates an embed task with default params and hints.
    pub fn embed(text: impl Into<String>) -> Self {
        Self::from_input(TaskInput::Embed { text: text.into() })
    }

    /// Creates a vision task with default params and hints.
    pub fn vision(prompt: impl Into<String>, attachment: Attachment) -> Self {
        Self::from_input(TaskInput::Vision {
            prompt: prompt.into(),
            attachment,
        })
    }

    /// Creates an audio task with default params and hints.
    pub fn audio(prompt: impl Into<String>, attachment: Attachment) -> Self {
        Self::from_input(TaskInput::Audio {
            prompt: prompt.into(),
            attachment,
        })
    }

    fn from_input(input: TaskInput) -> Self {
        Self {
            input,
            params: SamplingParams::default(),
            hints: TaskHints::default(),
        }
    }

    /// Replaces the sampling parameters.
    pub fn with_params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }

    /// Replaces the caller hints.
    pub fn with_hints(mut self, hints: TaskHints) -> Self {
        self.hints = hints;
        self
    }

    /// Returns the task kind.
    #[inline]
    pub fn kind(&self) -> TaskKind {
        match &self.input {
            TaskInput::Generate { .. } => TaskKind::Generate,
            TaskInput::Chat { .. } => TaskKind::Chat,
            TaskInput::Embed { .. } => TaskKind::Embed,
            TaskInput::Vision { .. } => TaskKind::Vision,
            TaskInput::Audio { .. } => TaskKind::Audio,
        }
    }

    /// Checks the structural invariants of the task.
    pub fn validate(&self) -> Result<(), TaskError> {
        match &self.input {
            TaskInput::Generate { prompt } => {
                if prompt.is_empty() {
                    return Err(TaskError::EmptyPrompt);
                }
            }
            TaskInput::Chat { messages } => {
                if messages.is_empty() {
                    return Err(TaskError::EmptyMessages);
                }
            }
            TaskInput::Embed { text } => {
                if text.is_empty() {
                    return Err(TaskError::EmptyEmbedText);
                }
            }
            TaskInput::Vision { attachment, .. } | TaskInput::Audio { attachment, .. } => {
                if attachment.bytes.is_empty() {
                    return Err(TaskError::EmptyAttachment { kind: self.kind() });
                }
            }
        }
        self.params.validate()?;
        Ok(())
    }

    /// Flat text rendering of the input, used for embedding and digests.
    pub fn input_text(&self) -> String {
        match &self.input {
            TaskInput::Generate { prompt } => prompt.clone(),
            TaskInput::Chat { messages } => messages
                .iter()
                .map(|m| format!("{}: {}", m.role.as_str(), m.content))
                .collect::<Vec<_>>()
                .join("\n"),
            TaskInput::Embed { text } => text.clone(),
            TaskInput::Vision { prompt, .. } | TaskInput::Audio { prompt, .. } => prompt.clone(),
        }
    }
}
