//! Deterministic task fingerprints.
//!
//! The cache key is the SHA-256 of the canonical JSON of
//! `{kind, input, params, model_variant}`. Canonical JSON sorts object keys
//! lexicographically (the default `serde_json` map is ordered), and
//! attachments are represented by their SHA-256 digest, never raw bytes, so
//! equal-by-value tasks fingerprint identically regardless of field order.

use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::task::{Task, TaskInput};

/// Computes the SHA-256 of arbitrary bytes.
#[inline]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Lowercase hex rendering of a 32-byte digest.
#[inline]
pub fn digest_hex(digest: &[u8; 32]) -> String {
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Computes the SHA-256 of arbitrary bytes as lowercase hex.
#[inline]
pub fn sha256_hex(data: &[u8]) -> String {
    digest_hex(&sha256(data))
}

/// Computes a 64-bit hash of the input, truncated from SHA-256.
///
/// Used for non-cryptographic indexing such as session-affine backend
/// selection. A collision selects a different backend, nothing worse.
#[inline]
pub fn hash_to_u64(data: &[u8]) -> u64 {
    let digest = sha256(data);
    let bytes: [u8; 8] = digest[0..8]
        .try_into()
        .expect("SHA-256 always produces at least 8 bytes");
    u64::from_le_bytes(bytes)
}

/// Computes the cache fingerprint for `task` under `model_variant`.
pub fn fingerprint(task: &Task, model_variant: &str) -> [u8; 32] {
    let canonical = canonical_value(task, model_variant);
    let bytes = serde_json::to_vec(&canonical)
        .expect("canonical task value contains no non-serializable data");
    sha256(&bytes)
}

/// Hex form of [`fingerprint`], the cache key used throughout the crate.
pub fn fingerprint_hex(task: &Task, model_variant: &str) -> String {
    digest_hex(&fingerprint(task, model_variant))
}

fn canonical_value(task: &Task, model_variant: &str) -> Value {
    let input = match &task.input {
        TaskInput::Generate { prompt } => json!({ "prompt": prompt }),
        TaskInput::Chat { messages } => {
            let turns: Vec<Value> = messages
                .iter()
                .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
                .collect();
            json!({ "messages": turns })
        }
        TaskInput::Embed { text } => json!({ "text": text }),
        TaskInput::Vision { prompt, attachment } => json!({
            "prompt": prompt,
            "attachment": sha256_hex(&attachment.bytes),
            "media_type": attachment.media_type,
        }),
        TaskInput::Audio { prompt, attachment } => json!({
            "prompt": prompt,
            "attachment": sha256_hex(&attachment.bytes),
            "media_type": attachment.media_type,
        }),
    };

    json!({
        "kind": task.kind().as_str(),
        "input": input,
        "params": {
            "temperature": task.params.temperature,
            "max_tokens": task.params.max_tokens,
            "top_p": task.params.top_p,
            "top_k": task.params.top_k,
            "repetition_penalty": task.params.repetition_penalty,
        },
        "model_variant": model_variant,
    })
}
