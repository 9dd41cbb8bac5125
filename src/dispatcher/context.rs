//! Few-shot context assembly.
//!
//! On a cache miss the dispatcher coaches the model with prior work: recent
//! adaptive-memory snippets of the same kind become worked examples, and
//! vector-recall neighbours of the task embedding are cited as related
//! history. The merged text rides in the runtime call's system prompt.

use std::time::Duration;

use serde_json::json;
use tracing::debug;

use crate::constants::BACKGROUND_CHECK_TIMEOUT_SECS;
use crate::memory::AdaptiveMemory;
use crate::recall::VectorRecall;
use crate::runtime::ModelRuntime;
use crate::task::Task;

/// Context gathered for one dispatch.
pub(crate) struct FewShotContext {
    /// Merged system prompt; `None` when there is nothing to say.
    pub system_prompt: Option<String>,
    /// Runtime embedding of the task input, when the embed call succeeded.
    /// Reused for the experience record so the input is embedded once.
    pub query_embedding: Option<Vec<f32>>,
}

impl FewShotContext {
    pub(crate) fn empty() -> Self {
        Self {
            system_prompt: None,
            query_embedding: None,
        }
    }
}

/// Gathers memory examples and recall neighbours for `task`.
pub(crate) async fn build_context(
    task: &Task,
    memory: &AdaptiveMemory,
    recall: &VectorRecall,
    runtime: &dyn ModelRuntime,
    examples: usize,
    neighbors: usize,
) -> FewShotContext {
    let input_text = task.input_text();

    let query_embedding = match tokio::time::timeout(
        Duration::from_secs(BACKGROUND_CHECK_TIMEOUT_SECS),
        runtime.embed(&input_text),
    )
    .await
    {
        Ok(Ok(embedding)) if embedding.len() == recall.dim() => Some(embedding),
        Ok(Ok(embedding)) => {
            debug!(
                got = embedding.len(),
                want = recall.dim(),
                "runtime embedding has wrong dimension, ignoring"
            );
            None
        }
        Ok(Err(e)) => {
            debug!(error = %e, "runtime embedding failed");
            None
        }
        Err(_) => {
            debug!("runtime embedding timed out");
            None
        }
    };

    let mut sections = Vec::new();

    let recent = memory.top_k(task.kind(), examples);
    let relevant = memory.relevant(&json!({ "input": input_text }), examples);
    let mut examples_block = String::new();
    for entry in recent.iter().chain(relevant.iter().map(|(_, e)| e)) {
        let input = entry
            .content
            .get("input")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let output = entry
            .content
            .get("output")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if input.is_empty() || output.is_empty() {
            continue;
        }
        let line = format!("Q: {input}\nA: {output}\n");
        if !examples_block.contains(&line) {
            examples_block.push_str(&line);
        }
    }
    if !examples_block.is_empty() {
        sections.push(format!(
            "Here are examples of how similar requests were handled:\n{examples_block}"
        ));
    }

    if let Some(query) = &query_embedding {
        match recall.search(query, neighbors) {
            Ok(hits) if !hits.is_empty() => {
                let lines: Vec<String> = hits
                    .iter()
                    .map(|(id, distance)| format!("- experience #{id} (distance {distance:.3})"))
                    .collect();
                sections.push(format!(
                    "Related prior experiences, nearest first:\n{}",
                    lines.join("\n")
                ));
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "vector recall failed"),
        }
    }

    let system_prompt = if sections.is_empty() {
        None
    } else {
        Some(format!(
            "You have prior experience with requests like this one.\n\n{}",
            sections.join("\n\n")
        ))
    };

    FewShotContext {
        system_prompt,
        query_embedding,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConfig;
    use crate::runtime::MockRuntime;
    use crate::task::TaskKind;

    #[tokio::test]
    async fn empty_state_yields_no_prompt() {
        let memory = AdaptiveMemory::new(MemoryConfig::default());
        let recall = VectorRecall::new(8).unwrap();
        let runtime = MockRuntime::new("ok", 8);

        let ctx = build_context(
            &Task::generate("hello"),
            &memory,
            &recall,
            &runtime,
            4,
            4,
        )
        .await;
        assert!(ctx.system_prompt.is_none());
        assert!(ctx.query_embedding.is_some());
    }

    #[tokio::test]
    async fn memory_examples_reach_the_prompt() {
        let memory = AdaptiveMemory::new(MemoryConfig {
            max_tokens: 10_000,
            ..MemoryConfig::default()
        });
        memory.add(
            TaskKind::Generate,
            json!({"input": "capital of Italy", "output": "Rome"}),
            0.9,
        );
        let recall = VectorRecall::new(8).unwrap();
        let runtime = MockRuntime::new("ok", 8);

        let ctx = build_context(
            &Task::generate("capital of France"),
            &memory,
            &recall,
            &runtime,
            4,
            4,
        )
        .await;
        let prompt = ctx.system_prompt.expect("examples should produce a prompt");
        assert!(prompt.contains("capital of Italy"));
        assert!(prompt.contains("Rome"));
    }

    #[tokio::test]
    async fn embed_failure_degrades_to_no_embedding() {
        let memory = AdaptiveMemory::new(MemoryConfig::default());
        let recall = VectorRecall::new(8).unwrap();
        let runtime = MockRuntime::new("ok", 8);
        runtime.set_fail_embed(true);

        let ctx = build_context(
            &Task::generate("hello"),
            &memory,
            &recall,
            &runtime,
            4,
            4,
        )
        .await;
        assert!(ctx.query_embedding.is_none());
    }

    #[tokio::test]
    async fn recall_neighbours_are_cited() {
        let memory = AdaptiveMemory::new(MemoryConfig::default());
        let recall = VectorRecall::new(8).unwrap();
        let runtime = MockRuntime::new("ok", 8);

        // Index the embedding of the same text the task will produce, so
        // the neighbour search has an exact hit.
        let embedding = runtime.embed("capital of France").await.unwrap();
        recall.upsert(7, &embedding).unwrap();

        let ctx = build_context(
            &Task::generate("capital of France"),
            &memory,
            &recall,
            &runtime,
            4,
            4,
        )
        .await;
        let prompt = ctx.system_prompt.expect("neighbours should produce a prompt");
        assert!(prompt.contains("experience #7"));
    }
}
