//! Token-budgeted adaptive memory.
//!
//! Holds structured experience snippets under a hard token budget. Entries
//! are admitted by importance, evicted by a blended score (importance,
//! recency, access frequency), and retrieved either by recency
//! ([`AdaptiveMemory::top_k`]) or by Jaccard relevance to a structured
//! query ([`AdaptiveMemory::relevant`]).

mod error;

pub use error::{MemoryError, MemoryResult};

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::constants::{DEFAULT_IMPORTANCE_THRESHOLD, DEFAULT_TOKEN_BUDGET};
use crate::task::TaskKind;

/// Budget and admission settings.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Hard cap on the summed token cost of retained entries.
    pub max_tokens: u32,
    /// Minimum importance for admission.
    pub importance_threshold: f64,
    /// Checkpoint file; `None` disables persistence.
    pub persist_path: Option<PathBuf>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_TOKEN_BUDGET,
            importance_threshold: DEFAULT_IMPORTANCE_THRESHOLD,
            persist_path: None,
        }
    }
}

/// One retained experience snippet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Stable identifier.
    pub id: Uuid,
    /// Task kind the snippet came from.
    pub kind: TaskKind,
    /// Structured content (input/output pairs and the like).
    pub content: Value,
    /// Admission importance, `[0, 1]`.
    pub importance: f64,
    /// Estimated token cost (canonical JSON bytes / 4).
    pub token_cost: u32,
    /// When the entry was admitted.
    pub created_at: DateTime<Utc>,
    /// Retrievals served from this entry.
    pub access_count: u32,
}

/// Usage counters for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Retained entries.
    pub entries: usize,
    /// Tokens currently used.
    pub used_tokens: u32,
    /// Configured budget.
    pub max_tokens: u32,
}

#[derive(Serialize, Deserialize)]
struct State {
    entries: Vec<MemoryEntry>,
    used_tokens: u32,
}

/// Bounded experience store. Writes (admission and eviction) serialize on a
/// write lock; retrieval takes the same lock only to bump access counters.
pub struct AdaptiveMemory {
    config: MemoryConfig,
    state: RwLock<State>,
}

impl AdaptiveMemory {
    /// Creates an empty store.
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            state: RwLock::new(State {
                entries: Vec::new(),
                used_tokens: 0,
            }),
        }
    }

    /// Estimated token cost of `content`: canonical JSON bytes / 4.
    pub fn estimate_tokens(content: &Value) -> u32 {
        serde_json::to_vec(content).map(|b| b.len() as u32 / 4).unwrap_or(0)
    }

    /// Admits `content` iff `importance` clears the threshold, evicting
    /// lowest-scoring entries until the budget fits. Returns `true` when
    /// the entry was retained.
    pub fn add(&self, kind: TaskKind, content: Value, importance: f64) -> bool {
        if importance < self.config.importance_threshold {
            debug!(importance, "memory entry below admission threshold");
            return false;
        }

        let token_cost = Self::estimate_tokens(&content);
        if token_cost > self.config.max_tokens {
            debug!(token_cost, "memory entry larger than the whole budget");
            return false;
        }

        let mut state = self.state.write();
        while state.used_tokens + token_cost > self.config.max_tokens {
            if !Self::evict_one(&mut state) {
                return false;
            }
        }

        state.used_tokens += token_cost;
        state.entries.push(MemoryEntry {
            id: Uuid::new_v4(),
            kind,
            content,
            importance,
            token_cost,
            created_at: Utc::now(),
            access_count: 0,
        });
        true
    }

    /// Up to `k` entries of `kind`, newest first.
    pub fn top_k(&self, kind: TaskKind, k: usize) -> Vec<MemoryEntry> {
        let mut state = self.state.write();
        let mut matching: Vec<usize> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.kind == kind)
            .map(|(i, _)| i)
            .collect();
        matching.sort_by(|&a, &b| state.entries[b].created_at.cmp(&state.entries[a].created_at));
        matching.truncate(k);

        matching
            .into_iter()
            .map(|i| {
                state.entries[i].access_count += 1;
                state.entries[i].clone()
            })
            .collect()
    }

    /// Entries ranked by Jaccard relevance to `query`, best first, zero
    /// scores dropped.
    pub fn relevant(&self, query: &Value, k: usize) -> Vec<(f64, MemoryEntry)> {
        let query_items = flatten_items(query);
        let mut state = self.state.write();

        let mut scored: Vec<(f64, usize)> = state
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (jaccard(&flatten_items(&e.content), &query_items), i))
            .filter(|(score, _)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        scored
            .into_iter()
            .map(|(score, i)| {
                state.entries[i].access_count += 1;
                (score, state.entries[i].clone())
            })
            .collect()
    }

    /// Current usage.
    pub fn stats(&self) -> MemoryStats {
        let state = self.state.read();
        MemoryStats {
            entries: state.entries.len(),
            used_tokens: state.used_tokens,
            max_tokens: self.config.max_tokens,
        }
    }

    /// Serializes the store to the configured checkpoint file.
    pub async fn checkpoint(&self) -> MemoryResult<()> {
        let path = self
            .config
            .persist_path
            .as_ref()
            .ok_or(MemoryError::NoPersistPath)?;
        let bytes = {
            let state = self.state.read();
            serde_json::to_vec(&*state)?
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    /// Restores the store from the configured checkpoint file. A missing
    /// file leaves the store empty.
    pub async fn restore(&self) -> MemoryResult<()> {
        let path = self
            .config
            .persist_path
            .as_ref()
            .ok_or(MemoryError::NoPersistPath)?;
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let restored: State = serde_json::from_slice(&bytes)?;
        *self.state.write() = restored;
        Ok(())
    }

    /// Eviction score: higher keeps the entry. Blends importance, recency
    /// and access frequency.
    fn eviction_score(entry: &MemoryEntry, now: DateTime<Utc>) -> f64 {
        let age_seconds = (now - entry.created_at).num_milliseconds().max(0) as f64 / 1000.0;
        entry.importance * 0.4
            + (1.0 / (age_seconds + 1.0)) * 0.3
            + (entry.access_count as f64 / 100.0).min(1.0) * 0.3
    }

    fn evict_one(state: &mut State) -> bool {
        if state.entries.is_empty() {
            return false;
        }
        let now = Utc::now();
        let mut victim = 0;
        let mut victim_score = f64::INFINITY;
        for (i, entry) in state.entries.iter().enumerate() {
            let score = Self::eviction_score(entry, now);
            let older_tie = score == victim_score
                && entry.created_at < state.entries[victim].created_at;
            if score < victim_score || older_tie {
                victim = i;
                victim_score = score;
            }
        }
        let removed = state.entries.remove(victim);
        state.used_tokens -= removed.token_cost;
        debug!(id = %removed.id, score = victim_score, "evicted memory entry");
        true
    }
}

impl std::fmt::Debug for AdaptiveMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("AdaptiveMemory")
            .field("entries", &stats.entries)
            .field("used_tokens", &stats.used_tokens)
            .field("max_tokens", &stats.max_tokens)
            .finish()
    }
}

/// Flattens nested JSON into `path=value` items for Jaccard comparison.
fn flatten_items(value: &Value) -> HashSet<String> {
    let mut items = HashSet::new();
    flatten_into("", value, &mut items);
    items
}

fn flatten_into(prefix: &str, value: &Value, out: &mut HashSet<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(&path, child, out);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                flatten_into(&format!("{prefix}[{i}]"), child, out);
            }
        }
        other => {
            out.insert(format!("{prefix}={other}"));
        }
    }
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn memory(max_tokens: u32) -> AdaptiveMemory {
        AdaptiveMemory::new(MemoryConfig {
            max_tokens,
            importance_threshold: 0.5,
            persist_path: None,
        })
    }

    fn content(tag: &str) -> Value {
        json!({ "input": format!("question about {tag}"), "output": format!("answer about {tag}") })
    }

    #[test]
    fn below_threshold_is_rejected() {
        let mem = memory(1000);
        assert!(!mem.add(TaskKind::Generate, content("a"), 0.3));
        assert_eq!(mem.stats().entries, 0);
    }

    #[test]
    fn budget_always_holds() {
        let mem = memory(60);
        for i in 0..20 {
            mem.add(TaskKind::Generate, content(&format!("topic-{i}")), 0.9);
            assert!(mem.stats().used_tokens <= 60);
        }
        assert!(mem.stats().entries >= 1);
    }

    #[test]
    fn oversized_entry_is_rejected_without_clearing_store() {
        let mem = memory(30);
        assert!(mem.add(TaskKind::Generate, json!({"q": "short"}), 0.9));
        let huge = json!({ "blob": "x".repeat(400) });
        assert!(!mem.add(TaskKind::Generate, huge, 0.9));
        assert_eq!(mem.stats().entries, 1);
    }

    #[test]
    fn admission_evicts_exactly_one_of_two_when_budget_is_tight() {
        let e1 = content("first");
        let e2 = content("second-longer");
        let cost1 = AdaptiveMemory::estimate_tokens(&e1);
        let cost2 = AdaptiveMemory::estimate_tokens(&e2);

        let mem = memory(cost1 + cost2 - 1);
        assert!(mem.add(TaskKind::Generate, e1, 0.9));
        assert!(!mem.add(TaskKind::Generate, e2.clone(), 0.3), "below threshold");
        assert_eq!(mem.stats().entries, 1);

        assert!(mem.add(TaskKind::Generate, e2, 0.9));
        let stats = mem.stats();
        assert_eq!(stats.entries, 1, "exactly one of the two survives");
        assert!(stats.used_tokens <= cost1 + cost2 - 1);
    }

    #[test]
    fn top_k_filters_by_kind_and_orders_by_recency() {
        let mem = memory(10_000);
        mem.add(TaskKind::Generate, content("g1"), 0.9);
        mem.add(TaskKind::Chat, content("c1"), 0.9);
        mem.add(TaskKind::Generate, content("g2"), 0.9);

        let top = mem.top_k(TaskKind::Generate, 5);
        assert_eq!(top.len(), 2);
        assert!(top[0].created_at >= top[1].created_at);
        assert!(top.iter().all(|e| e.kind == TaskKind::Generate));
    }

    #[test]
    fn top_k_bumps_access_counts() {
        let mem = memory(10_000);
        mem.add(TaskKind::Generate, content("g"), 0.9);
        mem.top_k(TaskKind::Generate, 1);
        let again = mem.top_k(TaskKind::Generate, 1);
        assert_eq!(again[0].access_count, 2);
    }

    #[test]
    fn relevance_is_jaccard_over_flattened_pairs() {
        let mem = memory(10_000);
        mem.add(
            TaskKind::Generate,
            json!({"city": "paris", "country": "france"}),
            0.9,
        );
        mem.add(
            TaskKind::Generate,
            json!({"city": "berlin", "country": "germany"}),
            0.9,
        );

        let hits = mem.relevant(&json!({"city": "paris", "country": "france"}), 5);
        assert_eq!(hits.len(), 1);
        assert!((hits[0].0 - 1.0).abs() < f64::EPSILON);

        let partial = mem.relevant(&json!({"city": "paris", "country": "spain"}), 5);
        assert_eq!(partial.len(), 1);
        assert!(partial[0].0 > 0.0 && partial[0].0 < 1.0);
    }

    #[test]
    fn relevance_scores_stay_in_unit_interval() {
        let mem = memory(10_000);
        mem.add(TaskKind::Chat, json!({"a": 1, "b": 2}), 0.8);
        for (score, _) in mem.relevant(&json!({"a": 1, "c": 3}), 5) {
            assert!((0.0..=1.0).contains(&score));
        }
    }

    #[tokio::test]
    async fn checkpoint_restore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");
        let config = MemoryConfig {
            max_tokens: 10_000,
            importance_threshold: 0.5,
            persist_path: Some(path.clone()),
        };

        let mem = AdaptiveMemory::new(config.clone());
        mem.add(TaskKind::Generate, content("persisted"), 0.9);
        mem.checkpoint().await.unwrap();

        let restored = AdaptiveMemory::new(config);
        restored.restore().await.unwrap();
        assert_eq!(restored.stats(), mem.stats());
        assert_eq!(restored.top_k(TaskKind::Generate, 1).len(), 1);
    }

    #[tokio::test]
    async fn restore_with_missing_file_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mem = AdaptiveMemory::new(MemoryConfig {
            max_tokens: 100,
            importance_threshold: 0.5,
            persist_path: Some(dir.path().join("absent.json")),
        });
        mem.restore().await.unwrap();
        assert_eq!(mem.stats().entries, 0);
    }
}
