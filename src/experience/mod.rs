//! Append-only experience log.
//!
//! Every completed dispatch leaves an [`Experience`]: digests of what went
//! in and out, the embedding the recall index holds for it, and the scoring
//! metadata the adaptive memory uses. The log is JSON lines under the data
//! directory and is replayed at startup to rebuild the recall index.

mod error;

pub use error::{ExperienceError, ExperienceResult};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::task::TaskKind;

/// One retained task/result pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    /// Monotonic id, shared with the recall index.
    pub id: u64,
    /// Task kind.
    pub kind: TaskKind,
    /// SHA-256 of the input text, hex.
    pub input_digest: String,
    /// SHA-256 of the output text, hex.
    pub output_digest: String,
    /// Embedding of the input, recall-index dimension.
    pub embedding: Vec<f32>,
    /// Whether `embedding` came from the deterministic fallback rather than
    /// the runtime; such entries can be re-embedded later.
    pub fallback_embedding: bool,
    /// Importance score assigned at record time.
    pub score: f64,
    /// When the dispatch completed.
    pub created_at: DateTime<Utc>,
    /// Estimated token cost of the pair.
    pub token_cost: u32,
    /// Retrievals served from this experience.
    pub access_count: u32,
}

/// Append-only JSON-lines store for [`Experience`] records.
pub struct ExperienceLog {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
    next_id: AtomicU64,
}

impl ExperienceLog {
    /// Opens (or creates) the log at `path`, replaying existing records.
    ///
    /// Returns the log plus the replayed records so the caller can rebuild
    /// the recall index. Unparseable lines are skipped with a warning
    /// rather than poisoning the whole log.
    pub async fn open(path: &Path) -> ExperienceResult<(Self, Vec<Experience>)> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut records = Vec::new();
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                for (lineno, line) in contents.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Experience>(line) {
                        Ok(record) => records.push(record),
                        Err(e) => {
                            warn!(line = lineno + 1, error = %e, "skipping corrupt experience record")
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let next_id = records.iter().map(|r| r.id + 1).max().unwrap_or(0);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        Ok((
            Self {
                path: path.to_path_buf(),
                file: Mutex::new(file),
                next_id: AtomicU64::new(next_id),
            },
            records,
        ))
    }

    /// Allocates the next experience id.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Appends one record.
    pub async fn append(&self, record: &Experience) -> ExperienceResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// The log's path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for ExperienceLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperienceLog")
            .field("path", &self.path)
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64) -> Experience {
        Experience {
            id,
            kind: TaskKind::Generate,
            input_digest: "a".repeat(64),
            output_digest: "b".repeat(64),
            embedding: vec![0.1, 0.2],
            fallback_embedding: false,
            score: 0.8,
            created_at: Utc::now(),
            token_cost: 12,
            access_count: 0,
        }
    }

    #[tokio::test]
    async fn append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experience.log");

        {
            let (log, replayed) = ExperienceLog::open(&path).await.unwrap();
            assert!(replayed.is_empty());
            log.append(&record(log.next_id())).await.unwrap();
            log.append(&record(log.next_id())).await.unwrap();
        }

        let (log, replayed) = ExperienceLog::open(&path).await.unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].id, 0);
        assert_eq!(replayed[1].id, 1);
        assert_eq!(log.next_id(), 2, "ids continue after replay");
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experience.log");

        {
            let (log, _) = ExperienceLog::open(&path).await.unwrap();
            log.append(&record(0)).await.unwrap();
        }
        // Simulate a torn write.
        let mut contents = tokio::fs::read_to_string(&path).await.unwrap();
        contents.push_str("{\"id\": 1, \"kind\"");
        tokio::fs::write(&path, contents).await.unwrap();

        let (_, replayed) = ExperienceLog::open(&path).await.unwrap();
        assert_eq!(replayed.len(), 1);
    }
}
