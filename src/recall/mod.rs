//! Flat vector index over experience embeddings.
//!
//! Append-only rows of `f32[D]` with an L2 top-K search and tombstone
//! deletes. The on-disk snapshot is a length-prefixed JSON header
//! (dimension, row ids, tombstones) followed by the raw row data, so the
//! id ↔ experience mapping is restored together with the vectors.

mod error;

pub use error::{RecallError, RecallResult};

use std::collections::{HashMap, HashSet};
use std::path::Path;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::constants::validate_embedding_dim;

/// Deterministic stand-in embedding for text the runtime failed to embed.
///
/// SHA-256 expands the text into bytes which are recentred and
/// L2-normalized. Carries no semantics; experiences built from it are
/// flagged so they can be re-embedded later.
pub fn fallback_embedding(text: &str, dim: usize) -> Vec<f32> {
    let mut bytes = Vec::with_capacity(dim);
    let mut counter: u64 = 0;
    while bytes.len() < dim {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(counter.to_le_bytes());
        bytes.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    bytes.truncate(dim);

    let mut vector: Vec<f32> = bytes
        .into_iter()
        .map(|b| (b as f32 - 127.5) / 127.5)
        .collect();
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

#[derive(serde::Serialize, serde::Deserialize)]
struct SnapshotHeader {
    dim: usize,
    count: usize,
    ids: Vec<u64>,
    tombstones: Vec<u64>,
}

struct IndexState {
    /// Flat row-major storage, `rows.len() * dim` floats.
    vectors: Vec<f32>,
    /// Row id per appended row, in insertion order.
    rows: Vec<u64>,
    /// Latest row per id; re-upserts supersede earlier rows.
    latest: HashMap<u64, usize>,
    tombstones: HashSet<u64>,
}

/// Read-mostly flat L2 index.
pub struct VectorRecall {
    dim: usize,
    state: RwLock<IndexState>,
}

impl VectorRecall {
    /// Creates an empty index of fixed dimension `dim`.
    pub fn new(dim: usize) -> RecallResult<Self> {
        validate_embedding_dim(dim)?;
        Ok(Self {
            dim,
            state: RwLock::new(IndexState {
                vectors: Vec::new(),
                rows: Vec::new(),
                latest: HashMap::new(),
                tombstones: HashSet::new(),
            }),
        })
    }

    /// The fixed embedding dimension.
    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Appends a row for `id`. A repeated id supersedes its earlier row and
    /// clears any tombstone.
    pub fn upsert(&self, id: u64, vector: &[f32]) -> RecallResult<()> {
        self.check_dim(vector)?;
        let mut state = self.state.write();
        let row = state.rows.len();
        state.vectors.extend_from_slice(vector);
        state.rows.push(id);
        state.latest.insert(id, row);
        state.tombstones.remove(&id);
        Ok(())
    }

    /// Top-`k` nearest rows to `query` by L2 distance, ascending, tombstones
    /// skipped. Returns at most `min(k, live_len)` results.
    pub fn search(&self, query: &[f32], k: usize) -> RecallResult<Vec<(u64, f32)>> {
        self.check_dim(query)?;
        let state = self.state.read();

        let mut scored: Vec<(u64, f32)> = state
            .latest
            .iter()
            .filter(|(id, _)| !state.tombstones.contains(id))
            .map(|(&id, &row)| {
                let start = row * self.dim;
                let stored = &state.vectors[start..start + self.dim];
                (id, l2_distance(query, stored))
            })
            .collect();

        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored)
    }

    /// Tombstones `id`; the row stays on disk but search skips it. Returns
    /// `true` when the id was live.
    pub fn delete(&self, id: u64) -> bool {
        let mut state = self.state.write();
        if !state.latest.contains_key(&id) || state.tombstones.contains(&id) {
            return false;
        }
        state.tombstones.insert(id);
        true
    }

    /// Appended rows, superseded and tombstoned ones included.
    pub fn len(&self) -> usize {
        self.state.read().rows.len()
    }

    /// Returns `true` when no rows have been appended.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids visible to search.
    pub fn live_len(&self) -> usize {
        let state = self.state.read();
        state
            .latest
            .keys()
            .filter(|id| !state.tombstones.contains(id))
            .count()
    }

    /// Writes the index to `path` (header + raw little-endian rows).
    pub async fn snapshot(&self, path: &Path) -> RecallResult<()> {
        let bytes = {
            let state = self.state.read();
            let header = SnapshotHeader {
                dim: self.dim,
                count: state.rows.len(),
                ids: state.rows.clone(),
                tombstones: state.tombstones.iter().copied().collect(),
            };
            let header_bytes = serde_json::to_vec(&header)?;

            let mut out =
                Vec::with_capacity(4 + header_bytes.len() + state.vectors.len() * 4);
            out.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&header_bytes);
            out.extend_from_slice(bytemuck::cast_slice(&state.vectors));
            out
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        debug!(path = %path.display(), "vector index snapshot written");
        Ok(())
    }

    /// Loads an index previously written by [`VectorRecall::snapshot`].
    pub async fn load(path: &Path) -> RecallResult<Self> {
        let bytes = tokio::fs::read(path).await?;
        if bytes.len() < 4 {
            return Err(RecallError::CorruptSnapshot {
                reason: "missing header length".to_string(),
            });
        }
        let header_len = u32::from_le_bytes(
            bytes[0..4]
                .try_into()
                .expect("slice of length 4 fits [u8; 4]"),
        ) as usize;
        if bytes.len() < 4 + header_len {
            return Err(RecallError::CorruptSnapshot {
                reason: "truncated header".to_string(),
            });
        }

        let header: SnapshotHeader = serde_json::from_slice(&bytes[4..4 + header_len])?;
        validate_embedding_dim(header.dim)?;
        if header.ids.len() != header.count {
            return Err(RecallError::CorruptSnapshot {
                reason: "id list does not match row count".to_string(),
            });
        }

        let payload = &bytes[4 + header_len..];
        if payload.len() % std::mem::size_of::<f32>() != 0 {
            return Err(RecallError::CorruptSnapshot {
                reason: format!("row data length {} is not float-aligned", payload.len()),
            });
        }
        let vectors: Vec<f32> = bytemuck::pod_collect_to_vec(payload);
        if vectors.len() != header.count * header.dim {
            return Err(RecallError::CorruptSnapshot {
                reason: format!(
                    "expected {} floats, found {}",
                    header.count * header.dim,
                    vectors.len()
                ),
            });
        }

        let mut latest = HashMap::with_capacity(header.count);
        for (row, &id) in header.ids.iter().enumerate() {
            latest.insert(id, row);
        }

        Ok(Self {
            dim: header.dim,
            state: RwLock::new(IndexState {
                vectors,
                rows: header.ids,
                latest,
                tombstones: header.tombstones.into_iter().collect(),
            }),
        })
    }

    fn check_dim(&self, vector: &[f32]) -> RecallResult<()> {
        if vector.len() != self.dim {
            return Err(RecallError::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for VectorRecall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorRecall")
            .field("dim", &self.dim)
            .field("rows", &self.len())
            .field("live", &self.live_len())
            .finish()
    }
}

fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}
