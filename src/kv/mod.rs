//! Distributed key/value store contract.
//!
//! The cache's second tier speaks this trait. Production deployments plug a
//! networked store (e.g. Redis) behind it; [`MemoryKvStore`] is a
//! TTL-honouring in-process implementation for tests and standalone use.

mod error;

pub use error::{KvError, KvResult};

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

/// String-key, byte-value store with per-entry TTL.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetches `key`, or `None` when absent or expired.
    async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>>;

    /// Stores `value` under `key` for `ttl`.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> KvResult<()>;

    /// Removes `key`; absent keys are not an error.
    async fn delete(&self, key: &str) -> KvResult<()>;

    /// Lists live keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> KvResult<Vec<String>>;
}

struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-memory [`KvStore`] that enforces TTL on read.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryKvStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently held, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> KvResult<()> {
        self.entries.lock().insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> KvResult<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|(k, v)| k.starts_with(prefix) && v.expires_at > now)
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// [`KvStore`] decorator that fails selected operations, for degradation tests.
#[cfg(any(test, feature = "mock"))]
pub struct FlakyKvStore {
    inner: MemoryKvStore,
    fail_reads: std::sync::atomic::AtomicBool,
    fail_writes: std::sync::atomic::AtomicBool,
}

#[cfg(any(test, feature = "mock"))]
impl FlakyKvStore {
    /// Creates a store that initially succeeds everything.
    pub fn new() -> Self {
        Self {
            inner: MemoryKvStore::new(),
            fail_reads: std::sync::atomic::AtomicBool::new(false),
            fail_writes: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Makes subsequent reads fail (or succeed again).
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Makes subsequent writes fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(any(test, feature = "mock"))]
impl Default for FlakyKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "mock"))]
#[async_trait]
impl KvStore for FlakyKvStore {
    async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        if self.fail_reads.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(KvError::Backend {
                message: "injected read failure".to_string(),
            });
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> KvResult<()> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(KvError::Backend {
                message: "injected write failure".to_string(),
            });
        }
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.inner.delete(key).await
    }

    async fn keys(&self, prefix: &str) -> KvResult<Vec<String>> {
        self.inner.keys(prefix).await
    }
}
