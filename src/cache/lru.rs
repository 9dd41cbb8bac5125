//! In-process strict-LRU tier.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use super::types::CacheEntry;

/// Outcome of an LRU lookup, split so the caller can count precisely.
#[derive(Debug)]
pub(crate) enum TierLookup {
    /// Live entry; bookkeeping already touched.
    Hit(CacheEntry),
    /// An entry was present but past its TTL; it has been removed.
    Expired,
    /// Nothing under the key.
    Miss,
}

/// Bounded front tier. Strict LRU: the least-recently-read entry is evicted
/// when the tier is full. The lock is held only for structural mutation.
pub(crate) struct LruTier {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl LruTier {
    pub(crate) fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).expect("max(1) is non-zero");
        Self {
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Looks up `key`, promoting it on hit and dropping it when expired.
    pub(crate) fn lookup(&self, key: &str, now_ms: i64) -> TierLookup {
        let mut entries = self.entries.lock();
        let expired = match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now_ms) => {
                entry.touch(now_ms);
                return TierLookup::Hit(entry.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
            TierLookup::Expired
        } else {
            TierLookup::Miss
        }
    }

    /// Inserts `entry`, returning `true` when a *different* live entry was
    /// evicted to make room.
    pub(crate) fn insert(&self, key: String, entry: CacheEntry) -> bool {
        let mut entries = self.entries.lock();
        match entries.push(key.clone(), entry) {
            Some((evicted_key, _)) => evicted_key != key,
            None => false,
        }
    }

    pub(crate) fn remove(&self, key: &str) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    /// Drops every expired entry, returning how many were removed.
    pub(crate) fn sweep(&self, now_ms: i64) -> u64 {
        let mut entries = self.entries.lock();
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now_ms))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            entries.pop(key);
        }
        stale.len() as u64
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
