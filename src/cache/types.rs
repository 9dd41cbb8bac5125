//! Cache entry and statistics types.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A cached value with its bookkeeping, shared by both tiers.
///
/// Timestamps are unix milliseconds so the entry survives the trip through
/// the external KV store unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Stored bytes; ciphertext when `encrypted` is set.
    pub value: Vec<u8>,
    /// Creation time, unix milliseconds.
    pub created_at_ms: i64,
    /// Time-to-live in milliseconds.
    pub ttl_ms: u64,
    /// Reads served from this entry.
    pub access_count: u64,
    /// Last read time, unix milliseconds.
    pub last_access_ms: i64,
    /// Whether `value` is sealed by the secret box.
    pub encrypted: bool,
}

impl CacheEntry {
    /// Creates an entry stamped `now_ms`.
    pub fn new(value: Vec<u8>, ttl_ms: u64, encrypted: bool, now_ms: i64) -> Self {
        Self {
            value,
            created_at_ms: now_ms,
            ttl_ms,
            access_count: 0,
            last_access_ms: now_ms,
            encrypted,
        }
    }

    /// Returns `true` once `created_at + ttl` has passed.
    #[inline]
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.created_at_ms.saturating_add(self.ttl_ms as i64)
    }

    /// Records a read.
    #[inline]
    pub fn touch(&mut self, now_ms: i64) {
        self.access_count += 1;
        self.last_access_ms = now_ms;
    }
}

/// Monotonic cache counters plus a sampled size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Reads served from either tier.
    pub hits: u64,
    /// Reads that found nothing usable.
    pub misses: u64,
    /// Entries pushed out of the LRU tier by capacity.
    pub evictions: u64,
    /// Entries dropped because their TTL had passed.
    pub expirations: u64,
    /// KV writes that failed and were swallowed.
    pub kv_write_errors: u64,
    /// Entries currently held by the LRU tier (sampled).
    pub size: u64,
}

/// Lock-free counter block behind [`CacheStats`].
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub expirations: AtomicU64,
    pub kv_write_errors: AtomicU64,
}

impl CacheCounters {
    pub(crate) fn snapshot(&self, size: u64) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            kv_write_errors: self.kv_write_errors.load(Ordering::Relaxed),
            size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_inclusive_of_deadline() {
        let entry = CacheEntry::new(vec![1], 1000, false, 0);
        assert!(!entry.is_expired(999));
        assert!(entry.is_expired(1000));
        assert!(entry.is_expired(1001));
    }

    #[test]
    fn touch_updates_bookkeeping() {
        let mut entry = CacheEntry::new(vec![1], 1000, false, 0);
        entry.touch(500);
        entry.touch(700);
        assert_eq!(entry.access_count, 2);
        assert_eq!(entry.last_access_ms, 700);
    }
}
