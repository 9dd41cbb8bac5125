//! Two-tier cache: in-process LRU fronting the distributed KV store.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::CacheConfig;
use super::lru::{LruTier, TierLookup};
use super::types::{CacheCounters, CacheEntry, CacheStats};
use crate::kv::KvStore;
use crate::secrets::SecretBox;

use std::sync::atomic::Ordering;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Deduplicating result cache shared by all dispatch workers.
///
/// Reads consult the LRU first and fall back to the KV store, repopulating
/// the LRU on a KV hit. Writes go to both tiers; a KV write failure degrades
/// durability, not correctness, so it is counted and swallowed. Sensitive
/// values are sealed by the [`SecretBox`] before leaving the caller's hands
/// and stay sealed in both tiers.
pub struct TieredCache {
    lru: LruTier,
    kv: Arc<dyn KvStore>,
    secrets: Arc<SecretBox>,
    counters: CacheCounters,
    default_ttl: Duration,
    cleanup_interval: Duration,
}

impl TieredCache {
    /// Creates a cache over `kv` sealed by `secrets`.
    pub fn new(config: CacheConfig, kv: Arc<dyn KvStore>, secrets: Arc<SecretBox>) -> Self {
        Self {
            lru: LruTier::new(config.max_entries),
            kv,
            secrets,
            counters: CacheCounters::default(),
            default_ttl: config.default_ttl,
            cleanup_interval: config.cleanup_interval,
        }
    }

    /// The TTL applied when the caller does not specify one.
    #[inline]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Fetches the plaintext value under `key`, or `None` on miss.
    #[instrument(skip(self), fields(key = %&key[..key.len().min(16)]))]
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = now_ms();

        match self.lru.lookup(key, now) {
            TierLookup::Hit(entry) => return self.open_entry(key, entry).await,
            TierLookup::Expired => {
                debug!("entry expired in lru tier");
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.kv_delete_quiet(key).await;
                return None;
            }
            TierLookup::Miss => {}
        }

        let bytes = match self.kv.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                warn!(error = %e, "kv read failed, treating as miss");
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let mut entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "corrupt kv entry, deleting");
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.kv_delete_quiet(key).await;
                return None;
            }
        };

        if entry.is_expired(now) {
            debug!("entry expired in kv tier");
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            self.kv_delete_quiet(key).await;
            return None;
        }

        entry.touch(now);
        if self.lru.insert(key.to_string(), entry.clone()) {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        self.open_entry(key, entry).await
    }

    /// Stores `value` under `key` in both tiers.
    ///
    /// Never fails: the LRU write is infallible and a KV failure is counted
    /// as `kv_write_errors`. A later `get` of the same key in this process
    /// observes this value.
    #[instrument(skip(self, value), fields(key = %&key[..key.len().min(16)], len = value.len(), sensitive))]
    pub async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>, sensitive: bool) {
        let stored = if sensitive {
            match self.secrets.encrypt(value) {
                Ok(sealed) => sealed,
                Err(e) => {
                    warn!(error = %e, "refusing to cache sensitive value that failed to seal");
                    return;
                }
            }
        } else {
            value.to_vec()
        };

        let ttl = ttl.unwrap_or(self.default_ttl);
        let entry = CacheEntry::new(stored, ttl.as_millis() as u64, sensitive, now_ms());

        if self.lru.insert(key.to_string(), entry.clone()) {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }

        let bytes = match serde_json::to_vec(&entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "cache entry serialization failed");
                self.counters.kv_write_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if let Err(e) = self.kv.set(key, &bytes, ttl).await {
            warn!(error = %e, "kv write failed");
            self.counters.kv_write_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Removes `key` from both tiers.
    pub async fn delete(&self, key: &str) {
        self.lru.remove(key);
        self.kv_delete_quiet(key).await;
    }

    /// Samples the counters and current LRU size.
    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot(self.lru.len() as u64)
    }

    /// Starts the periodic expired-entry sweeper for the LRU tier. The KV
    /// store is expected to honour TTL natively.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let interval = self.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a fresh cache
            // is not swept at startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.lru.sweep(now_ms());
                        if removed > 0 {
                            debug!(removed, "sweeper removed expired entries");
                            cache.counters.expirations.fetch_add(removed, Ordering::Relaxed);
                        }
                    }
                }
            }
        })
    }

    async fn open_entry(&self, key: &str, entry: CacheEntry) -> Option<Vec<u8>> {
        if !entry.encrypted {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.value);
        }
        match self.secrets.decrypt(&entry.value) {
            Ok(plaintext) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(plaintext)
            }
            Err(e) => {
                warn!(error = %e, "cached entry failed to open, deleting");
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.lru.remove(key);
                self.kv_delete_quiet(key).await;
                None
            }
        }
    }

    async fn kv_delete_quiet(&self, key: &str) {
        if let Err(e) = self.kv.delete(key).await {
            debug!(error = %e, "kv delete failed");
        }
    }
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("size", &self.lru.len())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{FlakyKvStore, MemoryKvStore};

    fn cache_over(kv: Arc<dyn KvStore>) -> TieredCache {
        TieredCache::new(
            CacheConfig {
                max_entries: 8,
                default_ttl: Duration::from_secs(60),
                cleanup_interval: Duration::from_secs(300),
            },
            kv,
            Arc::new(SecretBox::new("test-secret")),
        )
    }

    #[tokio::test]
    async fn set_then_get_returns_value() {
        let cache = cache_over(Arc::new(MemoryKvStore::new()));
        cache.set("k", b"v", None, false).await;
        assert_eq!(cache.get("k").await, Some(b"v".to_vec()));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.size, 1);
    }

    #[tokio::test]
    async fn overwrite_wins() {
        let cache = cache_over(Arc::new(MemoryKvStore::new()));
        cache.set("k", b"v1", None, false).await;
        cache.set("k", b"v2", None, false).await;
        assert_eq!(cache.get("k").await, Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn kv_tier_repopulates_lru() {
        let kv = Arc::new(MemoryKvStore::new());
        let secrets = Arc::new(SecretBox::new("shared"));

        let writer = TieredCache::new(
            CacheConfig::default(),
            Arc::clone(&kv) as Arc<dyn KvStore>,
            Arc::clone(&secrets),
        );
        writer.set("k", b"v", None, false).await;

        // A second cache over the same KV store simulates another replica.
        let reader = TieredCache::new(CacheConfig::default(), kv, secrets);
        assert_eq!(reader.get("k").await, Some(b"v".to_vec()));
        assert_eq!(reader.stats().size, 1, "kv hit should repopulate the lru");
    }

    #[tokio::test]
    async fn expired_entry_counts_miss_and_expiration() {
        let cache = cache_over(Arc::new(MemoryKvStore::new()));
        cache
            .set("k", b"v", Some(Duration::from_millis(10)), false)
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("k").await, None);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test]
    async fn sensitive_values_are_sealed_in_both_tiers() {
        let kv = Arc::new(MemoryKvStore::new());
        let cache = cache_over(Arc::clone(&kv) as Arc<dyn KvStore>);
        cache.set("k", b"card number", None, true).await;

        // The KV tier must never see plaintext.
        let raw = kv.get("k").await.unwrap().expect("kv entry present");
        let entry: CacheEntry = serde_json::from_slice(&raw).unwrap();
        assert!(entry.encrypted);
        assert_ne!(entry.value, b"card number".to_vec());

        assert_eq!(cache.get("k").await, Some(b"card number".to_vec()));
    }

    #[tokio::test]
    async fn undecryptable_entry_reads_as_miss_and_is_deleted() {
        let kv = Arc::new(MemoryKvStore::new());
        let secrets = Arc::new(SecretBox::new("writer-secret"));
        let writer = TieredCache::new(
            CacheConfig::default(),
            Arc::clone(&kv) as Arc<dyn KvStore>,
            secrets,
        );
        writer.set("k", b"private", None, true).await;

        // A reader with a different key cannot open the entry.
        let reader = TieredCache::new(
            CacheConfig::default(),
            Arc::clone(&kv) as Arc<dyn KvStore>,
            Arc::new(SecretBox::new("other-secret")),
        );
        assert_eq!(reader.get("k").await, None);
        assert_eq!(kv.get("k").await.unwrap(), None, "bad entry deleted");
    }

    #[tokio::test]
    async fn kv_write_failure_does_not_fail_set() {
        let kv = Arc::new(FlakyKvStore::new());
        kv.set_fail_writes(true);
        let cache = cache_over(Arc::clone(&kv) as Arc<dyn KvStore>);

        cache.set("k", b"v", None, false).await;
        // Same-process read still served by the LRU tier.
        assert_eq!(cache.get("k").await, Some(b"v".to_vec()));
        assert_eq!(cache.stats().kv_write_errors, 1);
    }

    #[tokio::test]
    async fn capacity_eviction_is_counted() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let cache = TieredCache::new(
            CacheConfig {
                max_entries: 2,
                ..CacheConfig::default()
            },
            kv,
            Arc::new(SecretBox::new("s")),
        );
        cache.set("a", b"1", None, false).await;
        cache.set("b", b"2", None, false).await;
        cache.set("c", b"3", None, false).await;
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.stats().size, 2);
    }

    #[tokio::test]
    async fn sweeper_collects_expired_entries() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let cache = Arc::new(TieredCache::new(
            CacheConfig {
                max_entries: 8,
                default_ttl: Duration::from_secs(60),
                cleanup_interval: Duration::from_millis(20),
            },
            kv,
            Arc::new(SecretBox::new("s")),
        ));
        cache
            .set("k", b"v", Some(Duration::from_millis(5)), false)
            .await;

        let cancel = CancellationToken::new();
        let handle = cache.spawn_sweeper(cancel.clone());
        tokio::time::sleep(Duration::from_millis(80)).await;
        cancel.cancel();
        let _ = handle.await;

        assert_eq!(cache.stats().size, 0);
        assert!(cache.stats().expirations >= 1);
    }
}
