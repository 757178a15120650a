//! `SignatureStore` (C1): the layered cache — bounded LRU L1 in front of
//! the durable L2 SQLite store, with write-behind via `AsyncWriteQueue`.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use lru::LruCache;
use parking_lot::RwLock;
use std::num::NonZeroUsize;

use super::queue::AsyncWriteQueue;
use super::sqlite::SqliteSignatureStore;
use super::types::{
    CacheKey, SessionSignatureEntry, SignatureEntry, StoreStats, ToolSignatureEntry,
};
use crate::config::CacheConfig;
use crate::error::Result;

/// Whether an L2 write is applied synchronously or handed to the
/// AsyncWriteQueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Sync,
    Behind,
}

pub struct SignatureStore {
    l1: RwLock<LruCache<String, SignatureEntry>>,
    l2: Arc<SqliteSignatureStore>,
    queue: Option<AsyncWriteQueue>,
    write_mode: WriteMode,
    ttl: ChronoDuration,
    stats: RwLock<StoreStats>,
}

impl SignatureStore {
    pub fn new(l2: Arc<SqliteSignatureStore>, cache: &CacheConfig, queue: Option<AsyncWriteQueue>) -> Self {
        let capacity = NonZeroUsize::new(cache.max_size.max(1)).unwrap();
        Self {
            l1: RwLock::new(LruCache::new(capacity)),
            l2,
            write_mode: if queue.is_some() { WriteMode::Behind } else { WriteMode::Sync },
            queue,
            ttl: ChronoDuration::seconds(cache.ttl_s),
            stats: RwLock::new(StoreStats::default()),
        }
    }

    pub fn ttl(&self) -> ChronoDuration {
        self.ttl
    }

    /// L1 -> L2, with an L2 hit warming L1. Expired entries are never
    /// returned.
    pub async fn get(
        &self,
        thinking_hash: &str,
        namespace: &str,
        conversation_id: Option<&str>,
    ) -> Option<SignatureEntry> {
        let key = CacheKey::new(namespace, conversation_id.map(str::to_string), thinking_hash).as_string();
        let now = Utc::now();

        if let Some(entry) = self.l1_get(&key, now) {
            self.stats.write().l1_hits += 1;
            return Some(entry);
        }
        self.stats.write().l1_misses += 1;

        match self.l2.get(&key).await {
            Ok(Some(entry)) if !entry.is_expired(now) => {
                self.stats.write().l2_hits += 1;
                self.l1.write().put(key, entry.clone());
                Some(entry)
            }
            Ok(_) => {
                self.stats.write().l2_misses += 1;
                None
            }
            Err(e) => {
                self.degrade(e.to_string());
                None
            }
        }
    }

    /// Fallback lookup by thinking_hash alone, any namespace (spec §4.1,
    /// flagged open question (a) — see DESIGN.md). Promotes the hit into
    /// the *requested* namespace, in L1 only.
    pub async fn get_by_hash_fallback(
        &self,
        thinking_hash: &str,
        requested_namespace: &str,
        conversation_id: Option<&str>,
    ) -> Option<SignatureEntry> {
        match self.l2.get_by_hash_any_namespace(thinking_hash).await {
            Ok(Some(mut entry)) => {
                entry.namespace = requested_namespace.to_string();
                entry.conversation_id = conversation_id.map(str::to_string);
                let key = entry.cache_key().as_string();
                self.l1.write().put(key, entry.clone());
                Some(entry)
            }
            Ok(None) => None,
            Err(e) => {
                self.degrade(e.to_string());
                None
            }
        }
    }

    pub async fn get_most_recent(&self) -> Option<SignatureEntry> {
        match self.l2.get_most_recent().await {
            Ok(entry) => entry,
            Err(e) => {
                self.degrade(e.to_string());
                None
            }
        }
    }

    pub async fn set(&self, entry: SignatureEntry) {
        let key = entry.cache_key().as_string();
        self.l1.write().put(key, entry.clone());

        match self.write_mode {
            WriteMode::Sync => {
                if let Err(e) = self.l2.set(&entry).await {
                    self.degrade(e.to_string());
                }
            }
            WriteMode::Behind => {
                if let Some(queue) = &self.queue {
                    queue.enqueue(entry).await;
                }
            }
        }
    }

    pub async fn delete(&self, thinking_hash: &str, namespace: &str, conversation_id: Option<&str>) {
        let key = CacheKey::new(namespace, conversation_id.map(str::to_string), thinking_hash).as_string();
        self.l1.write().pop(&key);
        if let Err(e) = self.l2.delete(&key).await {
            self.degrade(e.to_string());
        }
    }

    pub async fn clear(&self, namespace: Option<&str>, conversation_id: Option<&str>) {
        self.l1.write().clear();
        if let Err(e) = self.l2.clear(namespace, conversation_id).await {
            self.degrade(e.to_string());
        }
    }

    pub async fn tool_get(&self, tool_id: &str) -> Option<ToolSignatureEntry> {
        match self.l2.tool_get(tool_id).await {
            Ok(Some(entry)) if !entry.is_expired(Utc::now()) => Some(entry),
            Ok(_) => None,
            Err(e) => {
                self.degrade(e.to_string());
                None
            }
        }
    }

    pub async fn tool_set(&self, entry: ToolSignatureEntry) {
        if let Err(e) = self.l2.tool_set(&entry).await {
            self.degrade(e.to_string());
        }
    }

    pub async fn session_get(&self, session_id: &str) -> Option<SessionSignatureEntry> {
        match self.l2.session_get(session_id).await {
            Ok(Some(entry)) if !entry.is_expired(Utc::now()) => Some(entry),
            Ok(_) => None,
            Err(e) => {
                self.degrade(e.to_string());
                None
            }
        }
    }

    pub async fn session_set(&self, entry: SessionSignatureEntry) {
        if let Err(e) = self.l2.session_set(&entry).await {
            self.degrade(e.to_string());
        }
    }

    /// Periodic sweep for expired L2 rows; L1 entries expire lazily on read.
    pub async fn sweep_expired(&self) -> Result<u64> {
        self.l2.sweep_expired(Utc::now()).await
    }

    pub fn stats(&self) -> StoreStats {
        self.stats.read().clone()
    }

    fn l1_get(&self, key: &str, now: chrono::DateTime<Utc>) -> Option<SignatureEntry> {
        let mut l1 = self.l1.write();
        match l1.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.access_count += 1;
                entry.last_accessed_at = now;
                Some(entry.clone())
            }
            Some(_) => {
                l1.pop(key);
                None
            }
            None => None,
        }
    }

    fn degrade(&self, error: String) {
        tracing::warn!(error = %error, "L2 operation failed; degrading to L1-only for this call");
        let mut stats = self.stats.write();
        stats.total_failed += 1;
        stats.last_error = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::types::is_valid_signature;

    fn sample_entry(hash: &str, ns: &str) -> SignatureEntry {
        let now = Utc::now();
        SignatureEntry {
            signature: "A".repeat(60),
            thinking_hash: hash.into(),
            thinking_prefix: "prefix".into(),
            model: "m".into(),
            namespace: ns.into(),
            conversation_id: Some("conv1".into()),
            created_at: now,
            expires_at: now + ChronoDuration::hours(1),
            last_accessed_at: now,
            access_count: 0,
        }
    }

    async fn new_store() -> SignatureStore {
        let l2 = Arc::new(SqliteSignatureStore::new("sqlite::memory:").await.unwrap());
        let cache_cfg = CacheConfig::default();
        SignatureStore::new(l2, &cache_cfg, None)
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = new_store().await;
        let entry = sample_entry("hash1", "ns1");
        store.set(entry.clone()).await;
        let fetched = store.get("hash1", "ns1", Some("conv1")).await.unwrap();
        assert!(is_valid_signature(&fetched.signature));
        assert_eq!(fetched.signature, entry.signature);
    }

    #[tokio::test]
    async fn l2_hit_warms_l1() {
        let store = new_store().await;
        let entry = sample_entry("hash2", "ns1");
        // write straight to L2, bypassing L1, simulating a cold-cache restart.
        store.l2.set(&entry).await.unwrap();
        let fetched = store.get("hash2", "ns1", Some("conv1")).await;
        assert!(fetched.is_some());
        assert_eq!(store.stats().l2_hits, 1);
        // second read should now be served from L1.
        let _ = store.get("hash2", "ns1", Some("conv1")).await;
        assert_eq!(store.stats().l1_hits, 1);
    }

    #[tokio::test]
    async fn hash_fallback_ignores_namespace() {
        let store = new_store().await;
        let entry = sample_entry("hash3", "other-ns");
        store.l2.set(&entry).await.unwrap();
        let fetched = store
            .get_by_hash_fallback("hash3", "requested-ns", Some("conv2"))
            .await
            .unwrap();
        assert_eq!(fetched.namespace, "requested-ns");
    }
}
