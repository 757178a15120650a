//! The batched write-behind queue in front of the L2 store.
//!
//! Modeled as an explicit state enum rather than exceptions/strings for
//! control flow (design note: "exceptions for control flow").

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::sqlite::SqliteSignatureStore;
use super::types::SignatureEntry;
use crate::config::AsyncQueueConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Stopped,
    Running,
    Draining,
    Stopping,
}

#[derive(Debug, Default)]
pub struct QueueStats {
    pub total_enqueued: AtomicU64,
    pub total_dropped: AtomicU64,
    pub total_written: AtomicU64,
    pub total_failed: AtomicU64,
}

/// Background batched writer: entries are enqueued synchronously (fast,
/// non-blocking unless `drop_on_overflow` is false and the channel is full)
/// and flushed to L2 by a single consumer task in batches of `batch_size`
/// or every `batch_timeout_ms`, whichever comes first.
pub struct AsyncWriteQueue {
    sender: mpsc::Sender<SignatureEntry>,
    state: Arc<parking_lot::Mutex<QueueState>>,
    stats: Arc<QueueStats>,
    drop_on_overflow: bool,
}

impl AsyncWriteQueue {
    pub fn start(store: Arc<SqliteSignatureStore>, config: AsyncQueueConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.max_queue_size);
        let state = Arc::new(parking_lot::Mutex::new(QueueState::Running));
        let stats = Arc::new(QueueStats::default());

        tokio::spawn(Self::run(
            receiver,
            store,
            config.clone(),
            state.clone(),
            stats.clone(),
        ));

        Self {
            sender,
            state,
            stats,
            drop_on_overflow: config.drop_on_overflow,
        }
    }

    /// Enqueues `entry` for eventual write-through to L2. Never fails the
    /// caller: on overflow it either drops the entry (counted in stats) or
    /// blocks briefly, per `drop_on_overflow`.
    pub async fn enqueue(&self, entry: SignatureEntry) {
        self.stats.total_enqueued.fetch_add(1, Ordering::Relaxed);
        if self.drop_on_overflow {
            if self.sender.try_send(entry).is_err() {
                self.stats.total_dropped.fetch_add(1, Ordering::Relaxed);
            }
        } else if self.sender.send(entry).await.is_err() {
            self.stats.total_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn state(&self) -> QueueState {
        *self.state.lock()
    }

    pub fn stats(&self) -> (u64, u64, u64, u64) {
        (
            self.stats.total_enqueued.load(Ordering::Relaxed),
            self.stats.total_dropped.load(Ordering::Relaxed),
            self.stats.total_written.load(Ordering::Relaxed),
            self.stats.total_failed.load(Ordering::Relaxed),
        )
    }

    /// Requests a graceful shutdown: the consumer drains whatever is
    /// already in the channel, then stops. Dropping the queue's sender
    /// (by dropping `self`) triggers this naturally, but callers that want
    /// to await the drain can use this explicitly.
    pub fn request_drain(&self) {
        *self.state.lock() = QueueState::Draining;
    }

    async fn run(
        mut receiver: mpsc::Receiver<SignatureEntry>,
        store: Arc<SqliteSignatureStore>,
        config: AsyncQueueConfig,
        state: Arc<parking_lot::Mutex<QueueState>>,
        stats: Arc<QueueStats>,
    ) {
        let mut batch: Vec<SignatureEntry> = Vec::with_capacity(config.batch_size);
        let timeout = Duration::from_millis(config.batch_timeout_ms);
        loop {
            let deadline = Instant::now() + timeout;
            let mut timed_out = false;
            while batch.len() < config.batch_size {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    timed_out = true;
                    break;
                }
                match tokio::time::timeout(remaining, receiver.recv()).await {
                    Ok(Some(entry)) => batch.push(entry),
                    Ok(None) => {
                        // Sender dropped: flush what we have and stop.
                        Self::flush(&store, &mut batch, &config, &stats).await;
                        *state.lock() = QueueState::Stopped;
                        return;
                    }
                    Err(_) => {
                        timed_out = true;
                        break;
                    }
                }
            }
            if timed_out || batch.len() >= config.batch_size {
                Self::flush(&store, &mut batch, &config, &stats).await;
            }
            if *state.lock() == QueueState::Draining && batch.is_empty() {
                *state.lock() = QueueState::Stopped;
                return;
            }
        }
    }

    async fn flush(
        store: &Arc<SqliteSignatureStore>,
        batch: &mut Vec<SignatureEntry>,
        config: &AsyncQueueConfig,
        stats: &Arc<QueueStats>,
    ) {
        if batch.is_empty() {
            return;
        }
        let entries = std::mem::take(batch);
        let mut attempt = 0u32;
        let mut pending = entries;
        loop {
            let mut failed = Vec::new();
            let mut wrote = 0u64;
            for entry in &pending {
                match store.set(entry).await {
                    Ok(()) => wrote += 1,
                    Err(e) => {
                        tracing::warn!(error = %e, "L2 batch write failed for entry, will retry");
                        failed.push(entry.clone());
                    }
                }
            }
            stats.total_written.fetch_add(wrote, Ordering::Relaxed);
            if failed.is_empty() {
                return;
            }
            attempt += 1;
            if attempt > config.max_retries {
                stats
                    .total_failed
                    .fetch_add(failed.len() as u64, Ordering::Relaxed);
                tracing::error!(
                    count = failed.len(),
                    "giving up on L2 batch write after max_retries"
                );
                return;
            }
            let backoff = Duration::from_millis(100 * 2u64.pow(attempt.min(10)));
            tokio::time::sleep(backoff).await;
            pending = failed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::types::SignatureEntry;
    use chrono::{Duration as ChronoDuration, Utc};

    fn sample_entry(hash: &str) -> SignatureEntry {
        let now = Utc::now();
        SignatureEntry {
            signature: "A".repeat(60),
            thinking_hash: hash.into(),
            thinking_prefix: "prefix".into(),
            model: "m".into(),
            namespace: "ns".into(),
            conversation_id: None,
            created_at: now,
            expires_at: now + ChronoDuration::hours(1),
            last_accessed_at: now,
            access_count: 0,
        }
    }

    #[tokio::test]
    async fn enqueued_entries_eventually_land_in_l2() {
        let store = Arc::new(SqliteSignatureStore::new("sqlite::memory:").await.unwrap());
        let config = AsyncQueueConfig {
            batch_size: 2,
            batch_timeout_ms: 50,
            ..Default::default()
        };
        let queue = AsyncWriteQueue::start(store.clone(), config);

        let entry = sample_entry("hash-async");
        queue.enqueue(entry.clone()).await;

        // Wait past the batch timeout for the consumer to flush.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let fetched = store
            .get(&entry.cache_key().as_string())
            .await
            .unwrap();
        assert!(fetched.is_some());
    }
}
