//! Process-local counter store.
//!
//! Serves as the fallback counter while the shared store is unreachable, and
//! as the primary store for `memory://` storage URIs. Counters live only as
//! long as the process.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use super::store::{window_end, CounterHit, CounterSource, CounterStore, WindowStats};
use crate::error::StoreError;

/// A fixed-window counter that started on its first hit.
#[derive(Debug, Clone, Copy)]
struct CounterRecord {
    count: u64,
    expires_at: DateTime<Utc>,
}

impl CounterRecord {
    fn new(expiry: Duration, now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            expires_at: window_end(now, expiry),
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// In-memory counter store guarded by a single mutex.
///
/// The lock is held only for one batch of increments, never across an await.
pub struct MemoryStore {
    counters: Mutex<HashMap<String, CounterRecord>>,
    source: CounterSource,
}

impl MemoryStore {
    /// Create a store acting as the fallback counter.
    pub fn new() -> Self {
        Self::with_source(CounterSource::Fallback)
    }

    /// Create a store acting as the shared store.
    pub fn shared() -> Self {
        Self::with_source(CounterSource::Shared)
    }

    fn with_source(source: CounterSource) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            source,
        }
    }

    /// Current count for `key`, or `None` if no live window exists.
    pub fn current_count(&self, key: &str) -> Option<u64> {
        let now = Utc::now();
        let counters = self.counters.lock();
        counters
            .get(key)
            .filter(|record| !record.is_expired(now))
            .map(|record| record.count)
    }

    /// Drop every counter whose window has elapsed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut counters = self.counters.lock();
        let before = counters.len();
        counters.retain(|_, record| !record.is_expired(now));
        before - counters.len()
    }

    /// Get the number of tracked counters.
    pub fn counter_count(&self) -> usize {
        self.counters.lock().len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    fn source(&self) -> CounterSource {
        self.source
    }

    async fn incr_many(
        &self,
        hits: &[CounterHit],
        amount: u64,
    ) -> Result<Vec<WindowStats>, StoreError> {
        let now = Utc::now();
        let mut counters = self.counters.lock();
        let mut applied = Vec::with_capacity(hits.len());

        for hit in hits {
            let record = counters.entry(hit.key.clone()).or_insert_with(|| {
                debug!(key = %hit.key, window = ?hit.expiry, "Creating new rate limit counter");
                CounterRecord::new(hit.expiry, now)
            });

            if record.is_expired(now) {
                *record = CounterRecord::new(hit.expiry, now);
            }
            record.count = record.count.saturating_add(amount);

            applied.push(WindowStats {
                count: record.count,
                reset_at: record.expires_at,
            });
            if record.count > hit.limit {
                break;
            }
        }

        Ok(applied)
    }

    async fn check(&self) -> bool {
        true
    }

    async fn reset(&self) -> Result<(), StoreError> {
        self.counters.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_counter_increment_within_window() {
        let store = MemoryStore::new();

        let stats = store.incr("k", Duration::from_secs(60), 1).await.unwrap();
        assert_eq!(stats.count, 1);
        let stats = store.incr("k", Duration::from_secs(60), 1).await.unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(store.current_count("k"), Some(2));
    }

    #[tokio::test]
    async fn test_counter_multi_hit_increment() {
        let store = MemoryStore::new();

        let stats = store.incr("k", Duration::from_secs(60), 5).await.unwrap();
        assert_eq!(stats.count, 5);
    }

    #[tokio::test]
    async fn test_reset_time_is_one_window_after_first_hit() {
        let store = MemoryStore::new();
        let before = Utc::now();

        let first = store.incr("k", Duration::from_secs(60), 1).await.unwrap();
        let second = store.incr("k", Duration::from_secs(60), 1).await.unwrap();

        assert_eq!(first.reset_at, second.reset_at);
        assert!(first.reset_at >= before + chrono::Duration::seconds(60));
        assert!(first.reset_at <= Utc::now() + chrono::Duration::seconds(60));
    }

    #[tokio::test]
    async fn test_window_expires() {
        let store = MemoryStore::new();

        store.incr("k", Duration::from_millis(50), 3).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(store.current_count("k"), None);
        let stats = store.incr("k", Duration::from_millis(50), 1).await.unwrap();
        assert_eq!(stats.count, 1);
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let store = MemoryStore::new();

        store.incr("short", Duration::from_millis(20), 1).await.unwrap();
        store.incr("long", Duration::from_secs(60), 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.cleanup_expired(), 1);
        assert_eq!(store.counter_count(), 1);
    }

    #[tokio::test]
    async fn test_reset_clears_counters() {
        let store = MemoryStore::new();
        store.incr("k", Duration::from_secs(60), 1).await.unwrap();

        store.reset().await.unwrap();
        assert_eq!(store.counter_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    store.incr("k", Duration::from_secs(60), 1).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.current_count("k"), Some(800));
    }

    #[tokio::test]
    async fn test_batch_stops_at_first_rejection() {
        let store = MemoryStore::new();
        let hits = [
            CounterHit {
                key: "a".to_string(),
                expiry: Duration::from_secs(60),
                limit: 1,
            },
            CounterHit {
                key: "b".to_string(),
                expiry: Duration::from_secs(60),
                limit: 10,
            },
        ];

        assert_eq!(store.incr_many(&hits, 1).await.unwrap().len(), 2);

        let applied = store.incr_many(&hits, 1).await.unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].count, 2);
        assert_eq!(store.current_count("b"), Some(1));
    }

    #[test]
    fn test_source() {
        assert_eq!(MemoryStore::new().source(), CounterSource::Fallback);
        assert_eq!(MemoryStore::shared().source(), CounterSource::Shared);
    }
}
