use crate::glob::glob_to_regex;
use crate::{CacheStore, SetEntry, StoreBackendError};
use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Clone)]
struct StoredEntry {
    value: serde_json::Value,
    ttl: Option<Duration>,
}

struct TtlExpiry;

impl Expiry<String, StoredEntry> for TtlExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// In-process cache store backed by `moka`. Used when no remote store is
/// configured, or as the fallback when `CACHE_TYPE=auto` fails to reach Redis.
///
/// `setIfAbsent` has no cross-instance meaning here; the distributed lock
/// component short-circuits rather than calling through to this store.
pub struct MemoryStore {
    cache: Cache<String, StoredEntry>,
}

impl MemoryStore {
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(TtlExpiry)
            .build();

        Self { cache }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let hit = self.cache.get(key).await.map(|entry| entry.value);
        trace!(%key, hit = hit.is_some(), "memory store get");
        hit
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) {
        trace!(%key, ?ttl, "memory store set");
        self.cache
            .insert(key.to_string(), StoredEntry { value, ttl })
            .await;
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> bool {
        // `entry_by_ref().or_insert_with()` is moka's atomic get-or-insert:
        // the init future only runs, and only one caller's value wins, when
        // no entry for the key exists yet. `is_fresh()` tells us whether
        // this call was the one that won, which is exactly `setIfAbsent`.
        let value = value.to_string();
        let entry = self
            .cache
            .entry_by_ref(key)
            .or_insert_with(async move {
                StoredEntry {
                    value: serde_json::Value::String(value),
                    ttl: Some(ttl),
                }
            })
            .await;
        entry.is_fresh()
    }

    async fn delete(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    async fn delete_matching(&self, pattern: &str) {
        let re = glob_to_regex(pattern);
        let matching: Vec<String> = self
            .cache
            .iter()
            .filter(|(k, _)| re.is_match(k))
            .map(|(k, _)| k.as_str().to_string())
            .collect();
        for key in matching {
            self.cache.invalidate(&key).await;
        }
    }

    async fn multi_get(&self, keys: &[String]) -> Vec<Option<serde_json::Value>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await);
        }
        out
    }

    async fn multi_set(&self, entries: Vec<SetEntry>) {
        for (key, value, ttl) in entries {
            self.set(&key, value, ttl).await;
        }
    }

    async fn flush_all(&self) -> Result<(), StoreBackendError> {
        self.cache.invalidate_all();
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn stats(&self) -> serde_json::Value {
        self.cache.run_pending_tasks().await;
        serde_json::json!({
            "entryCount": self.cache.entry_count(),
            "weightedSize": self.cache.weighted_size(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn round_trips_a_value() {
        let store = MemoryStore::default();
        store.set("k", json!({"result": "0x1"}), None).await;
        assert_eq!(store.get("k").await, Some(json!({"result": "0x1"})));
    }

    #[tokio::test]
    async fn set_if_absent_only_wins_once() {
        let store = MemoryStore::default();
        assert!(store.set_if_absent("lock:fp", "pid-1", Duration::from_millis(500)).await);
        assert!(!store.set_if_absent("lock:fp", "pid-2", Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn delete_matching_honours_trailing_glob() {
        let store = MemoryStore::default();
        store.set("stale:a", json!(1), None).await;
        store.set("stale:b", json!(2), None).await;
        store.set("negative:a", json!(3), None).await;
        store.delete_matching("stale:*").await;
        assert_eq!(store.get("stale:a").await, None);
        assert_eq!(store.get("stale:b").await, None);
        assert_eq!(store.get("negative:a").await, Some(json!(3)));
    }

    #[tokio::test]
    async fn flush_all_clears_everything() {
        let store = MemoryStore::default();
        store.set("a", json!(1), None).await;
        store.flush_all().await.unwrap();
        assert_eq!(store.get("a").await, None);
    }
}
