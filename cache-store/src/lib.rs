//! Uniform key-value store abstraction with two interchangeable backends: an
//! in-process [`MemoryStore`] and a [`RedisStore`] shared across instances.
//!
//! Both backends satisfy the same [`CacheStore`] contract and must behave
//! identically from a caller's point of view, modulo durability across
//! restarts. A store operation that fails is never allowed to fail the
//! caller's request: reads degrade to a miss, writes are best-effort, and
//! every failure is logged at `warn` from inside the backend.

mod glob;
mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::{RedisStore, RedisStoreError};

use async_trait::async_trait;
use derive_more::Display;
use std::time::Duration;

/// A single `multiSet` entry: key, value, optional TTL (`None` = permanent).
pub type SetEntry = (String, serde_json::Value, Option<Duration>);

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch `key`. Returns `None` on a miss *or* on a backend error — callers
    /// cannot distinguish the two, which matches the spec's "errors degrade to
    /// cache-miss for reads" rule.
    async fn get(&self, key: &str) -> Option<serde_json::Value>;

    /// Store `key`, best-effort. `ttl = None` means permanent (no expiry).
    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>);

    /// Atomic set-if-absent. Returns `true` only if this call installed the
    /// value; `false` on either "already present" or a backend error (an
    /// error must never be mistaken for a successful acquisition).
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> bool;

    /// Delete `key`, best-effort.
    async fn delete(&self, key: &str);

    /// Delete every key matching a `*`/`?`/`\`-escaped glob pattern, best-effort.
    async fn delete_matching(&self, pattern: &str);

    async fn multi_get(&self, keys: &[String]) -> Vec<Option<serde_json::Value>>;

    async fn multi_set(&self, entries: Vec<SetEntry>);

    /// Flush every key this store owns. Unlike the other operations this one
    /// is allowed to report failure: it backs the `/cache/flush` operator
    /// endpoint, which needs an honest `success` flag.
    async fn flush_all(&self) -> Result<(), StoreBackendError>;

    /// Human-readable backend name for `/health` (`"memory"` or `"redis"`).
    fn backend_name(&self) -> &'static str;

    /// Backend-specific snapshot for `GET /cache/stats`, alongside the
    /// shared `Metrics` the caller attaches separately. Best-effort: a
    /// backend that cannot cheaply report more than its name returns `{}`.
    async fn stats(&self) -> serde_json::Value {
        serde_json::json!({})
    }
}

#[derive(Debug, Display)]
pub enum StoreBackendError {
    #[display(fmt = "redis error: {_0}")]
    Redis(RedisStoreError),
    #[display(fmt = "backend unavailable")]
    Unavailable,
}

impl std::error::Error for StoreBackendError {}
