//! Best-effort cross-instance lock built on `setIfAbsent`, extending the
//! coalescer's in-process dedup to a fleet of proxy instances. Mirrors the
//! teacher's habit of pairing a shared `DashMap` of live work
//! (`active_requests` in `app.rs`) with a process-local bookkeeping set for
//! crash-time cleanup.

use cache_store::CacheStore;
use dashmap::DashSet;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

static ACQUISITION_COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct DistributedLock {
    store: Arc<dyn CacheStore>,
    enabled: bool,
    retry_attempts: u32,
    base_delay: Duration,
    active_locks: DashSet<String>,
}

impl DistributedLock {
    /// `store_supports_cross_instance` is false for the in-process backend:
    /// the lock is then a permanent no-op, since there is no cross-instance
    /// coordination to perform.
    pub fn new(store: Arc<dyn CacheStore>, enabled: bool, store_supports_cross_instance: bool, retry_attempts: u32, base_delay: Duration) -> Self {
        Self {
            store,
            enabled: enabled && store_supports_cross_instance,
            retry_attempts,
            base_delay,
            active_locks: DashSet::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn lock_key(fingerprint: &str) -> String {
        format!("lock:{fingerprint}")
    }

    fn lock_value() -> String {
        let n = ACQUISITION_COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", process::id(), n)
    }

    /// Single attempt, no retry.
    pub async fn try_acquire(&self, fingerprint: &str, ttl: Duration) -> Option<AcquiredLock<'_>> {
        if !self.enabled {
            return None;
        }
        let key = Self::lock_key(fingerprint);
        if self.store.set_if_absent(&key, &Self::lock_value(), ttl).await {
            self.active_locks.insert(key.clone());
            Some(AcquiredLock { lock: self, key })
        } else {
            None
        }
    }

    /// Up to `retryAttempts` tries with exponential backoff
    /// `min(baseDelay * 2^n, 1s)`. Returns `None` if the lock could not be
    /// acquired; the caller proceeds unlocked rather than failing the
    /// request (a rare duplicate upstream call is traded for availability).
    pub async fn acquire(&self, fingerprint: &str, ttl: Duration) -> Option<AcquiredLock<'_>> {
        if !self.enabled {
            return None;
        }

        let key = Self::lock_key(fingerprint);
        for attempt in 0..self.retry_attempts {
            if self.store.set_if_absent(&key, &Self::lock_value(), ttl).await {
                self.active_locks.insert(key.clone());
                return Some(AcquiredLock { lock: self, key });
            }
            let delay = self.base_delay.saturating_mul(1u32 << attempt.min(16));
            let delay = delay.min(Duration::from_millis(1000));
            tokio::time::sleep(delay).await;
        }

        warn!(%fingerprint, "lock acquisition exhausted retries, proceeding unlocked");
        None
    }

    async fn release(&self, key: &str) {
        self.store.delete(key).await;
        self.active_locks.remove(key);
    }

    /// Best-effort release of every lock this process currently holds.
    /// Called from the shutdown signal handler; in-process timers on the
    /// store side (TTL expiry) are the ultimate backstop if this never runs.
    pub async fn release_all_held(&self) {
        let keys: Vec<String> = self.active_locks.iter().map(|k| k.clone()).collect();
        for key in keys {
            self.store.delete(&key).await;
        }
        self.active_locks.clear();
    }
}

pub struct AcquiredLock<'a> {
    lock: &'a DistributedLock,
    key: String,
}

impl<'a> AcquiredLock<'a> {
    pub async fn release(self) {
        self.lock.release(&self.key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_store::MemoryStore;

    #[tokio::test]
    async fn disabled_when_store_has_no_cross_instance_meaning() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::default());
        let lock = DistributedLock::new(store, true, false, 10, Duration::from_millis(10));
        assert!(!lock.is_enabled());
        assert!(lock.try_acquire("fp", Duration::from_millis(100)).await.is_none());
    }

    #[tokio::test]
    async fn mutual_exclusion_for_the_same_fingerprint() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::default());
        let lock = DistributedLock::new(store, true, true, 1, Duration::from_millis(5));

        let first = lock.try_acquire("fp", Duration::from_millis(500)).await;
        assert!(first.is_some());
        let second = lock.try_acquire("fp", Duration::from_millis(500)).await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn acquire_retries_then_succeeds_after_release() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::default());
        let lock = DistributedLock::new(store, true, true, 5, Duration::from_millis(5));

        let held = lock.try_acquire("fp", Duration::from_millis(20)).await.unwrap();
        held.release().await;
        let acquired = lock.acquire("fp", Duration::from_millis(500)).await;
        assert!(acquired.is_some());
    }
}
