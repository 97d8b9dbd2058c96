//! Ad-hoc atomic counters feeding `/health` and `/cache/stats`, in the
//! teacher's own style (`AtomicUsize` subscription counters in `app.rs`,
//! `AtomicBool`/`AtomicUsize` request counters in `rpcs/request.rs`) rather
//! than a full metrics-exporter backend.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub total_requests: AtomicU64,
    pub coalesced_requests: AtomicU64,
    pub stale_served: AtomicU64,
    pub negative_cache_hits: AtomicU64,
    pub lock_contentions: AtomicU64,
    pub upstream_errors: AtomicU64,
    pub circuit_breaker_rejections: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    #[serde(rename = "cacheHits")]
    pub cache_hits: u64,
    #[serde(rename = "cacheMisses")]
    pub cache_misses: u64,
    #[serde(rename = "totalRequests")]
    pub total_requests: u64,
    #[serde(rename = "cacheHitRate")]
    pub cache_hit_rate: f64,
    #[serde(rename = "coalescedRequests")]
    pub coalesced_requests: u64,
    #[serde(rename = "staleServed")]
    pub stale_served: u64,
    #[serde(rename = "negativeCacheHits")]
    pub negative_cache_hits: u64,
    #[serde(rename = "lockContentions")]
    pub lock_contentions: u64,
    #[serde(rename = "upstreamErrors")]
    pub upstream_errors: u64,
    #[serde(rename = "circuitBreakerRejections")]
    pub circuit_breaker_rejections: u64,
}

impl Metrics {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coalesced(&self) {
        self.coalesced_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_served(&self) {
        self.stale_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_negative_hit(&self) {
        self.negative_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_contention(&self) {
        self.lock_contentions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_breaker_rejection(&self) {
        self.circuit_breaker_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let hit_rate = if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        };

        MetricsSnapshot {
            cache_hits: hits,
            cache_misses: misses,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            cache_hit_rate: hit_rate,
            coalesced_requests: self.coalesced_requests.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            negative_cache_hits: self.negative_cache_hits.load(Ordering::Relaxed),
            lock_contentions: self.lock_contentions.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            circuit_breaker_rejections: self.circuit_breaker_rejections.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.total_requests.store(0, Ordering::Relaxed);
        self.coalesced_requests.store(0, Ordering::Relaxed);
        self.stale_served.store(0, Ordering::Relaxed);
        self.negative_cache_hits.store(0, Ordering::Relaxed);
        self.lock_contentions.store(0, Ordering::Relaxed);
        self.upstream_errors.store(0, Ordering::Relaxed);
        self.circuit_breaker_rejections.store(0, Ordering::Relaxed);
    }
}
