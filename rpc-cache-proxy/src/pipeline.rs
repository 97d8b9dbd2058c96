//! Orchestrates method policy, coalescer, distributed lock, circuit breaker
//! and upstream client into the end-to-end request-handling flow. This is
//! the component the teacher's `Web3ProxyApp::proxy_web3_rpc_request`
//! plays in `app.rs`: the single place that owns every sub-component and
//! walks the fixed negative -> positive -> stale -> coalesce -> lock ->
//! recheck -> breaker -> upstream -> cache-write -> lock-release sequence.

use crate::canonical::fingerprint;
use crate::coalescer::{CoalesceError, Coalescer};
use crate::config::AppConfig;
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::lock::DistributedLock;
use crate::method_policy::{self, MethodPolicyConfig, Ttl};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::upstream::{EndpointHealthSnapshot, UpstreamClient, UpstreamError};
use cache_store::CacheStore;
use circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, trace, warn};

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::Rpc(m) => write!(f, "rpc error: {m}"),
            UpstreamError::AllEndpointsFailed(m) => write!(f, "all endpoints failed: {m}"),
        }
    }
}

/// Clonable stand-in for the producer's error so it can live in the
/// coalescer's shared-future slot; translated to a `ProxyError`/JSON-RPC
/// error only once, at the pipeline's outer boundary.
#[derive(Debug, Clone)]
pub enum FetchError {
    BreakerOpen,
    Rpc(String),
    AllEndpointsFailed(String),
}

pub struct Pipeline {
    config: AppConfig,
    store: Arc<dyn CacheStore>,
    method_policy_config: MethodPolicyConfig,
    upstream: Arc<UpstreamClient>,
    breaker: Arc<CircuitBreaker>,
    coalescer: Coalescer<Value, FetchError>,
    lock: DistributedLock,
    metrics: Arc<Metrics>,
    started_at: tokio::time::Instant,
}

impl Pipeline {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn CacheStore>,
        store_supports_cross_instance: bool,
        upstream: UpstreamClient,
    ) -> Self {
        let method_policy_config = MethodPolicyConfig {
            latest_ttl: config.latest_block_ttl,
            recent_block_ttl: config.recent_block_ttl,
            eth_call_ttl: config.eth_call_ttl,
            permanent_height: config.permanent_cache_height,
        };

        let breaker = CircuitBreaker::new(circuit_breaker::CircuitBreakerConfig {
            failure_threshold: config.circuit_failure_threshold,
            success_threshold: config.circuit_success_threshold,
            timeout: config.circuit_timeout,
            reset_timeout: config.circuit_reset_timeout,
            volume_threshold: config.circuit_volume_threshold,
            error_threshold_percentage: config.circuit_error_percentage,
            window_size: config.circuit_reset_timeout * 6,
        });

        let lock = DistributedLock::new(
            store.clone(),
            config.distributed_lock_enabled,
            store_supports_cross_instance,
            config.lock_retry_attempts,
            config.lock_retry_delay,
        );

        let coalescer = Coalescer::new(config.coalescing_enabled, config.coalescing_timeout);

        Self {
            metrics: Arc::new(Metrics::default()),
            started_at: tokio::time::Instant::now(),
            config,
            store,
            method_policy_config,
            upstream: Arc::new(upstream),
            breaker: Arc::new(breaker),
            coalescer,
            lock,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Step 1-8 of the resolution pipeline for a single request. Never
    /// propagates an exception to the HTTP layer: every error path resolves
    /// to a well-formed JSON-RPC error response.
    #[instrument(skip(self, request), fields(method = %request.method))]
    pub async fn resolve(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        self.metrics.record_request();

        if request.jsonrpc != "2.0" {
            return JsonRpcResponse::invalid_request(request.id);
        }

        let params = request.params.clone().unwrap_or(Value::Array(Vec::new()));
        let ttl = method_policy::classify(&request.method, &params, &self.method_policy_config);

        if !ttl.is_cacheable() {
            return self.call_upstream_direct(&request.method, params, request.id).await;
        }

        let fp = fingerprint(&request.method, request.params.as_ref());

        if self.config.negative_caching {
            if let Some(entry) = self.store.get(&negative_key(&fp)).await {
                self.metrics.record_negative_hit();
                let message = entry
                    .get("errorMessage")
                    .and_then(|m| m.as_str())
                    .unwrap_or("cached error")
                    .to_string();
                let timestamp = entry.get("timestamp").and_then(|t| t.as_i64()).unwrap_or(0);
                return JsonRpcResponse::negative_cache_hit(request.id, message, timestamp);
            }
        }

        if let Some(value) = self.store.get(&fp).await {
            self.metrics.record_cache_hit();
            trace!(%fp, "cache hit");
            return JsonRpcResponse::success(request.id, value, true);
        }

        if self.config.stale_while_revalidate {
            if let Some(stale) = self.store.get(&stale_key(&fp)).await {
                self.metrics.record_cache_hit();
                self.metrics.record_stale_served();
                trace!(%fp, "serving stale copy, scheduling background refresh");
                self.spawn_background_refresh(request.method.clone(), params.clone(), fp.clone(), ttl);
                return JsonRpcResponse::success(request.id, stale, true);
            }
        }

        self.metrics.record_cache_miss();

        let method = request.method.clone();
        let upstream_id = request.id.clone();
        let fp_for_producer = fp.clone();

        let (result, coalesced) = self
            .coalescer
            .get_or_fetch(&fp, || {
                self.fetch_and_cache(method, params, upstream_id, fp_for_producer, ttl)
            })
            .await;

        if coalesced {
            self.metrics.record_coalesced();
        }

        self.respond_from_fetch(request.id, fp, result).await
    }

    async fn respond_from_fetch(
        &self,
        id: Value,
        fp: String,
        result: Result<Value, CoalesceError<FetchError>>,
    ) -> JsonRpcResponse {
        match result {
            Ok(value) => JsonRpcResponse::success(id, value, false),
            Err(CoalesceError::Timeout) => {
                self.metrics.record_upstream_error();
                self.maybe_store_negative(&fp, "request timed out").await;
                JsonRpcResponse::internal_error(id, "request timed out")
            }
            Err(CoalesceError::Producer(FetchError::BreakerOpen)) => {
                self.metrics.record_breaker_rejection();
                if self.config.stale_while_revalidate {
                    if let Some(stale) = self.store.get(&stale_key(&fp)).await {
                        return JsonRpcResponse::success(id, stale, true);
                    }
                }
                self.maybe_store_negative(&fp, "upstream unavailable").await;
                JsonRpcResponse::internal_error(id, "upstream unavailable")
            }
            Err(CoalesceError::Producer(FetchError::Rpc(msg))) => {
                self.maybe_store_negative(&fp, &msg).await;
                JsonRpcResponse::internal_error(id, msg)
            }
            Err(CoalesceError::Producer(FetchError::AllEndpointsFailed(detail))) => {
                self.metrics.record_upstream_error();
                let message = format!("all endpoints failed: {detail}");
                self.maybe_store_negative(&fp, &message).await;
                JsonRpcResponse::internal_error(id, message)
            }
        }
    }

    async fn maybe_store_negative(&self, fp: &str, message: &str) {
        if !self.config.negative_caching {
            return;
        }
        let entry = serde_json::json!({
            "errorMessage": message,
            "timestamp": now_millis(),
        });
        self.store
            .set(&negative_key(fp), entry, Some(self.config.negative_ttl))
            .await;
    }

    /// The producer passed to the coalescer: acquires the distributed lock
    /// (if enabled), re-reads the cache inside the critical section, calls
    /// upstream through the breaker, writes the result back, and always
    /// releases the lock before returning.
    async fn fetch_and_cache(
        &self,
        method: String,
        params: Value,
        id: Value,
        fp: String,
        ttl: Ttl,
    ) -> Result<Value, FetchError> {
        let guard = if self.lock.is_enabled() {
            match self.lock.acquire(&fp, self.config.lock_ttl).await {
                Some(guard) => Some(guard),
                None => {
                    self.metrics.record_lock_contention();
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    None
                }
            }
        } else {
            None
        };

        // another instance (or another waiter that raced ahead of us
        // acquiring the lock) may have filled the cache already.
        if let Some(value) = self.store.get(&fp).await {
            if let Some(guard) = guard {
                guard.release().await;
            }
            return Ok(value);
        }

        let outcome = self.call_upstream_through_breaker(&method, params, id).await;

        if let Ok(value) = &outcome {
            self.write_cache(&fp, value.clone(), ttl).await;
        }

        if let Some(guard) = guard {
            guard.release().await;
        }

        outcome
    }

    async fn write_cache(&self, fp: &str, value: Value, ttl: Ttl) {
        if !ttl.is_cacheable() {
            return;
        }
        let duration = if matches!(ttl, Ttl::Permanent) {
            None
        } else {
            ttl.as_duration()
        };
        self.store.set(fp, value.clone(), duration).await;
        if self.config.stale_while_revalidate {
            self.store
                .set(&stale_key(fp), value, Some(self.config.stale_ttl))
                .await;
        }
    }

    async fn call_upstream_through_breaker(
        &self,
        method: &str,
        params: Value,
        id: Value,
    ) -> Result<Value, FetchError> {
        match self.breaker.call(self.upstream.call(method, params, id)).await {
            Ok(value) => Ok(value),
            Err(CircuitBreakerError::Open) => Err(FetchError::BreakerOpen),
            Err(CircuitBreakerError::Timeout(_)) => {
                Err(FetchError::AllEndpointsFailed("upstream call timed out".to_string()))
            }
            Err(CircuitBreakerError::Inner(UpstreamError::Rpc(msg))) => Err(FetchError::Rpc(msg)),
            Err(CircuitBreakerError::Inner(UpstreamError::AllEndpointsFailed(detail))) => {
                Err(FetchError::AllEndpointsFailed(detail))
            }
        }
    }

    /// Non-cacheable methods skip the cache/coalescer/lock machinery
    /// entirely and go straight through the breaker to the upstream.
    async fn call_upstream_direct(&self, method: &str, params: Value, id: Value) -> JsonRpcResponse {
        match self.call_upstream_through_breaker(method, params, id.clone()).await {
            Ok(value) => JsonRpcResponse::success(id, value, false),
            Err(FetchError::BreakerOpen) => {
                self.metrics.record_breaker_rejection();
                JsonRpcResponse::internal_error(id, "upstream unavailable")
            }
            Err(FetchError::Rpc(msg)) => JsonRpcResponse::internal_error(id, msg),
            Err(FetchError::AllEndpointsFailed(detail)) => {
                self.metrics.record_upstream_error();
                JsonRpcResponse::internal_error(id, format!("all endpoints failed: {detail}"))
            }
        }
    }

    /// Best-effort background refresh for a stale hit: no client waits on
    /// it, the breaker still applies, and any failure is swallowed.
    fn spawn_background_refresh(&self, method: String, params: Value, fp: String, ttl: Ttl) {
        let store = self.store.clone();
        let upstream = self.upstream.clone();
        let breaker = self.breaker.clone();
        let stale_while_revalidate = self.config.stale_while_revalidate;
        let stale_ttl = self.config.stale_ttl;

        tokio::spawn(async move {
            let result = breaker.call(upstream.call(&method, params, Value::Null)).await;
            match result {
                Ok(value) => {
                    if ttl.is_cacheable() {
                        let duration = if matches!(ttl, Ttl::Permanent) { None } else { ttl.as_duration() };
                        store.set(&fp, value.clone(), duration).await;
                        if stale_while_revalidate {
                            store.set(&stale_key(&fp), value, Some(stale_ttl)).await;
                        }
                    }
                }
                Err(err) => warn!(%fp, %err, "background refresh failed"),
            }
        });
    }

    /// Releases every distributed lock this instance currently holds.
    /// Called from the shutdown signal handler so a crash mid-fetch does
    /// not leave another instance waiting out the full lock TTL.
    pub async fn release_held_locks(&self) {
        self.lock.release_all_held().await;
    }

    pub async fn flush(&self) -> Result<(), cache_store::StoreBackendError> {
        self.store.flush_all().await?;
        self.metrics.reset();
        Ok(())
    }

    /// Backend-specific snapshot plus metrics, for `GET /cache/stats`.
    pub async fn cache_stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            cache_type: self.store.backend_name(),
            backend: self.store.stats().await,
            metrics: self.metrics.snapshot(),
        }
    }

    pub async fn health_snapshot(&self) -> HealthSnapshot {
        let mut providers = Vec::with_capacity(self.upstream.endpoints().len());
        for endpoint in self.upstream.endpoints() {
            providers.push(endpoint.snapshot().await);
        }

        let breaker_stats = self.breaker.stats();

        HealthSnapshot {
            status: "ok",
            uptime_seconds: self.started_at.elapsed().as_secs(),
            cache_type: self.store.backend_name(),
            metrics: self.metrics.snapshot(),
            rpc_providers: providers,
            coalescing: CoalescingSnapshot {
                enabled: self.config.coalescing_enabled,
                in_flight: self.coalescer.in_flight_count(),
            },
            circuit_breaker: CircuitBreakerSnapshot {
                enabled: self.config.circuit_breaker_enabled,
                state: format!("{:?}", breaker_stats.state),
                consecutive_failures: breaker_stats.consecutive_failures,
            },
            distributed_lock: DistributedLockSnapshot {
                enabled: self.lock.is_enabled(),
            },
        }
    }
}

fn negative_key(fp: &str) -> String {
    format!("negative:{fp}")
}

fn stale_key(fp: &str) -> String {
    format!("stale:{fp}")
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Serialize)]
pub struct CoalescingSnapshot {
    pub enabled: bool,
    #[serde(rename = "inFlight")]
    pub in_flight: usize,
}

#[derive(Debug, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub enabled: bool,
    pub state: String,
    #[serde(rename = "consecutiveFailures")]
    pub consecutive_failures: u32,
}

#[derive(Debug, Serialize)]
pub struct DistributedLockSnapshot {
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct CacheStatsSnapshot {
    #[serde(rename = "cacheType")]
    pub cache_type: &'static str,
    pub backend: Value,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    #[serde(rename = "uptime")]
    pub uptime_seconds: u64,
    #[serde(rename = "cacheType")]
    pub cache_type: &'static str,
    pub metrics: MetricsSnapshot,
    #[serde(rename = "rpcProviders")]
    pub rpc_providers: Vec<EndpointHealthSnapshot>,
    pub coalescing: CoalescingSnapshot,
    #[serde(rename = "circuitBreaker")]
    pub circuit_breaker: CircuitBreakerSnapshot,
    #[serde(rename = "distributedLock")]
    pub distributed_lock: DistributedLockSnapshot,
}
