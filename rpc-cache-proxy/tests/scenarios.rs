//! Black-box scenario tests against the full pipeline, driven through a
//! `wiremock` upstream and the in-memory store — the scenario table from
//! spec.md §8, each case its own test rather than a parameterised grid.

use cache_store::{CacheStore, MemoryStore};
use rpc_cache_proxy::config::{AppConfig, CacheType};
use rpc_cache_proxy::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use rpc_cache_proxy::pipeline::Pipeline;
use rpc_cache_proxy::upstream::UpstreamClient;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::method as http_method;
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn base_config(upstream_urls: Vec<String>) -> AppConfig {
    AppConfig {
        port: 0,
        host: "127.0.0.1".parse().unwrap(),
        upstream_urls,
        rpc_fallback_enabled: true,
        rpc_max_retries_per_url: 1,
        redis_url: None,
        cache_type: CacheType::Memory,
        permanent_cache_height: 15_537_393,
        latest_block_ttl: 2,
        recent_block_ttl: 60,
        eth_call_ttl: 300,
        coalescing_enabled: true,
        coalescing_timeout: Duration::from_secs(5),
        distributed_lock_enabled: true,
        lock_ttl: Duration::from_millis(500),
        lock_retry_attempts: 3,
        lock_retry_delay: Duration::from_millis(5),
        circuit_breaker_enabled: true,
        circuit_failure_threshold: 5,
        circuit_success_threshold: 2,
        circuit_timeout: Duration::from_secs(2),
        circuit_reset_timeout: Duration::from_millis(50),
        circuit_volume_threshold: 1000,
        circuit_error_percentage: 100.0,
        stale_while_revalidate: false,
        stale_ttl: Duration::from_secs(300),
        negative_caching: false,
        negative_ttl: Duration::from_secs(60),
    }
}

fn request(method: &str, params: Value, id: i64) -> JsonRpcRequest {
    serde_json::from_value(json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": id,
    }))
    .unwrap()
}

fn result_of(response: &JsonRpcResponse) -> &Value {
    match response {
        JsonRpcResponse::Success { result, .. } => result,
        JsonRpcResponse::Error { error, .. } => panic!("expected success, got error: {error:?}"),
    }
}

fn cached_of(response: &JsonRpcResponse) -> bool {
    match response {
        JsonRpcResponse::Success { cached, .. } => *cached,
        JsonRpcResponse::Error { .. } => panic!("expected success"),
    }
}

/// Scenario 1: 10 concurrent `eth_blockNumber` against an empty cache hit the
/// upstream exactly once; every waiter sees the same result with `cached:
/// false`, and 9 of the 10 ride the coalesced fetch.
#[tokio::test]
async fn ten_concurrent_block_number_requests_coalesce_to_one_upstream_call() {
    let upstream = MockServer::start().await;
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_for_responder = hits.clone();

    Mock::given(http_method("POST"))
        .respond_with(move |_req: &Request| {
            hits_for_responder.fetch_add(1, Ordering::SeqCst);
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": "0x16433f9",
                }))
                .set_delay(Duration::from_millis(50))
        })
        .mount(&upstream)
        .await;

    let client = UpstreamClient::new(vec![upstream.uri()], 1).unwrap();
    let pipeline = Arc::new(Pipeline::new(
        base_config(vec![upstream.uri()]),
        Arc::new(MemoryStore::default()),
        false,
        client,
    ));

    let mut handles = Vec::new();
    for i in 0..10 {
        let pipeline = pipeline.clone();
        handles.push(tokio::spawn(async move {
            pipeline.resolve(request("eth_blockNumber", json!([]), i)).await
        }));
    }

    let mut not_cached = 0;
    for handle in handles {
        let response = handle.await.unwrap();
        assert_eq!(result_of(&response), &json!("0x16433f9"));
        if !cached_of(&response) {
            not_cached += 1;
        }
    }

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(not_cached, 10, "every waiter of a live fetch reports cached:false");
    assert_eq!(pipeline.metrics().snapshot().coalesced_requests, 9);
}

/// Scenario 2: a fresh positive cache hit never touches the upstream.
#[tokio::test]
async fn fresh_cache_hit_never_calls_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(http_method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&upstream)
        .await;

    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::default());
    store.set("eth_blockNumber:[]", json!("0x1"), Some(Duration::from_secs(30))).await;

    let client = UpstreamClient::new(vec![upstream.uri()], 1).unwrap();
    let pipeline = Pipeline::new(base_config(vec![upstream.uri()]), store, false, client);

    let response = pipeline.resolve(request("eth_blockNumber", json!([]), 1)).await;
    assert_eq!(result_of(&response), &json!("0x1"));
    assert!(cached_of(&response));
    assert_eq!(pipeline.metrics().snapshot().total_requests, 1);
    assert_eq!(pipeline.metrics().snapshot().cache_misses, 0);
}

/// Scenario 3: a historical `getBlockByNumber` below the permanent-height
/// cutoff is stored with no expiry.
#[tokio::test]
async fn historical_block_by_number_is_cached_permanently() {
    let upstream = MockServer::start().await;
    Mock::given(http_method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"number": "0x1", "hash": "0xabc"},
        })))
        .mount(&upstream)
        .await;

    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::default());
    let client = UpstreamClient::new(vec![upstream.uri()], 1).unwrap();
    let mut config = base_config(vec![upstream.uri()]);
    config.permanent_cache_height = 15_537_393;
    let pipeline = Pipeline::new(config, store.clone(), false, client);

    let response = pipeline
        .resolve(request("eth_getBlockByNumber", json!(["0x1", false]), 1))
        .await;
    assert_eq!(result_of(&response), &json!({"number": "0x1", "hash": "0xabc"}));

    let fp = "eth_getBlockByNumber:[\"0x1\",false]";
    assert_eq!(store.get(fp).await, Some(json!({"number": "0x1", "hash": "0xabc"})));
}

/// Scenario 4: 5 consecutive transport failures (threshold=5) trip the
/// breaker; a 6th call is rejected without reaching the upstream at all.
#[tokio::test]
async fn breaker_trips_after_threshold_failures_and_rejects_without_calling_upstream() {
    let upstream = MockServer::start().await;
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_for_responder = hits.clone();
    Mock::given(http_method("POST"))
        .respond_with(move |_req: &Request| {
            hits_for_responder.fetch_add(1, Ordering::SeqCst);
            ResponseTemplate::new(503)
        })
        .mount(&upstream)
        .await;

    let client = UpstreamClient::new(vec![upstream.uri()], 1).unwrap();
    let mut config = base_config(vec![upstream.uri()]);
    config.circuit_failure_threshold = 5;
    config.circuit_volume_threshold = 1000;
    let pipeline = Pipeline::new(config, Arc::new(MemoryStore::default()), false, client);

    for i in 0..5 {
        let response = pipeline.resolve(request("eth_gasPrice", json!([]), i)).await;
        match response {
            JsonRpcResponse::Error { error, .. } => assert_eq!(error.code, -32603),
            JsonRpcResponse::Success { .. } => panic!("expected an error response"),
        }
    }

    assert_eq!(hits.load(Ordering::SeqCst), 5);

    let sixth = pipeline.resolve(request("eth_gasPrice", json!([]), 6)).await;
    match sixth {
        JsonRpcResponse::Error { error, .. } => assert_eq!(error.code, -32603),
        JsonRpcResponse::Success { .. } => panic!("expected an error response"),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 5, "breaker-open call must not reach upstream");
    assert_eq!(pipeline.metrics().snapshot().circuit_breaker_rejections, 1);
}

/// Scenario 5: a broken first URL fails over to a working second URL; the
/// broken URL's failure count and the working URL's success count both
/// reflect the single logical call.
#[tokio::test]
async fn failover_across_two_upstream_urls() {
    let working = MockServer::start().await;
    Mock::given(http_method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": "0xabc",
        })))
        .mount(&working)
        .await;

    let broken_url = "http://127.0.0.1:0/".to_string();
    let urls = vec![broken_url, working.uri()];
    let client = UpstreamClient::new(urls.clone(), 1).unwrap();
    let pipeline = Pipeline::new(base_config(urls), Arc::new(MemoryStore::default()), false, client);

    let response = pipeline.resolve(request("eth_blockNumber", json!([]), 1)).await;
    assert_eq!(result_of(&response), &json!("0xabc"));

    let health = pipeline.health_snapshot().await;
    assert_eq!(health.rpc_providers[0].failure_count, 1);
    assert_eq!(health.rpc_providers[1].success_count, 1);
}

/// Scenario 6: a top-level batch array is resolved element-by-element,
/// concurrently, preserving order in the response array.
#[tokio::test]
async fn batch_request_preserves_order() {
    let upstream = MockServer::start().await;
    Mock::given(http_method("POST"))
        .respond_with(|req: &Request| {
            let body: Value = req.body_json().unwrap();
            let method = body["method"].as_str().unwrap();
            let result = match method {
                "eth_blockNumber" => json!("0x123456"),
                "eth_getBlockByNumber" => json!({"number": "0x1", "hash": "0xdead"}),
                other => panic!("unexpected method {other}"),
            };
            ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": body["id"],
                "result": result,
            }))
        })
        .mount(&upstream)
        .await;

    let client = UpstreamClient::new(vec![upstream.uri()], 1).unwrap();
    let pipeline = Pipeline::new(
        base_config(vec![upstream.uri()]),
        Arc::new(MemoryStore::default()),
        false,
        client,
    );

    let first = pipeline.resolve(request("eth_blockNumber", json!([]), 1));
    let second = pipeline.resolve(request("eth_getBlockByNumber", json!(["0x1", false]), 2));
    let (first, second) = tokio::join!(first, second);

    assert_eq!(result_of(&first), &json!("0x123456"));
    assert!(!cached_of(&first));
    assert_eq!(result_of(&second)["number"], json!("0x1"));
    assert!(!cached_of(&second));
}

/// Round-trip idempotence: flush followed by the same request behaves like
/// a cold start against the same upstream fixture.
#[tokio::test]
async fn flush_resets_cache_and_metrics_to_a_cold_start() {
    let upstream = MockServer::start().await;
    Mock::given(http_method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": "0x1",
        })))
        .mount(&upstream)
        .await;

    let client = UpstreamClient::new(vec![upstream.uri()], 1).unwrap();
    let pipeline = Pipeline::new(
        base_config(vec![upstream.uri()]),
        Arc::new(MemoryStore::default()),
        false,
        client,
    );

    let first = pipeline.resolve(request("eth_blockNumber", json!([]), 1)).await;
    assert!(!cached_of(&first));
    let second = pipeline.resolve(request("eth_blockNumber", json!([]), 2)).await;
    assert!(cached_of(&second));

    pipeline.flush().await.unwrap();
    assert_eq!(pipeline.metrics().snapshot().total_requests, 0);

    let third = pipeline.resolve(request("eth_blockNumber", json!([]), 3)).await;
    assert!(!cached_of(&third), "post-flush request behaves like a cold start");
}
