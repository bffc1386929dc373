//! Cache store properties and the dispatcher-level cache shortcut.

use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strato_rs::middleware::build_security_stack;
use strato_rs::models::config::ServerConfig;
use strato_rs::models::context::{Request, Response};
use strato_rs::models::route::{handler_fn, CacheMode, Method, Route};
use strato_rs::services::cache::{CacheOptions, CacheStore, CachedResponse};
use strato_rs::services::http::RequestDispatcher;
use strato_rs::services::lifecycle::LifecycleController;
use strato_rs::utils::route_trie::RouteTrie;

fn response(body: &[u8]) -> CachedResponse {
    CachedResponse {
        status: 200,
        headers: vec![("Content-Type".to_string(), "application/json".to_string())],
        body: body.to_vec(),
    }
}

#[test]
fn ttl_expiry_and_memory_accounting() {
    let cache = CacheStore::new(10, 4096, 300, usize::MAX);
    cache
        .set(
            "short",
            response(b"value"),
            CacheOptions {
                ttl_secs: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
    let before = cache.stats();
    assert_eq!(before.entries, 1);
    assert!(before.bytes > 0);

    std::thread::sleep(std::time::Duration::from_millis(1100));
    assert!(cache.get("short").is_none());
    let after = cache.stats();
    assert_eq!(after.entries, 0);
    assert_eq!(after.bytes, 0);
}

#[test]
fn bounded_by_entry_count_under_churn() {
    let cache = CacheStore::new(20, 1024 * 1024, 300, usize::MAX);
    for i in 0..200 {
        let _ = cache.set(&format!("k{}", i), response(b"x"), CacheOptions::default());
    }
    assert!(cache.stats().entries <= 20);
}

#[test]
fn bounded_by_memory_under_churn() {
    let cache = CacheStore::new(1000, 2048, 300, usize::MAX);
    for i in 0..100 {
        let _ = cache.set(
            &format!("k{}", i),
            response(&[b'v'; 128]),
            CacheOptions::default(),
        );
    }
    assert!(cache.stats().bytes <= 2048);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_flight_collapses_concurrent_misses() {
    let cache = Arc::new(CacheStore::new(100, 1024 * 1024, 300, usize::MAX));
    let computed = Arc::new(AtomicU64::new(0));
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let cache = cache.clone();
        let computed = computed.clone();
        tasks.push(tokio::spawn(async move {
            cache
                .get_or_compute("hot-key", CacheOptions::default(), || async move {
                    computed.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(25)).await;
                    Ok(response(b"expensive"))
                })
                .await
                .unwrap()
        }));
    }
    for task in tasks {
        let (value, _) = task.await.unwrap();
        assert_eq!(value.body, b"expensive");
    }
    assert_eq!(computed.load(Ordering::SeqCst), 1);
}

fn caching_dispatcher(counter: Arc<AtomicU64>) -> RequestDispatcher {
    let mut config = ServerConfig::default();
    config.security.csrf = false;
    config.security.slow_down = false;
    config.cache.ttl_secs = 60;
    let config = Arc::new(config);

    let trie = Arc::new(RouteTrie::new());
    trie.register(Route::new(
        Method::Get,
        "/q",
        handler_fn(move |_req| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut res = Response::new();
                res.send_json(&json!({"ok": true}))?;
                Ok(res)
            }
        }),
    ))
    .unwrap();

    let security = build_security_stack(&config);
    let cache = Arc::new(CacheStore::from_config(&config.cache));
    let lifecycle = Arc::new(LifecycleController::new(&config.request_management));
    RequestDispatcher::new(config, trie, security, cache, lifecycle, None, None)
}

#[tokio::test]
async fn miss_then_hit_with_identical_bodies() {
    let calls = Arc::new(AtomicU64::new(0));
    let d = caching_dispatcher(calls.clone());

    let first = d.dispatch_request(Request::new(Method::Get, "/q")).await;
    assert_eq!(first.status(), 200);
    assert_eq!(first.header("X-Cache"), Some("MISS"));

    let second = d.dispatch_request(Request::new(Method::Get, "/q")).await;
    assert_eq!(second.status(), 200);
    assert_eq!(second.header("X-Cache"), Some("HIT"));
    let time = second.header("X-Cache-Time").unwrap();
    assert!(time.ends_with("ms"));
    assert_eq!(first.body(), second.body());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn query_changes_the_fingerprint() {
    let calls = Arc::new(AtomicU64::new(0));
    let d = caching_dispatcher(calls.clone());
    d.dispatch_request(Request::new(Method::Get, "/q").with_query("page=1"))
        .await;
    d.dispatch_request(Request::new(Method::Get, "/q").with_query("page=2"))
        .await;
    // Same pairs, different order: one fingerprint.
    d.dispatch_request(Request::new(Method::Get, "/q").with_query("a=1&b=2"))
        .await;
    d.dispatch_request(Request::new(Method::Get, "/q").with_query("b=2&a=1"))
        .await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn head_shares_the_get_entry_with_suppressed_body() {
    let calls = Arc::new(AtomicU64::new(0));
    let d = caching_dispatcher(calls.clone());

    let get = d.dispatch_request(Request::new(Method::Get, "/q")).await;
    assert!(get.body_len() > 0);

    let head = d.dispatch_request(Request::new(Method::Head, "/q")).await;
    assert_eq!(head.status(), 200);
    assert_eq!(head.header("X-Cache"), Some("HIT"));
    assert_eq!(head.body_len(), 0);
    assert_eq!(head.header("content-type"), get.header("content-type"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn opted_out_route_is_never_cached() {
    let mut config = ServerConfig::default();
    config.security.csrf = false;
    config.security.slow_down = false;
    let config = Arc::new(config);
    let trie = Arc::new(RouteTrie::new());
    trie.register(
        Route::new(
            Method::Get,
            "/nocache",
            handler_fn(|_req| async move {
                let mut res = Response::new();
                res.send_text("fresh")?;
                Ok(res)
            }),
        )
        .with_cache(CacheMode::Disabled),
    )
    .unwrap();
    let security = build_security_stack(&config);
    let cache = Arc::new(CacheStore::from_config(&config.cache));
    let lifecycle = Arc::new(LifecycleController::new(&config.request_management));
    let d = RequestDispatcher::new(config, trie, security, cache, lifecycle, None, None);

    for _ in 0..2 {
        let res = d
            .dispatch_request(Request::new(Method::Get, "/nocache"))
            .await;
        assert!(res.header("X-Cache").is_none());
    }
}

#[test]
fn prediction_and_warm_pipeline() {
    let cache = CacheStore::new(100, 1024 * 1024, 300, usize::MAX);
    for key in ["a", "b", "c"] {
        cache.set(key, response(b"x"), CacheOptions::default()).unwrap();
    }
    for _ in 0..6 {
        cache.get("a");
    }
    for _ in 0..3 {
        cache.get("b");
    }
    let top = cache.predict_next_access(2);
    assert_eq!(top[0], "a");
    assert_eq!(top[1], "b");
}
