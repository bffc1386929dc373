//! Security stack behavior end to end through the dispatcher: CORS
//! preflights, rate limiting, CSRF, threat filtering and headers.

use serde_json::json;
use std::sync::Arc;
use strato_rs::middleware::build_security_stack;
use strato_rs::models::config::{CorsOrigin, CorsPolicy, CorsSetting, ServerConfig};
use strato_rs::models::context::{Request, Response};
use strato_rs::models::route::{handler_fn, Method, Route};
use strato_rs::services::cache::CacheStore;
use strato_rs::services::http::RequestDispatcher;
use strato_rs::services::lifecycle::LifecycleController;
use strato_rs::utils::route_trie::RouteTrie;

fn dispatcher(config: ServerConfig, routes: Vec<Route>) -> RequestDispatcher {
    let config = Arc::new(config);
    let trie = Arc::new(RouteTrie::new());
    for route in routes {
        trie.register(route).unwrap();
    }
    let security = build_security_stack(&config);
    let cache = Arc::new(CacheStore::from_config(&config.cache));
    let lifecycle = Arc::new(LifecycleController::new(&config.request_management));
    RequestDispatcher::new(config, trie, security, cache, lifecycle, None, None)
}

fn ok_route(method: Method, pattern: &str) -> Route {
    Route::new(
        method,
        pattern,
        handler_fn(|_req| async move {
            let mut res = Response::new();
            res.send_json(&json!({"ok": true}))?;
            Ok(res)
        }),
    )
}

fn api_cors_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.security.csrf = false;
    config.security.slow_down = false;
    config.security.cors = CorsSetting::Policy(CorsPolicy {
        origin: CorsOrigin::Any("*".to_string()),
        methods: ["GET", "POST", "PUT", "DELETE", "OPTIONS", "PATCH", "HEAD"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        allowed_headers: [
            "Content-Type",
            "Authorization",
            "x-guest-token",
            "xp-request-sig",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
        credentials: true,
        max_age: 86_400,
    });
    config
}

#[tokio::test]
async fn cors_preflight_serializes_methods_and_headers() {
    let d = dispatcher(
        api_cors_config(),
        vec![ok_route(Method::Get, "/api/v1/auth/login")],
    );
    let req = Request::new(Method::Options, "/api/v1/auth/login")
        .with_header("Origin", "http://x:5174")
        .with_header("Access-Control-Request-Method", "POST")
        .with_header(
            "Access-Control-Request-Headers",
            "xp-request-sig,content-type,authorization",
        );
    let res = d.dispatch_request(req).await;

    assert_eq!(res.status(), 204);
    assert_eq!(res.header("Access-Control-Allow-Origin"), Some("*"));
    assert_eq!(
        res.header("Access-Control-Allow-Methods"),
        Some("GET, POST, PUT, DELETE, OPTIONS, PATCH, HEAD")
    );
    assert_eq!(
        res.header("Access-Control-Allow-Headers"),
        Some("Content-Type, Authorization, x-guest-token, xp-request-sig")
    );
    assert_eq!(res.header("Access-Control-Allow-Credentials"), Some("true"));
    for (name, value) in res.headers() {
        assert!(
            !value.contains("[object Object]") && !value.starts_with('['),
            "header {} leaked a container rendering: {}",
            name,
            value
        );
    }
}

#[tokio::test]
async fn simple_cross_origin_request_gets_origin_header() {
    let d = dispatcher(api_cors_config(), vec![ok_route(Method::Get, "/data")]);
    let req = Request::new(Method::Get, "/data").with_header("Origin", "http://x:5174");
    let res = d.dispatch_request(req).await;
    assert_eq!(res.status(), 200);
    assert_eq!(res.header("Access-Control-Allow-Origin"), Some("*"));
    assert_eq!(res.header("Access-Control-Allow-Credentials"), Some("true"));
}

#[tokio::test]
async fn rate_limit_answers_429_with_retry_after() {
    let mut config = ServerConfig::default();
    config.security.csrf = false;
    config.security.slow_down = false;
    config.security.rate_limit.max = Some(2);
    config.security.rate_limit.window_ms = 60_000;
    let d = dispatcher(config, vec![ok_route(Method::Get, "/r")]);

    for i in 0..2 {
        let req = Request::new(Method::Get, "/r").with_remote_addr("203.0.113.9");
        let res = d.dispatch_request(req).await;
        assert_eq!(res.status(), 200, "request {} should pass", i);
        assert_eq!(res.header("X-RateLimit-Limit"), Some("2"));
    }

    let req = Request::new(Method::Get, "/r").with_remote_addr("203.0.113.9");
    let res = d.dispatch_request(req).await;
    assert_eq!(res.status(), 429);
    let retry: u64 = res.header("Retry-After").unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry));

    // A different address is unaffected.
    let req = Request::new(Method::Get, "/r").with_remote_addr("203.0.113.10");
    assert_eq!(d.dispatch_request(req).await.status(), 200);
}

#[tokio::test]
async fn health_is_exempt_from_rate_limiting() {
    let mut config = ServerConfig::default();
    config.security.csrf = false;
    config.security.slow_down = false;
    config.security.rate_limit.max = Some(1);
    let d = dispatcher(config, vec![ok_route(Method::Get, "/health")]);
    for _ in 0..5 {
        let req = Request::new(Method::Get, "/health").with_remote_addr("198.51.100.1");
        assert_eq!(d.dispatch_request(req).await.status(), 200);
    }
}

#[tokio::test]
async fn csrf_blocks_unsafe_methods_without_tokens() {
    let mut config = ServerConfig::default();
    config.security.slow_down = false;
    let d = dispatcher(config, vec![ok_route(Method::Post, "/form")]);
    let res = d.dispatch_request(Request::new(Method::Post, "/form")).await;
    assert_eq!(res.status(), 403);
    let body: serde_json::Value = serde_json::from_slice(res.body().unwrap()).unwrap();
    assert_eq!(body["code"], "csrf_rejected");
}

#[tokio::test]
async fn csrf_double_submit_passes() {
    let mut config = ServerConfig::default();
    config.security.slow_down = false;
    let d = dispatcher(config, vec![ok_route(Method::Post, "/form")]);
    let token = strato_rs::middleware::csrf::generate_token();
    let req = Request::new(Method::Post, "/form")
        .with_header("cookie", &format!("__Host-csrf-token={}", token))
        .with_header("x-csrf-token", &token);
    assert_eq!(d.dispatch_request(req).await.status(), 200);
}

#[tokio::test]
async fn script_payload_is_blocked_with_400() {
    let mut config = ServerConfig::default();
    config.security.csrf = false;
    config.security.slow_down = false;
    let d = dispatcher(config, vec![ok_route(Method::Post, "/comment")]);
    let req = Request::new(Method::Post, "/comment")
        .with_header("content-type", "application/json")
        .with_body(serde_json::to_vec(&json!({"text": "<script>steal()</script>"})).unwrap());
    let res = d.dispatch_request(req).await;
    assert_eq!(res.status(), 400);
    let body: serde_json::Value = serde_json::from_slice(res.body().unwrap()).unwrap();
    assert_eq!(body["code"], "threat_detected");
    assert!(body["message"].as_str().unwrap().contains("body.text"));
}

#[tokio::test]
async fn security_headers_present_on_every_response() {
    let mut config = ServerConfig::default();
    config.security.csrf = false;
    config.security.slow_down = false;
    let d = dispatcher(config, vec![ok_route(Method::Get, "/x")]);
    for path in ["/x", "/missing"] {
        let res = d.dispatch_request(Request::new(Method::Get, path)).await;
        if path == "/x" {
            assert_eq!(res.header("X-Content-Type-Options"), Some("nosniff"));
            assert_eq!(res.header("X-Frame-Options"), Some("DENY"));
        }
    }
}

#[tokio::test]
async fn disabled_security_stack_serves_bare_responses() {
    let mut config = ServerConfig::default();
    config.security.enabled = false;
    let d = dispatcher(config, vec![ok_route(Method::Get, "/bare")]);
    let res = d.dispatch_request(Request::new(Method::Get, "/bare")).await;
    assert_eq!(res.status(), 200);
    assert!(res.header("X-Content-Type-Options").is_none());
    assert!(res.header("X-RateLimit-Limit").is_none());
}
