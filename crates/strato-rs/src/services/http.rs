//! The request dispatcher: the composition point of the framework.
//!
//! Every request the HTTP engine accepts lands in
//! [`RequestDispatcher::dispatch_request`], which is engine-independent
//! and fully testable without a socket:
//!
//! ```text
//! admit → parse guard → route match → [security stages → route
//! middleware] → cache shortcut / handler → finalize (compression,
//! access log, stats)
//! ```
//!
//! Method semantics implemented here: `HEAD` reuses the `GET` handler and
//! suppresses the body, bare `OPTIONS` answers the allowed-methods list,
//! `CONNECT` goes to the registered tunnel handler or 405.

use crate::middleware::pipeline::{default_error_handler, ErrorHandler, PipelineOutcome, RequestPipeline};
use crate::middleware::{access_log, compression, PipelineStage};
use crate::models::config::ServerConfig;
use crate::models::context::{Request, Response};
use crate::models::error::AppError;
use crate::models::route::{CacheMode, Method};
use crate::routes::not_found::render_not_found;
use crate::services::cache::{CacheOptions, CacheStore, CachedResponse};
use crate::services::lifecycle::LifecycleController;
use crate::utils::path::fingerprint;
use crate::utils::route_trie::{RouteMatch, RouteTrie};
use actix_web::web::Bytes;
use async_trait::async_trait;
use log::{debug, error};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Attribute carrying the matched route pattern, set before the pipeline
/// runs so stages (per-route rate limiting) can scope by route.
pub const ROUTE_PATTERN_ATTR: &str = "route_pattern";

/// Handler for `CONNECT` requests. The engine owns the connection, so raw
/// byte shoveling is delegated behind this seam; the dispatcher's part of
/// the contract is the 200-or-405 answer.
#[async_trait]
pub trait TunnelHandler: Send + Sync {
    async fn tunnel(&self, req: &Request) -> Result<Response, AppError>;
}

/// Aggregate request counters for one dispatcher.
#[derive(Debug, Default)]
pub struct ServerStats {
    total: AtomicU64,
    status_2xx: AtomicU64,
    status_3xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
    duration_ms_sum: AtomicU64,
}

impl ServerStats {
    pub fn record_response(&self, status: u16, duration_ms: u64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let bucket = match status {
            200..=299 => &self.status_2xx,
            300..=399 => &self.status_3xx,
            400..=499 => &self.status_4xx,
            _ => &self.status_5xx,
        };
        bucket.fetch_add(1, Ordering::Relaxed);
        self.duration_ms_sum.fetch_add(duration_ms, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.status_5xx.load(Ordering::Relaxed)
    }

    pub fn avg_response_time_ms(&self) -> f64 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            self.duration_ms_sum.load(Ordering::Relaxed) as f64 / total as f64
        }
    }

    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "total": self.total.load(Ordering::Relaxed),
            "2xx": self.status_2xx.load(Ordering::Relaxed),
            "3xx": self.status_3xx.load(Ordering::Relaxed),
            "4xx": self.status_4xx.load(Ordering::Relaxed),
            "5xx": self.status_5xx.load(Ordering::Relaxed),
            "avg_response_time_ms": self.avg_response_time_ms(),
        })
    }
}

/// Rebuilds a pipeline [`Response`] from a cache entry.
fn response_from_cached(cached: &CachedResponse) -> Response {
    let mut res = Response::new();
    let _ = res.set_status(cached.status);
    for (name, value) in &cached.headers {
        let _ = res.append_header(name, value.clone());
    }
    let _ = res.send_body(Bytes::from(cached.body.clone()));
    res
}

/// Snapshots a handler response for the cache.
fn cacheable_from_response(res: &Response) -> CachedResponse {
    CachedResponse {
        status: res.status(),
        headers: res.headers().to_vec(),
        body: res.body().map(|b| b.to_vec()).unwrap_or_default(),
    }
}

pub struct RequestDispatcher {
    config: Arc<ServerConfig>,
    trie: Arc<RouteTrie>,
    security: Vec<Arc<dyn PipelineStage>>,
    cache: Arc<CacheStore>,
    lifecycle: Arc<LifecycleController>,
    error_handler: ErrorHandler,
    tunnel: Option<Arc<dyn TunnelHandler>>,
    pub stats: Arc<ServerStats>,
}

impl RequestDispatcher {
    pub fn new(
        config: Arc<ServerConfig>,
        trie: Arc<RouteTrie>,
        security: Vec<Arc<dyn PipelineStage>>,
        cache: Arc<CacheStore>,
        lifecycle: Arc<LifecycleController>,
        error_handler: Option<ErrorHandler>,
        tunnel: Option<Arc<dyn TunnelHandler>>,
    ) -> Self {
        Self {
            config,
            trie,
            security,
            cache,
            lifecycle,
            error_handler: error_handler.unwrap_or_else(default_error_handler),
            tunnel,
            stats: Arc::new(ServerStats::default()),
        }
    }

    /// Shares an externally owned stats collector (the App exposes the
    /// same counters on `/health`).
    pub fn with_stats(mut self, stats: Arc<ServerStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleController> {
        &self.lifecycle
    }

    pub fn trie(&self) -> &Arc<RouteTrie> {
        &self.trie
    }

    fn error_response(&self, err: &AppError, req: &Request) -> Response {
        (self.error_handler)(err, req)
    }

    /// Full request processing. Always returns a finalized response.
    pub async fn dispatch_request(&self, mut req: Request) -> Response {
        // Admission control runs before any other work; the guard keeps
        // the slot for the whole request.
        let _guard = match self.lifecycle.admit(&req.remote_addr) {
            Ok(guard) => guard,
            Err(err) => {
                let res = self.error_response(&err, &req);
                return self.finalize(&req, res);
            }
        };

        // Body size is rejected before any middleware runs.
        let limit = self.config.server.json_limit_bytes();
        if req.body.len() > limit {
            let err = AppError::PayloadTooLarge { limit_bytes: limit };
            let res = self.error_response(&err, &req);
            return self.finalize(&req, res);
        }

        if req.method == Method::Connect {
            let res = match &self.tunnel {
                Some(handler) => match handler.tunnel(&req).await {
                    Ok(res) => res,
                    Err(err) => self.error_response(&err, &req),
                },
                None => self.error_response(
                    &AppError::MethodNotAllowed {
                        method: "CONNECT".to_string(),
                        path: req.path.clone(),
                    },
                    &req,
                ),
            };
            return self.finalize(&req, res);
        }

        let Some(matched) = self.trie.matches(req.method, &req.path) else {
            let res = self.handle_unrouted(&mut req).await;
            return self.finalize(&req, res);
        };
        req.params = matched.params.clone();
        req.set_attribute(
            ROUTE_PATTERN_ATTR,
            serde_json::Value::String(matched.route.pattern.clone()),
        );

        let budget = self
            .lifecycle
            .timeout_for(&matched.route.pattern, matched.route.timeout_ms);
        let res = match budget {
            Some(budget) => {
                match tokio::time::timeout(budget, self.run_route(&mut req, &matched)).await {
                    Ok(res) => res,
                    Err(_) => {
                        req.cancel.cancel();
                        let err = AppError::GatewayTimeout {
                            elapsed_ms: budget.as_millis() as u64,
                        };
                        self.error_response(&err, &req)
                    }
                }
            }
            None => self.run_route(&mut req, &matched).await,
        };

        self.finalize(&req, res)
    }

    /// No route matched: answer bare `OPTIONS` with the method list, let
    /// the security stack answer stray preflights, and 404 the rest.
    async fn handle_unrouted(&self, req: &mut Request) -> Response {
        if req.method == Method::Options {
            let is_preflight = req.header("access-control-request-method").is_some();
            if is_preflight {
                // The CORS stage owns preflight responses even for paths
                // without routes.
                let mut res = Response::new();
                let pipeline =
                    RequestPipeline::new(self.security.clone(), Some(self.error_handler.clone()));
                if pipeline.run(req, &mut res).await != PipelineOutcome::Completed {
                    return res;
                }
            } else {
                let allowed = self.trie.allowed_methods(&req.path);
                if !allowed.is_empty() {
                    let mut res = Response::new();
                    let list = allowed
                        .iter()
                        .map(|m| m.as_str())
                        .collect::<Vec<_>>()
                        .join(", ");
                    let _ = res.set_status(204);
                    let _ = res.insert_header("Allow", list);
                    let _ = res.send_body(Bytes::new());
                    return res;
                }
            }
        }
        debug!("no route for {} {}", req.method, req.path);
        render_not_found(&self.config.not_found, req.method, &req.path)
    }

    /// Security stages, route middleware, then the cache shortcut or the
    /// handler.
    async fn run_route(&self, req: &mut Request, matched: &RouteMatch) -> Response {
        let mut res = Response::new();

        let mut stages = self.security.clone();
        stages.extend(matched.route.middleware.iter().cloned());
        let pipeline = RequestPipeline::new(stages, Some(self.error_handler.clone()));
        if pipeline.run(req, &mut res).await != PipelineOutcome::Completed {
            return res;
        }

        let cache_eligible = self.cache_eligible(req, &matched.route.cache);
        if cache_eligible {
            let key = fingerprint(req, &self.config.cache.vary_headers);
            let opts = CacheOptions {
                ttl_secs: match matched.route.cache {
                    CacheMode::Enabled { ttl_secs } => ttl_secs,
                    _ => None,
                },
                ..Default::default()
            };
            let handler = matched.route.handler.clone();
            let handler_req = req.clone();
            let result = self
                .cache
                .get_or_compute(&key, opts, move || async move {
                    let handler_res = (handler)(handler_req).await?;
                    Ok(cacheable_from_response(&handler_res))
                })
                .await;
            match result {
                Ok((cached, hit)) => {
                    let _ = res.insert_header("X-Cache", if hit { "HIT" } else { "MISS" });
                    if hit {
                        let _ =
                            res.insert_header("X-Cache-Time", format!("{}ms", req.elapsed_ms()));
                    }
                    if let Err(err) = res.adopt(response_from_cached(&cached)) {
                        error!("cache adopt failed: {}", err);
                        pipeline.route_error(err, req, &mut res);
                    }
                }
                Err(err) => pipeline.route_error(err, req, &mut res),
            }
            return res;
        }

        let handler = matched.route.handler.clone();
        match (handler)(req.clone()).await {
            Ok(handler_res) => {
                if let Err(err) = res.adopt(handler_res) {
                    error!("handler response adopt failed: {}", err);
                    pipeline.route_error(err, req, &mut res);
                }
            }
            Err(err) => pipeline.route_error(err, req, &mut res),
        }
        res
    }

    fn cache_eligible(&self, req: &Request, mode: &CacheMode) -> bool {
        if self.config.cache.max_entries == 0 {
            return false;
        }
        match mode {
            CacheMode::Disabled => false,
            CacheMode::Enabled { .. } => true,
            CacheMode::Default => matches!(req.method, Method::Get | Method::Head),
        }
    }

    /// Applies the response-wide finishing steps: HEAD body suppression,
    /// negotiated compression, stats and the access log.
    fn finalize(&self, req: &Request, mut res: Response) -> Response {
        if !res.written() {
            // A handler that returned Ok without writing is a contract
            // slip; answer an explicit empty 204 rather than hang.
            let _ = res.set_status(204);
            let _ = res.send_body(Bytes::new());
        }
        if req.method == Method::Head {
            res.suppress_body();
        }
        if self.config.security.enabled && self.config.security.compression {
            compression::apply_compression(&mut res, self.config.security.compression_threshold);
        }
        let status = res.status();
        let bytes = res.body_len();
        self.stats.record_response(status, req.elapsed_ms());
        access_log::emit(req, status, bytes);
        res
    }
}

/// Converts an engine request into the pipeline representation.
pub fn request_from_actix(
    req: &actix_web::HttpRequest,
    body: Bytes,
    config: &ServerConfig,
) -> Result<Request, AppError> {
    let method =
        Method::parse(req.method().as_str()).ok_or_else(|| AppError::NotImplemented {
            method: req.method().as_str().to_string(),
        })?;

    let mut out = Request::new(method, req.path()).with_query(req.query_string());

    for (name, value) in req.headers() {
        if let Ok(value) = value.to_str() {
            out.headers
                .entry(name.as_str().to_ascii_lowercase())
                .or_default()
                .push(value.to_string());
        }
    }

    out.remote_addr = if config.server.trust_proxy {
        out.header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(|s| s.trim().to_string())
            .or_else(|| req.peer_addr().map(|a| a.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string())
    } else {
        req.peer_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    };

    out.body = body;
    if config.server.auto_parse_json {
        let is_json = out
            .header("content-type")
            .map(|ct| ct.contains("application/json"))
            .unwrap_or(false);
        if is_json && !out.body.is_empty() {
            out.json = serde_json::from_slice(&out.body).ok();
        }
    }
    Ok(out)
}

/// Converts a finalized pipeline response into the engine's type.
pub fn response_into_actix(res: Response) -> actix_web::HttpResponse {
    let status = actix_web::http::StatusCode::from_u16(res.status())
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = actix_web::HttpResponse::build(status);
    for (name, value) in res.headers() {
        builder.append_header((name.as_str(), value.as_str()));
    }
    for cookie in res.cookies() {
        builder.append_header(("Set-Cookie", cookie.as_str()));
    }
    match res.body() {
        Some(body) => builder.body(body.clone()),
        None => builder.finish(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::build_security_stack;
    use crate::models::route::{handler_fn, Route};

    fn dispatcher_with(config: ServerConfig, routes: Vec<Route>) -> RequestDispatcher {
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

    fn hello_route(method: Method, pattern: &str) -> Route {
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

    fn bare_config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.security.csrf = false;
        config.security.slow_down = false;
        config
    }

    #[tokio::test]
    async fn get_request_flows_to_handler() {
        let d = dispatcher_with(bare_config(), vec![hello_route(Method::Get, "/hello")]);
        let res = d
            .dispatch_request(Request::new(Method::Get, "/hello"))
            .await;
        assert_eq!(res.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(res.body().unwrap()).unwrap();
        assert_eq!(body["ok"], true);
        // Security headers from the stack are present.
        assert_eq!(res.header("x-content-type-options"), Some("nosniff"));
    }

    #[tokio::test]
    async fn head_reuses_get_with_empty_body() {
        let d = dispatcher_with(bare_config(), vec![hello_route(Method::Get, "/doc")]);
        let res = d.dispatch_request(Request::new(Method::Head, "/doc")).await;
        assert_eq!(res.status(), 200);
        assert_eq!(res.body_len(), 0);
        assert_eq!(res.header("content-type"), Some("application/json"));
    }

    #[tokio::test]
    async fn unknown_path_renders_404() {
        let d = dispatcher_with(bare_config(), vec![]);
        let res = d.dispatch_request(Request::new(Method::Get, "/ghost")).await;
        assert_eq!(res.status(), 404);
        assert_eq!(res.header("content-type"), Some("text/html; charset=utf-8"));
    }

    #[tokio::test]
    async fn bare_options_lists_methods() {
        let d = dispatcher_with(
            bare_config(),
            vec![
                hello_route(Method::Get, "/thing"),
                hello_route(Method::Post, "/thing"),
            ],
        );
        let res = d
            .dispatch_request(Request::new(Method::Options, "/thing"))
            .await;
        assert_eq!(res.status(), 204);
        let allow = res.header("allow").unwrap();
        assert!(allow.contains("GET"));
        assert!(allow.contains("POST"));
    }

    #[tokio::test]
    async fn connect_without_tunnel_is_405() {
        let d = dispatcher_with(bare_config(), vec![]);
        let res = d
            .dispatch_request(Request::new(Method::Connect, "example.com:443"))
            .await;
        assert_eq!(res.status(), 405);
    }

    #[tokio::test]
    async fn cache_miss_then_hit_headers() {
        let mut config = bare_config();
        config.cache.ttl_secs = 60;
        let d = dispatcher_with(config, vec![hello_route(Method::Get, "/q")]);

        let first = d.dispatch_request(Request::new(Method::Get, "/q")).await;
        assert_eq!(first.header("x-cache"), Some("MISS"));
        assert!(first.header("x-cache-time").is_none());

        let second = d.dispatch_request(Request::new(Method::Get, "/q")).await;
        assert_eq!(second.header("x-cache"), Some("HIT"));
        let cache_time = second.header("x-cache-time").unwrap();
        assert!(cache_time.ends_with("ms"));
        assert_eq!(first.body(), second.body());
    }

    #[tokio::test]
    async fn post_is_not_cached_by_default() {
        let d = dispatcher_with(bare_config(), vec![hello_route(Method::Post, "/w")]);
        let res = d.dispatch_request(Request::new(Method::Post, "/w")).await;
        assert_eq!(res.status(), 200);
        assert!(res.header("x-cache").is_none());
    }

    #[tokio::test]
    async fn oversized_body_is_413_before_middleware() {
        let mut config = bare_config();
        config.server.json_limit = "1kb".to_string();
        let d = dispatcher_with(config, vec![hello_route(Method::Post, "/w")]);
        let req = Request::new(Method::Post, "/w").with_body(vec![0u8; 2048]);
        let res = d.dispatch_request(req).await;
        assert_eq!(res.status(), 413);
    }

    #[tokio::test]
    async fn route_timeout_answers_504() {
        let mut config = bare_config();
        config.request_management.timeout.default_timeout_ms = 50;
        let slow = Route::new(
            Method::Get,
            "/slow",
            handler_fn(|_req| async move {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                let mut res = Response::new();
                res.send_text("late")?;
                Ok(res)
            }),
        );
        let d = dispatcher_with(config, vec![slow]);
        let res = d.dispatch_request(Request::new(Method::Get, "/slow")).await;
        assert_eq!(res.status(), 504);
    }

    #[tokio::test]
    async fn handler_error_becomes_json_500() {
        let failing = Route::new(
            Method::Get,
            "/boom",
            handler_fn(|_req| async move {
                Err(AppError::Internal {
                    message: "secret detail".to_string(),
                })
            }),
        );
        let d = dispatcher_with(bare_config(), vec![failing]);
        let res = d.dispatch_request(Request::new(Method::Get, "/boom")).await;
        assert_eq!(res.status(), 500);
        let body: serde_json::Value = serde_json::from_slice(res.body().unwrap()).unwrap();
        assert_eq!(body["message"], "Internal server error");
    }

    #[tokio::test]
    async fn wildcard_params_reach_handler() {
        let echo = Route::new(
            Method::Get,
            "/files/*rest",
            handler_fn(|req| async move {
                let mut res = Response::new();
                res.send_json(&json!({"rest": req.param("rest")}))?;
                Ok(res)
            }),
        );
        let d = dispatcher_with(bare_config(), vec![echo]);
        let res = d
            .dispatch_request(Request::new(Method::Get, "/files/a/b/c.txt"))
            .await;
        let body: serde_json::Value = serde_json::from_slice(res.body().unwrap()).unwrap();
        assert_eq!(body["rest"], "a/b/c.txt");
    }
}
