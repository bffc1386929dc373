//! The application object.
//!
//! An [`App`] composes the framework's components — routing trie, security
//! stack, cache, lifecycle controls — behind a registration surface:
//! routes are added with `get`/`post`/… (or [`App::route`] for full
//! control), an error handler and a tunnel handler can be attached, and
//! [`App::build_dispatcher`] produces the dispatcher a server binds to.
//! There is no runtime mutation of the app shape: registration happens at
//! assembly time, then the dispatcher serves.
//!
//! # Examples
//!
//! ```rust
//! use strato_rs::app::App;
//! use strato_rs::models::config::ServerConfig;
//! use strato_rs::models::context::Response;
//! use strato_rs::models::route::handler_fn;
//!
//! let app = App::new(ServerConfig::default());
//! app.get("/hello/:name", handler_fn(|req| async move {
//!     let mut res = Response::new();
//!     res.send_text(format!("hello {}", req.param("name").unwrap_or("world")))?;
//!     Ok(res)
//! })).unwrap();
//! let dispatcher = app.build_dispatcher();
//! ```

use crate::middleware::build_security_stack;
use crate::middleware::csrf::issue_token_response;
use crate::middleware::pipeline::ErrorHandler;
use crate::models::config::ServerConfig;
use crate::models::route::{handler_fn, Handler, Method, Route};
use crate::routes::health::{health_payload, liveness_payload, readiness_payload};
use crate::services::cache::CacheStore;
use crate::services::http::{RequestDispatcher, ServerStats, TunnelHandler};
use crate::services::lifecycle::LifecycleController;
use crate::utils::route_trie::{RouteTrie, RouteTrieError};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Role label reported on `/health`: `single`, `master` or `worker:<id>`.
#[derive(Debug, Clone)]
pub struct ProcessRole(Arc<RwLock<String>>);

impl ProcessRole {
    fn new(initial: &str) -> Self {
        Self(Arc::new(RwLock::new(initial.to_string())))
    }

    pub fn set(&self, role: &str) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = role.to_string();
    }

    pub fn get(&self) -> String {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

pub struct App {
    config: Arc<ServerConfig>,
    trie: Arc<RouteTrie>,
    /// Registration log, kept for multi-server route distribution.
    routes: RwLock<Vec<Route>>,
    cache: Arc<CacheStore>,
    lifecycle: Arc<LifecycleController>,
    stats: Arc<ServerStats>,
    error_handler: RwLock<Option<ErrorHandler>>,
    tunnel: RwLock<Option<Arc<dyn TunnelHandler>>>,
    role: ProcessRole,
    started_at: Instant,
}

impl App {
    pub fn new(config: ServerConfig) -> Self {
        let initial_role = if crate::config::is_worker_process() {
            let id = std::env::var(crate::config::WORKER_ID_VAR)
                .unwrap_or_else(|_| "?".to_string());
            format!("worker:{}", id)
        } else {
            "single".to_string()
        };

        let config = Arc::new(config);
        let app = Self {
            cache: Arc::new(CacheStore::from_config(&config.cache)),
            lifecycle: Arc::new(LifecycleController::new(&config.request_management)),
            config,
            trie: Arc::new(RouteTrie::new()),
            routes: RwLock::new(Vec::new()),
            stats: Arc::new(ServerStats::default()),
            error_handler: RwLock::new(None),
            tunnel: RwLock::new(None),
            role: ProcessRole::new(&initial_role),
            started_at: Instant::now(),
        };
        app.register_builtin_routes();
        app
    }

    /// Health probes and the CSRF token exchange ship with every app.
    fn register_builtin_routes(&self) {
        let stats = self.stats.clone();
        let role = self.role.clone();
        let started_at = self.started_at;
        let _ = self.route(Route::new(
            Method::Get,
            "/health",
            handler_fn(move |_req| {
                let stats = stats.clone();
                let role = role.clone();
                async move {
                    let mut res = crate::models::context::Response::new();
                    res.send_json(&health_payload(&role.get(), started_at, &stats))?;
                    Ok(res)
                }
            }),
        ));
        let _ = self.route(Route::new(
            Method::Get,
            "/ready",
            handler_fn(|_req| async move {
                let mut res = crate::models::context::Response::new();
                res.send_json(&readiness_payload())?;
                Ok(res)
            }),
        ));
        let _ = self.route(Route::new(
            Method::Get,
            "/live",
            handler_fn(|_req| async move {
                let mut res = crate::models::context::Response::new();
                res.send_json(&liveness_payload())?;
                Ok(res)
            }),
        ));
        let env = self.config.env;
        let _ = self.route(Route::new(
            Method::Get,
            "/csrf-token",
            handler_fn(move |_req| async move { issue_token_response(env) }),
        ));
    }

    /// Registers a fully configured route.
    pub fn route(&self, route: Route) -> Result<(), RouteTrieError> {
        self.trie.register(route.clone())?;
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(route);
        Ok(())
    }

    pub fn get(&self, pattern: &str, handler: Handler) -> Result<(), RouteTrieError> {
        self.route(Route::new(Method::Get, pattern, handler))
    }

    pub fn post(&self, pattern: &str, handler: Handler) -> Result<(), RouteTrieError> {
        self.route(Route::new(Method::Post, pattern, handler))
    }

    pub fn put(&self, pattern: &str, handler: Handler) -> Result<(), RouteTrieError> {
        self.route(Route::new(Method::Put, pattern, handler))
    }

    pub fn delete(&self, pattern: &str, handler: Handler) -> Result<(), RouteTrieError> {
        self.route(Route::new(Method::Delete, pattern, handler))
    }

    pub fn patch(&self, pattern: &str, handler: Handler) -> Result<(), RouteTrieError> {
        self.route(Route::new(Method::Patch, pattern, handler))
    }

    pub fn options(&self, pattern: &str, handler: Handler) -> Result<(), RouteTrieError> {
        self.route(Route::new(Method::Options, pattern, handler))
    }

    /// Registers a handler for every method.
    pub fn all(&self, pattern: &str, handler: Handler) -> Result<(), RouteTrieError> {
        self.route(Route::new(Method::All, pattern, handler))
    }

    /// Replaces the default JSON error responder.
    pub fn on_error(&self, handler: ErrorHandler) {
        *self
            .error_handler
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Registers the `CONNECT` tunnel handler.
    pub fn on_tunnel(&self, handler: Arc<dyn TunnelHandler>) {
        *self.tunnel.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
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

    pub fn role(&self) -> &ProcessRole {
        &self.role
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    /// Snapshot of every registered route.
    pub fn routes_snapshot(&self) -> Vec<Route> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Assembles the request dispatcher for this app.
    pub fn build_dispatcher(&self) -> Arc<RequestDispatcher> {
        let security = build_security_stack(&self.config);
        let error_handler = self
            .error_handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let tunnel = self.tunnel.read().unwrap_or_else(|e| e.into_inner()).clone();
        Arc::new(
            RequestDispatcher::new(
                self.config.clone(),
                self.trie.clone(),
                security,
                self.cache.clone(),
                self.lifecycle.clone(),
                error_handler,
                tunnel,
            )
            .with_stats(self.stats.clone()),
        )
    }

    /// Builds a dispatcher over a filtered subset of routes; the
    /// multi-server controller uses this for per-instance partitions.
    pub fn build_partition_dispatcher(&self, routes: &[Route]) -> Arc<RequestDispatcher> {
        let trie = Arc::new(RouteTrie::new());
        for route in routes {
            // Patterns were validated at registration time.
            let _ = trie.register(route.clone());
        }
        let security = build_security_stack(&self.config);
        let error_handler = self
            .error_handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        Arc::new(
            RequestDispatcher::new(
                self.config.clone(),
                trie,
                security,
                self.cache.clone(),
                Arc::new(LifecycleController::new(&self.config.request_management)),
                error_handler,
                None,
            )
            .with_stats(self.stats.clone()),
        )
    }
}
