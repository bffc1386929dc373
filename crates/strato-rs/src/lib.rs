//! # strato-rs
//!
//! A high-throughput HTTP application server framework. One [`app::App`]
//! composes the subsystems; actix-web provides the HTTP engine under a
//! single catch-all service, and everything above the socket — routing,
//! middleware, caching, lifecycle, clustering — lives here.
//!
//! ## Subsystems
//!
//! - [`utils::route_trie`] — segment-trie routing with `:param` and
//!   `*wildcard` captures, O(path segments) matching.
//! - [`middleware`] — the ordered security stage stack (compression,
//!   headers, CORS, rate limiting, HPP, sanitization, access log,
//!   slow-down, threat filtering, CSRF) and the pipeline executor with
//!   its per-stage watchdog.
//! - [`services::cache`] — bounded response cache with TTL, scored
//!   eviction, predictive warming and single-flight computation.
//! - [`services::lifecycle`] — per-route timeouts, admission control and
//!   graceful drain.
//! - [`services::port`] — automatic port acquisition with increment or
//!   random fallback.
//! - [`cluster`] — the multi-process supervisor, stdio IPC bus, worker
//!   runtime and metric-driven autoscaler; startup failures degrade to
//!   single-process serving rather than aborting.
//! - [`services::multi_server`] — several independent servers in one
//!   process with route partitioning.
//!
//! ## Quick start
//!
//! ```no_run
//! use strato_rs::app::App;
//! use strato_rs::models::config::ServerConfig;
//! use strato_rs::models::context::Response;
//! use strato_rs::models::route::handler_fn;
//! use strato_rs::server::run_app;
//!
//! #[actix_web::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     strato_rs::logs::logger::configure_logger();
//!     let app = App::new(ServerConfig::default());
//!     app.get("/hello", handler_fn(|_req| async move {
//!         let mut res = Response::new();
//!         res.send_text("hello")?;
//!         Ok(res)
//!     }))?;
//!     run_app(app).await?;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod cluster;
pub mod config;
pub mod logs;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;
pub mod services;
pub mod utils;
