//! The middleware pipeline and the security stage stack.
//!
//! Every request runs an ordered chain: the security stages, then any
//! route-scoped middleware, then the handler. A stage receives mutable
//! access to the request and response and reports how the chain should
//! proceed. The stage order below is fixed because correctness depends on
//! it — rate limiting must see the real client before sanitization rewrites
//! anything, CSRF must run after body parsing, and so on:
//!
//! 1. compression negotiation
//! 2. security headers
//! 3. CORS
//! 4. rate limiting
//! 5. HTTP parameter pollution guard
//! 6. NoSQL operator sanitization
//! 7. access logging
//! 8. slow-down
//! 9. XSS / injection filtering
//! 10. CSRF
//!
//! Configuration switches remove stages from the chain; it never reorders.

pub mod access_log;
pub mod compression;
pub mod cors;
pub mod csrf;
pub mod headers;
pub mod hpp;
pub mod pipeline;
pub mod rate_limit;
pub mod sanitize;
pub mod slow_down;

use crate::models::config::ServerConfig;
use crate::models::context::{Request, Response};
use crate::models::error::AppError;
use async_trait::async_trait;
use std::sync::Arc;

/// How the chain proceeds after a stage returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageFlow {
    /// Advance the cursor to the next stage.
    Next,
    /// The stage wrote a complete response; skip the rest of the chain.
    Done,
}

/// A single unit in the request pipeline.
///
/// Stages either mutate the request, add response headers, short-circuit
/// by writing a response (`Done`), or pass (`Next`). Errors route to the
/// registered error handler, skipping the remaining stages.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// Stable identifier, used in logs and watchdog reports.
    fn id(&self) -> &'static str;

    /// Stages that intentionally wait (slow-down's throttling delay)
    /// declare it here; the executor then awaits them without the
    /// watchdog, which exists to catch stages that hang by accident.
    fn watchdog_exempt(&self) -> bool {
        false
    }

    async fn handle(&self, req: &mut Request, res: &mut Response) -> Result<StageFlow, AppError>;
}

/// Builds the ordered security stage chain for a configuration snapshot.
///
/// Returns an empty chain when the stack is disabled; individual switches
/// drop individual stages.
pub fn build_security_stack(config: &ServerConfig) -> Vec<Arc<dyn PipelineStage>> {
    let sec = &config.security;
    let mut stages: Vec<Arc<dyn PipelineStage>> = Vec::new();
    if !sec.enabled {
        return stages;
    }

    if sec.compression {
        stages.push(Arc::new(compression::CompressionStage::new(
            sec.compression_threshold,
        )));
    }
    if sec.helmet {
        stages.push(Arc::new(headers::SecurityHeadersStage::new(
            sec.csp.clone(),
            config.env,
        )));
    }
    if let Some(policy) = sec.cors.policy() {
        stages.push(Arc::new(cors::CorsStage::new(policy)));
    }
    stages.push(Arc::new(rate_limit::RateLimitStage::new(
        rate_limit::RateLimiter::from_config(sec),
    )));
    if sec.hpp {
        stages.push(Arc::new(hpp::ParameterPollutionStage::new(
            sec.hpp_whitelist.clone(),
        )));
    }
    if sec.mongo_sanitize {
        stages.push(Arc::new(sanitize::NoSqlSanitizeStage::default()));
    }
    if sec.morgan {
        stages.push(Arc::new(access_log::AccessLogStage));
    }
    if sec.slow_down {
        stages.push(Arc::new(slow_down::SlowDownStage::new(
            sec.slow_down_config.clone(),
            sec.brute_force,
        )));
    }
    if sec.xss || sec.sql_injection {
        stages.push(Arc::new(sanitize::ThreatFilterStage::new(
            sec.xss,
            sec.sql_injection,
            sec.sanitize_instead_of_block,
        )));
    }
    if sec.csrf {
        stages.push(Arc::new(csrf::CsrfStage::new(config.env)));
    }

    stages
}
