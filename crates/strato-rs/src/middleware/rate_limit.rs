//! Sliding-window rate limiting across global, per-IP, per-user and
//! per-route scopes.
//!
//! Each scope key owns a bucket holding the request timestamps inside the
//! current window. A request increments every active scope; the first
//! bucket to exceed its limit rejects the request with 429 and a
//! `Retry-After` hint computed from the oldest timestamp still in the
//! window. Buckets live in process-local memory: when clustering is
//! enabled, per-IP counts drift across workers by design (an external
//! store would be needed for exact cross-process limits).

use crate::middleware::{PipelineStage, StageFlow};
use crate::models::config::SecuritySection;
use crate::models::context::{Request, Response};
use crate::models::error::AppError;
use crate::utils::path::normalize;
use ahash::HashMap as AHashMap;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// One scope's request history inside the sliding window.
#[derive(Debug, Default)]
struct RateBucket {
    timestamps: Vec<Instant>,
}

impl RateBucket {
    /// Drops timestamps older than the window, then admits or rejects.
    /// Returns `(allowed, count_in_window, oldest)` post-increment.
    fn admit(&mut self, now: Instant, window: Duration, limit: u64) -> (bool, u64, Option<Instant>) {
        self.timestamps
            .retain(|&t| now.duration_since(t) < window);
        self.timestamps.push(now);
        let count = self.timestamps.len() as u64;
        (count <= limit, count, self.timestamps.first().copied())
    }
}

/// Outcome of a rate-limit evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum RateDecision {
    Allowed {
        /// Headroom of the tightest evaluated scope.
        limit: u64,
        remaining: u64,
        /// Seconds until that scope's window resets.
        reset_secs: u64,
    },
    Limited {
        scope: String,
        retry_after_secs: u64,
    },
}

/// Settings for one limiter instance.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub window_ms: u64,
    /// Per-scope ceiling (IP and user scopes).
    pub max: u64,
    /// Optional whole-process ceiling; off by default.
    pub global_max: Option<u64>,
    /// Optional per-route ceiling across all clients; off by default.
    pub route_max: Option<u64>,
    pub exempt_paths: Vec<String>,
    pub emit_headers: bool,
}

/// Process-local sliding-window limiter.
pub struct RateLimiter {
    config: RateLimiterConfig,
    buckets: RwLock<AHashMap<String, RateBucket>>,
    last_cleanup: RwLock<Instant>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            buckets: RwLock::new(AHashMap::default()),
            last_cleanup: RwLock::new(Instant::now()),
        }
    }

    /// Builds the limiter from the security section, letting the security
    /// level pick the ceiling when none is configured.
    pub fn from_config(sec: &SecuritySection) -> Self {
        Self::new(RateLimiterConfig {
            window_ms: sec.rate_limit.window_ms,
            max: sec.rate_limit_max(),
            global_max: sec.rate_limit.global_max,
            route_max: sec.rate_limit.route_max,
            exempt_paths: sec.rate_limit.exempt_paths.clone(),
            emit_headers: sec.rate_limit.headers,
        })
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        let normalized = normalize(path);
        self.config
            .exempt_paths
            .iter()
            .any(|p| normalize(p) == normalized)
    }

    fn window(&self) -> Duration {
        Duration::from_millis(self.config.window_ms)
    }

    /// Seconds until the window containing `oldest` rolls over.
    fn retry_after(&self, now: Instant, oldest: Option<Instant>) -> u64 {
        match oldest {
            Some(start) => {
                let elapsed_ms = now.duration_since(start).as_millis() as u64;
                let remaining_ms = self.config.window_ms.saturating_sub(elapsed_ms);
                remaining_ms.div_ceil(1000).max(1)
            }
            None => 1,
        }
    }

    /// Evaluates every scope for a request. Scope keys follow the
    /// `global`, `ip:<addr>`, `user:<id>`, `route:<pattern>` convention.
    pub fn check(&self, scopes: &[(String, u64)]) -> RateDecision {
        self.maybe_cleanup();
        let now = Instant::now();
        let window = self.window();

        let mut tightest: Option<(u64, u64, u64)> = None;
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        for (scope, limit) in scopes {
            let bucket = buckets.entry(scope.clone()).or_default();
            let (allowed, count, oldest) = bucket.admit(now, window, *limit);
            if !allowed {
                let retry = self.retry_after(now, oldest);
                warn!("rate limit exceeded for scope {}", scope);
                return RateDecision::Limited {
                    scope: scope.clone(),
                    retry_after_secs: retry,
                };
            }
            let remaining = limit.saturating_sub(count);
            let reset = self.retry_after(now, oldest);
            let is_tighter = tightest.map(|(_, r, _)| remaining < r).unwrap_or(true);
            if is_tighter {
                tightest = Some((*limit, remaining, reset));
            }
        }

        let (limit, remaining, reset_secs) =
            tightest.unwrap_or((self.config.max, self.config.max, 0));
        RateDecision::Allowed {
            limit,
            remaining,
            reset_secs,
        }
    }

    /// Assembles the scope set for a request: optional global ceiling,
    /// the client IP, the user when one is identified, and the matched
    /// route when a per-route ceiling is configured.
    pub fn scopes_for(
        &self,
        ip: &str,
        user: Option<&str>,
        route_pattern: Option<&str>,
    ) -> Vec<(String, u64)> {
        let mut scopes = Vec::with_capacity(4);
        if let Some(global) = self.config.global_max {
            scopes.push(("global".to_string(), global));
        }
        scopes.push((format!("ip:{}", ip), self.config.max));
        if let Some(user) = user {
            scopes.push((format!("user:{}", user), self.config.max));
        }
        if let (Some(route_max), Some(pattern)) = (self.config.route_max, route_pattern) {
            scopes.push((format!("route:{}", pattern), route_max));
        }
        scopes
    }

    pub fn emit_headers(&self) -> bool {
        self.config.emit_headers
    }

    /// Drops buckets idle for more than two windows. Runs at most once
    /// every five minutes to keep the hot path cheap.
    fn maybe_cleanup(&self) {
        let now = Instant::now();
        {
            let last = self.last_cleanup.read().unwrap_or_else(|e| e.into_inner());
            if now.duration_since(*last) < Duration::from_secs(300) {
                return;
            }
        }
        let mut last = self.last_cleanup.write().unwrap_or_else(|e| e.into_inner());
        if now.duration_since(*last) < Duration::from_secs(300) {
            return;
        }
        *last = now;
        let threshold = self.window() * 2;
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        let before = buckets.len();
        buckets.retain(|_, b| {
            b.timestamps
                .last()
                .map(|t| now.duration_since(*t) < threshold)
                .unwrap_or(false)
        });
        info!(
            "rate limiter cleanup: {} of {} buckets retained",
            buckets.len(),
            before
        );
    }
}

/// Pipeline stage delegating to a shared [`RateLimiter`].
pub struct RateLimitStage {
    limiter: RateLimiter,
}

impl RateLimitStage {
    pub fn new(limiter: RateLimiter) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl PipelineStage for RateLimitStage {
    fn id(&self) -> &'static str {
        "rate-limit"
    }

    async fn handle(&self, req: &mut Request, res: &mut Response) -> Result<StageFlow, AppError> {
        if self.limiter.is_exempt(&req.path) {
            debug!("rate limit: {} is exempt", req.path);
            return Ok(StageFlow::Next);
        }

        let user = req
            .header("x-user-id")
            .map(|s| s.to_string())
            .or_else(|| {
                req.attribute("user_id")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
            });
        let route_pattern = req
            .attribute(crate::services::http::ROUTE_PATTERN_ATTR)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let scopes = self.limiter.scopes_for(
            &req.remote_addr,
            user.as_deref(),
            route_pattern.as_deref(),
        );

        match self.limiter.check(&scopes) {
            RateDecision::Allowed {
                limit,
                remaining,
                reset_secs,
            } => {
                if self.limiter.emit_headers() {
                    res.insert_header("X-RateLimit-Limit", limit.to_string())?;
                    res.insert_header("X-RateLimit-Remaining", remaining.to_string())?;
                    res.insert_header("X-RateLimit-Reset", reset_secs.to_string())?;
                }
                Ok(StageFlow::Next)
            }
            RateDecision::Limited {
                scope,
                retry_after_secs,
            } => Err(AppError::TooManyRequests {
                scope,
                retry_after_secs,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::route::Method;

    fn limiter(max: u64, window_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            window_ms,
            max,
            global_max: None,
            route_max: None,
            exempt_paths: vec!["/health".to_string(), "/ping".to_string()],
            emit_headers: true,
        })
    }

    #[test]
    fn rejects_past_the_limit() {
        let limiter = limiter(2, 60_000);
        let scopes = vec![("ip:10.0.0.1".to_string(), 2)];
        assert!(matches!(limiter.check(&scopes), RateDecision::Allowed { .. }));
        assert!(matches!(limiter.check(&scopes), RateDecision::Allowed { .. }));
        match limiter.check(&scopes) {
            RateDecision::Limited {
                scope,
                retry_after_secs,
            } => {
                assert_eq!(scope, "ip:10.0.0.1");
                assert!(retry_after_secs >= 1 && retry_after_secs <= 60);
            }
            other => panic!("expected limit, got {:?}", other),
        }
    }

    #[test]
    fn scopes_are_independent() {
        let limiter = limiter(1, 60_000);
        let a = vec![("ip:10.0.0.1".to_string(), 1)];
        let b = vec![("ip:10.0.0.2".to_string(), 1)];
        assert!(matches!(limiter.check(&a), RateDecision::Allowed { .. }));
        assert!(matches!(limiter.check(&b), RateDecision::Allowed { .. }));
        assert!(matches!(limiter.check(&a), RateDecision::Limited { .. }));
    }

    #[test]
    fn window_slides() {
        let limiter = limiter(1, 50);
        let scopes = vec![("ip:10.0.0.9".to_string(), 1)];
        assert!(matches!(limiter.check(&scopes), RateDecision::Allowed { .. }));
        assert!(matches!(limiter.check(&scopes), RateDecision::Limited { .. }));
        std::thread::sleep(Duration::from_millis(70));
        assert!(matches!(limiter.check(&scopes), RateDecision::Allowed { .. }));
    }

    #[test]
    fn remaining_counts_down() {
        let limiter = limiter(3, 60_000);
        let scopes = limiter.scopes_for("1.2.3.4", None, None);
        match limiter.check(&scopes) {
            RateDecision::Allowed { remaining, limit, .. } => {
                assert_eq!(limit, 3);
                assert_eq!(remaining, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn user_scope_is_added_when_identified() {
        let limiter = limiter(5, 60_000);
        let scopes = limiter.scopes_for("1.1.1.1", Some("u42"), None);
        assert!(scopes.iter().any(|(s, _)| s == "user:u42"));
        assert!(scopes.iter().any(|(s, _)| s == "ip:1.1.1.1"));
    }

    #[test]
    fn route_scope_caps_all_clients_together() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            window_ms: 60_000,
            max: 100,
            global_max: None,
            route_max: Some(2),
            exempt_paths: vec![],
            emit_headers: true,
        });
        for ip in ["1.1.1.1", "2.2.2.2"] {
            let scopes = limiter.scopes_for(ip, None, Some("/api/report"));
            assert!(matches!(limiter.check(&scopes), RateDecision::Allowed { .. }));
        }
        // Third request from a fresh address still trips the route cap.
        let scopes = limiter.scopes_for("3.3.3.3", None, Some("/api/report"));
        match limiter.check(&scopes) {
            RateDecision::Limited { scope, .. } => assert_eq!(scope, "route:/api/report"),
            other => panic!("expected route limit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn stage_emits_headers_and_429() {
        let stage = RateLimitStage::new(limiter(2, 60_000));
        for i in 0..2 {
            let mut req = Request::new(Method::Get, "/r").with_remote_addr("9.9.9.9");
            let mut res = Response::new();
            let flow = stage.handle(&mut req, &mut res).await.unwrap();
            assert_eq!(flow, StageFlow::Next, "request {} should pass", i);
            assert_eq!(res.header("x-ratelimit-limit"), Some("2"));
        }
        let mut req = Request::new(Method::Get, "/r").with_remote_addr("9.9.9.9");
        let mut res = Response::new();
        let err = stage.handle(&mut req, &mut res).await.unwrap_err();
        match err {
            AppError::TooManyRequests {
                retry_after_secs, ..
            } => assert!(retry_after_secs >= 1 && retry_after_secs <= 60),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn exempt_paths_bypass_evaluation() {
        let stage = RateLimitStage::new(limiter(1, 60_000));
        for _ in 0..5 {
            let mut req = Request::new(Method::Get, "/health").with_remote_addr("8.8.8.8");
            let mut res = Response::new();
            assert_eq!(
                stage.handle(&mut req, &mut res).await.unwrap(),
                StageFlow::Next
            );
            assert!(res.header("x-ratelimit-limit").is_none());
        }
    }
}
