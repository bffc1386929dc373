//! Request lifecycle controls: timeouts, admission and shutdown drain.
//!
//! Admission happens before any route work: the global inflight cap and
//! the per-IP cap both answer 503 when exceeded. Timeouts wrap the whole
//! pipeline+handler invocation and answer 504, firing the request's
//! cancellation flag so downstream work stops. Shutdown flips the
//! accepting flag and waits for inflight to drain within the graceful
//! budget.

use crate::models::config::RequestManagementSection;
use crate::models::error::AppError;
use crate::utils::path::normalize;
use ahash::HashMap as AHashMap;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Releases one admission slot on drop, so every early return and panic
/// path gives the slot back.
#[derive(Debug)]
pub struct AdmissionGuard {
    controller: Arc<LifecycleController>,
    ip: String,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.controller.release(&self.ip);
    }
}

#[derive(Debug)]
pub struct LifecycleController {
    default_timeout: Duration,
    /// Normalized route pattern → timeout override.
    route_timeouts: Vec<(String, Duration)>,
    max_concurrent: usize,
    max_per_ip: usize,
    inflight: AtomicUsize,
    per_ip: RwLock<AHashMap<String, usize>>,
    accepting: AtomicBool,
}

impl LifecycleController {
    pub fn new(config: &RequestManagementSection) -> Self {
        let route_timeouts = config
            .timeout
            .routes
            .iter()
            .map(|(pattern, ms)| (normalize(pattern), Duration::from_millis(*ms)))
            .collect();
        Self {
            default_timeout: Duration::from_millis(config.timeout.default_timeout_ms),
            route_timeouts,
            max_concurrent: config.concurrency.max_concurrent_requests,
            max_per_ip: config.concurrency.max_per_ip,
            inflight: AtomicUsize::new(0),
            per_ip: RwLock::new(AHashMap::default()),
            accepting: AtomicBool::new(true),
        }
    }

    /// Timeout budget for a route, preferring the route's own override,
    /// then the configured pattern table, then the default. Zero means
    /// no timeout.
    pub fn timeout_for(&self, pattern: &str, route_override_ms: Option<u64>) -> Option<Duration> {
        let budget = if let Some(ms) = route_override_ms {
            Duration::from_millis(ms)
        } else {
            let normalized = normalize(pattern);
            self.route_timeouts
                .iter()
                .find(|(p, _)| *p == normalized)
                .map(|(_, d)| *d)
                .unwrap_or(self.default_timeout)
        };
        (!budget.is_zero()).then_some(budget)
    }

    /// Admits a request or answers why not. The returned guard must live
    /// for the duration of the request.
    pub fn admit(self: &Arc<Self>, ip: &str) -> Result<AdmissionGuard, AppError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(AppError::ServiceUnavailable {
                reason: "server is shutting down".to_string(),
            });
        }

        if self.max_concurrent > 0 {
            let current = self.inflight.load(Ordering::SeqCst);
            if current >= self.max_concurrent {
                warn!("admission: global cap {} reached", self.max_concurrent);
                return Err(AppError::ServiceUnavailable {
                    reason: "server at capacity".to_string(),
                });
            }
        }

        if self.max_per_ip > 0 {
            let per_ip = self.per_ip.read().unwrap_or_else(|e| e.into_inner());
            if per_ip.get(ip).copied().unwrap_or(0) >= self.max_per_ip {
                warn!("admission: per-ip cap reached for {}", ip);
                return Err(AppError::ServiceUnavailable {
                    reason: "too many concurrent requests from this address".to_string(),
                });
            }
        }

        self.inflight.fetch_add(1, Ordering::SeqCst);
        {
            let mut per_ip = self.per_ip.write().unwrap_or_else(|e| e.into_inner());
            *per_ip.entry(ip.to_string()).or_insert(0) += 1;
        }
        Ok(AdmissionGuard {
            controller: Arc::clone(self),
            ip: ip.to_string(),
        })
    }

    fn release(&self, ip: &str) {
        self.inflight.fetch_sub(1, Ordering::SeqCst);
        let mut per_ip = self.per_ip.write().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = per_ip.get_mut(ip) {
            *count -= 1;
            if *count == 0 {
                per_ip.remove(ip);
            }
        }
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Stops admission and waits for inflight requests to finish, up to
    /// the graceful budget. Returns whether the drain completed cleanly.
    pub async fn shutdown(&self, graceful_timeout: Duration) -> bool {
        self.accepting.store(false, Ordering::SeqCst);
        info!(
            "lifecycle: draining {} inflight request(s)",
            self.inflight()
        );
        let deadline = Instant::now() + graceful_timeout;
        while self.inflight() > 0 {
            if Instant::now() >= deadline {
                warn!(
                    "lifecycle: graceful drain expired with {} request(s) inflight",
                    self.inflight()
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        true
    }
}
