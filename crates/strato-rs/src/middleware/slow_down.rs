//! Progressive request slow-down.
//!
//! After `delay_after` requests from one IP inside the window, each excess
//! request is delayed by `(count - delay_after) * base_delay_ms`, capped at
//! `max_delay_ms`. This throttles scripted abuse without rejecting anyone;
//! hard rejection stays the rate limiter's job.

use crate::middleware::{PipelineStage, StageFlow};
use crate::models::config::SlowDownSection;
use crate::models::context::{Request, Response};
use crate::models::error::AppError;
use ahash::HashMap as AHashMap;
use async_trait::async_trait;
use log::debug;
use std::sync::RwLock;
use std::time::{Duration, Instant};

pub struct SlowDownStage {
    config: SlowDownSection,
    /// Tighter profile for unsafe methods when brute-force hardening is on.
    brute_force: bool,
    counters: RwLock<AHashMap<String, Vec<Instant>>>,
}

impl SlowDownStage {
    pub fn new(config: SlowDownSection, brute_force: bool) -> Self {
        Self {
            config,
            brute_force,
            counters: RwLock::new(AHashMap::default()),
        }
    }

    /// Computes the delay owed by this request, counting it in the window.
    fn delay_for(&self, ip: &str, unsafe_method: bool) -> Duration {
        let now = Instant::now();
        let window = Duration::from_millis(self.config.window_ms);
        let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
        let entries = counters.entry(ip.to_string()).or_default();
        entries.retain(|&t| now.duration_since(t) < window);
        entries.push(now);
        let count = entries.len() as u64;

        let delay_after = if self.brute_force && unsafe_method {
            // Credential-guessing traffic is unsafe-method heavy; halve
            // the free allowance for it.
            (self.config.delay_after / 2).max(1)
        } else {
            self.config.delay_after
        };

        if count <= delay_after {
            return Duration::ZERO;
        }
        let excess = count - delay_after;
        let delay_ms = (excess * self.config.base_delay_ms).min(self.config.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

#[async_trait]
impl PipelineStage for SlowDownStage {
    fn id(&self) -> &'static str {
        "slow-down"
    }

    // The throttling delay is the point of this stage; the watchdog must
    // not cut it short.
    fn watchdog_exempt(&self) -> bool {
        true
    }

    async fn handle(&self, req: &mut Request, _res: &mut Response) -> Result<StageFlow, AppError> {
        let delay = self.delay_for(&req.remote_addr, !req.method.is_safe());
        if !delay.is_zero() {
            debug!(
                "slow-down: delaying {} by {}ms",
                req.remote_addr,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }
        Ok(StageFlow::Next)
    }
}
