//! Metric-driven worker auto-scaling.
//!
//! Each evaluation scores the aggregated cluster metrics against the
//! configured thresholds. Scale-up votes: cpu (+30), memory (+25),
//! response time (+35), queue length (+40), acting at a combined score of
//! 50. Scale-down votes: cpu (+20), memory (+15), idle time (+30), acting
//! at 40. The score becomes a confidence once adjusted by the recent
//! success rate of the same action; low-confidence decisions are skipped,
//! and a cooldown separates consecutive actions.

use crate::models::config::AutoScalingSection;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Aggregated metrics over all serving workers.
#[derive(Debug, Clone, Default)]
pub struct ClusterMetrics {
    pub avg_cpu_pct: f64,
    pub avg_mem_pct: f64,
    pub avg_response_time_ms: f64,
    /// Requests currently queued/inflight across the cluster.
    pub queue_len: f64,
    pub error_rate: f64,
    pub active_workers: usize,
    /// Seconds since the cluster last saw meaningful load.
    pub idle_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScaleAction {
    Up,
    Down,
}

/// One evaluation's verdict, before cooldown/bounds are applied.
#[derive(Debug, Clone)]
pub struct ScaleDecision {
    pub action: Option<ScaleAction>,
    pub score: f64,
    pub confidence: f64,
    pub reasons: Vec<String>,
}

/// The scaling side-effects, implemented by the supervisor.
#[async_trait]
pub trait ScaleExecutor: Send + Sync {
    async fn scale_up(&self, step: usize) -> Result<(), crate::models::error::AppError>;
    async fn scale_down(&self, step: usize) -> Result<(), crate::models::error::AppError>;
}

struct ActionRecord {
    action: ScaleAction,
    success: bool,
}

pub struct AutoScaler {
    config: AutoScalingSection,
    last_action_at: Mutex<Option<Instant>>,
    history: Mutex<Vec<ActionRecord>>,
}

impl AutoScaler {
    pub fn new(config: AutoScalingSection) -> Self {
        Self {
            config,
            last_action_at: Mutex::new(None),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.config.check_interval_ms)
    }

    /// Success fraction of the last ten occurrences of `action`; 1.0 with
    /// no history, so a fresh scaler is not paralyzed by the confidence
    /// gate.
    fn success_rate(&self, action: ScaleAction) -> f64 {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let recent: Vec<&ActionRecord> = history
            .iter()
            .rev()
            .filter(|r| r.action == action)
            .take(10)
            .collect();
        if recent.is_empty() {
            return 1.0;
        }
        recent.iter().filter(|r| r.success).count() as f64 / recent.len() as f64
    }

    /// Pure scoring pass over one metrics sample.
    pub fn evaluate(&self, m: &ClusterMetrics) -> ScaleDecision {
        let up = &self.config.scale_up_threshold;
        let down = &self.config.scale_down_threshold;
        let mut reasons = Vec::new();

        let mut up_score: f64 = 0.0;
        if m.avg_cpu_pct > up.cpu {
            up_score += 30.0;
            reasons.push(format!("cpu {:.0}% > {:.0}%", m.avg_cpu_pct, up.cpu));
        }
        if m.avg_mem_pct > up.memory {
            up_score += 25.0;
            reasons.push(format!("mem {:.0}% > {:.0}%", m.avg_mem_pct, up.memory));
        }
        if m.avg_response_time_ms > up.response_time_ms {
            up_score += 35.0;
            reasons.push(format!(
                "rt {:.0}ms > {:.0}ms",
                m.avg_response_time_ms, up.response_time_ms
            ));
        }
        if m.queue_len > up.queue_length {
            up_score += 40.0;
            reasons.push(format!("queue {:.0} > {:.0}", m.queue_len, up.queue_length));
        }

        let mut down_score = 0.0;
        if m.avg_cpu_pct < down.cpu {
            down_score += 20.0;
        }
        if m.avg_mem_pct < down.memory {
            down_score += 15.0;
        }
        if m.idle_secs > down.idle_secs {
            down_score += 30.0;
        }

        let (action, score) = if up_score >= 50.0 {
            (Some(ScaleAction::Up), up_score)
        } else if down_score >= 40.0 {
            reasons.push(format!(
                "cold: cpu {:.0}%, mem {:.0}%, idle {:.0}s",
                m.avg_cpu_pct, m.avg_mem_pct, m.idle_secs
            ));
            (Some(ScaleAction::Down), down_score)
        } else {
            (None, up_score.max(down_score))
        };

        // Confidence is the score shifted by recent success for the same
        // action, worth up to ±20 points.
        let confidence = match action {
            Some(a) => score + (self.success_rate(a) - 0.5) * 40.0,
            None => score,
        };

        ScaleDecision {
            action,
            score,
            confidence,
            reasons,
        }
    }

    /// Applies cooldown, confidence gate and worker bounds on top of a
    /// raw evaluation. Returns the action to execute, if any.
    pub fn decide(&self, m: &ClusterMetrics) -> Option<ScaleAction> {
        let decision = self.evaluate(m);
        let action = decision.action?;

        if decision.confidence < 60.0 {
            debug!(
                "autoscaler: skipping {:?} at confidence {:.0}",
                action, decision.confidence
            );
            return None;
        }

        {
            let last = self.last_action_at.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(at) = *last {
                let cooldown = Duration::from_millis(self.config.cooldown_period_ms);
                if at.elapsed() < cooldown {
                    debug!("autoscaler: in cooldown, skipping {:?}", action);
                    return None;
                }
            }
        }

        match action {
            ScaleAction::Up if m.active_workers >= self.config.max_workers => {
                debug!("autoscaler: already at max_workers");
                None
            }
            ScaleAction::Down if m.active_workers <= self.config.min_workers => {
                debug!("autoscaler: already at min_workers");
                None
            }
            _ => {
                info!(
                    "autoscaler: {:?} (score {:.0}, confidence {:.0}): {}",
                    action,
                    decision.score,
                    decision.confidence,
                    decision.reasons.join("; ")
                );
                Some(action)
            }
        }
    }

    pub fn record_outcome(&self, action: ScaleAction, success: bool) {
        *self.last_action_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push(ActionRecord { action, success });
        if history.len() > 100 {
            history.remove(0);
        }
    }

    /// One full tick: decide, execute, record. Used by the supervisor's
    /// scaling loop; separated for tests.
    pub async fn tick<E: ScaleExecutor>(&self, metrics: &ClusterMetrics, executor: &E) {
        let Some(action) = self.decide(metrics) else {
            return;
        };
        let step = self.config.scale_step.max(1);
        let started = Instant::now();
        info!("scaling:executing {:?} step {}", action, step);
        let result = match action {
            ScaleAction::Up => executor.scale_up(step).await,
            ScaleAction::Down => executor.scale_down(step).await,
        };
        let duration_ms = started.elapsed().as_millis();
        match result {
            Ok(()) => info!("scaling:completed {:?} in {}ms", action, duration_ms),
            Err(ref e) => warn!("scaling:completed {:?} failed in {}ms: {}", action, duration_ms, e),
        }
        self.record_outcome(action, result.is_ok());
    }
}
