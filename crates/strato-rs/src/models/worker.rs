//! Worker process bookkeeping owned by the cluster supervisor.

use crate::models::ipc::WorkerMetrics;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Lifecycle state of a worker process.
///
/// Legal transitions:
///
/// ```text
/// starting → alive
/// alive → degraded          (health probe failed N consecutive times)
/// degraded → alive          (next healthy probe)
/// alive|degraded → stopping (shutdown or restart decision)
/// stopping → dead           (exit, or kill after the graceful timeout)
/// dead → starting           (respawn policy permitting)
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Starting,
    Alive,
    Degraded,
    Stopping,
    Dead,
}

impl WorkerState {
    /// Whether a transition to `next` is declared by the state machine.
    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Starting, Alive)
                | (Starting, Dead)
                | (Alive, Degraded)
                | (Degraded, Alive)
                | (Alive, Stopping)
                | (Degraded, Stopping)
                | (Stopping, Dead)
                | (Dead, Starting)
        )
    }

    pub fn is_serving(&self) -> bool {
        matches!(self, WorkerState::Alive | WorkerState::Degraded)
    }
}

/// Supervisor-side record for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerDescriptor {
    pub id: String,
    pub pid: Option<u32>,
    pub port: u16,
    pub state: WorkerState,
    pub started_at: Instant,
    pub restart_count: u32,
    pub last_heartbeat: Option<Instant>,
    pub consecutive_probe_failures: u32,
    pub metrics: WorkerMetrics,
}

impl WorkerDescriptor {
    pub fn new(id: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            pid: None,
            port,
            state: WorkerState::Starting,
            started_at: Instant::now(),
            restart_count: 0,
            last_heartbeat: None,
            consecutive_probe_failures: 0,
            metrics: WorkerMetrics::default(),
        }
    }

    /// Applies a state transition, rejecting undeclared ones.
    pub fn transition(&mut self, next: WorkerState) -> Result<(), String> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(format!(
                "worker {}: illegal transition {:?} -> {:?}",
                self.id, self.state, next
            ));
        }
        self.state = next;
        Ok(())
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
