//! Health probe payloads: `/health`, `/ready` and `/live`.
//!
//! `/health` reports service status, version, uptime and the process role
//! (`master`, `worker:<id>` or `single`), so cluster fallback behavior is
//! observable from the outside. The readiness and liveness payloads stay
//! minimal; they exist for orchestrator probes.

use crate::services::http::ServerStats;
use serde_json::{json, Value};
use std::time::Instant;

/// Builds the `/health` body.
pub fn health_payload(role: &str, started_at: Instant, stats: &ServerStats) -> Value {
    json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime": started_at.elapsed().as_secs(),
        "process": role,
        "requests": stats.snapshot(),
    })
}

/// Builds the `/ready` body.
pub fn readiness_payload() -> Value {
    json!({
        "status": "ready",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

/// Builds the `/live` body.
pub fn liveness_payload() -> Value {
    json!({
        "status": "alive",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_payload_carries_role_and_uptime() {
        let stats = ServerStats::default();
        stats.record_response(200, 5);
        let payload = health_payload("worker:3", Instant::now(), &stats);
        assert_eq!(payload["status"], "healthy");
        assert_eq!(payload["process"], "worker:3");
        assert!(payload["uptime"].is_u64());
        assert_eq!(payload["requests"]["total"], 1);
    }

    #[test]
    fn probe_payloads() {
        assert_eq!(readiness_payload()["status"], "ready");
        assert_eq!(liveness_payload()["status"], "alive");
    }
}
