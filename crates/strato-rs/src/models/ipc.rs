//! Typed IPC message envelopes exchanged between the supervisor and its
//! worker processes.
//!
//! Envelopes travel as single JSON lines over the worker's stdio pipes.
//! Delivery is at-least-once within one host; receivers must tolerate
//! duplicates of idempotent kinds (`heartbeat`, `metrics`, `config_update`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Addressing for an envelope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum IpcTarget {
    /// A specific worker id.
    Worker(String),
    /// Every alive worker.
    Broadcast,
    /// One randomly chosen alive worker.
    Random,
    /// The supervisor process.
    Parent,
}

/// Message kinds carried on the bus.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IpcKind {
    /// Worker finished startup and is accepting requests.
    Ready,
    /// Liveness signal from a worker.
    Heartbeat,
    /// Periodic worker resource/request metrics.
    Metrics,
    /// Replace the worker's configuration snapshot.
    ConfigUpdate,
    /// Graceful stop request.
    Shutdown,
    /// Application-level broadcast payload.
    AppMessage,
    /// Request half of a request-reply exchange.
    RpcRequest,
    /// Reply half, correlated by `reply_to`.
    RpcReply,
}

/// A single message on the bus.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IpcEnvelope {
    pub envelope_id: Uuid,
    pub from: String,
    pub to: IpcTarget,
    pub kind: IpcKind,
    #[serde(default)]
    pub payload: Value,
    /// Envelope id this message answers, for `RpcReply`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
}

impl IpcEnvelope {
    pub fn new(from: impl Into<String>, to: IpcTarget, kind: IpcKind, payload: Value) -> Self {
        Self {
            envelope_id: Uuid::new_v4(),
            from: from.into(),
            to,
            kind,
            payload,
            reply_to: None,
        }
    }

    /// Builds the reply to an `RpcRequest` envelope.
    pub fn reply(&self, from: impl Into<String>, payload: Value) -> Self {
        Self {
            envelope_id: Uuid::new_v4(),
            from: from.into(),
            to: IpcTarget::Worker(self.from.clone()),
            kind: IpcKind::RpcReply,
            payload,
            reply_to: Some(self.envelope_id),
        }
    }
}

/// Resource and traffic metrics reported by a worker on each interval.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct WorkerMetrics {
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub inflight: u64,
    pub requests_total: u64,
    pub errors_total: u64,
    pub avg_response_time_ms: f64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_round_trip() {
        let env = IpcEnvelope::new(
            "worker-1",
            IpcTarget::Parent,
            IpcKind::Metrics,
            json!({"cpu_pct": 12.5}),
        );
        let line = serde_json::to_string(&env).unwrap();
        let back: IpcEnvelope = serde_json::from_str(&line).unwrap();
        assert_eq!(back.envelope_id, env.envelope_id);
        assert_eq!(back.kind, IpcKind::Metrics);
        assert_eq!(back.payload["cpu_pct"], 12.5);
        assert!(back.reply_to.is_none());
    }

    #[test]
    fn reply_correlates_with_request() {
        let req = IpcEnvelope::new("worker-2", IpcTarget::Parent, IpcKind::RpcRequest, json!({}));
        let reply = req.reply("parent", json!({"ok": true}));
        assert_eq!(reply.reply_to, Some(req.envelope_id));
        assert_eq!(reply.kind, IpcKind::RpcReply);
        assert_eq!(reply.to, IpcTarget::Worker("worker-2".to_string()));
    }

    #[test]
    fn kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&IpcKind::ConfigUpdate).unwrap(),
            r#""config_update""#
        );
    }
}
