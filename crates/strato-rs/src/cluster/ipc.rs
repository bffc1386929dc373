//! The supervisor-side IPC bus.
//!
//! Envelopes travel as newline-delimited JSON over each worker's stdio
//! pipes: the supervisor writes to the child's stdin, the child answers
//! on stdout (worker logs go to stderr, which keeps stdout clean for the
//! protocol). One writer task owns each connection's send side, so
//! per-pair ordering is FIFO by construction; across workers there is no
//! global order.
//!
//! Every API degrades to a silent no-op when the bus is disabled —
//! clustering off or fallen back to single-process — so callers never
//! need to guard their sends.

use crate::models::error::AppError;
use crate::models::ipc::{IpcEnvelope, IpcKind, IpcTarget};
use ahash::HashMap as AHashMap;
use log::{debug, warn};
use rand::seq::IteratorRandom;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

/// Messages above this size are rejected at the sender.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;
/// Default deadline for request-reply exchanges.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// The supervisor's identity in envelope `from`/`to` fields.
pub const PARENT_ID: &str = "parent";

/// Serializes an envelope to its wire line, enforcing the size ceiling.
pub fn encode_envelope(envelope: &IpcEnvelope, max_bytes: usize) -> Result<String, AppError> {
    let line = serde_json::to_string(envelope).map_err(|e| AppError::Internal {
        message: format!("envelope serialization failed: {}", e),
    })?;
    if line.len() > max_bytes {
        return Err(AppError::IpcOversize {
            size: line.len(),
            limit: max_bytes,
        });
    }
    Ok(line)
}

/// Parses one wire line. Unparseable lines are reported, not fatal —
/// a worker writing garbage to stdout must not take the bus down.
pub fn decode_envelope(line: &str) -> Option<IpcEnvelope> {
    match serde_json::from_str(line) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            warn!("ipc: discarding unparseable line: {}", e);
            None
        }
    }
}

pub struct IpcBus {
    /// Worker id → send half of that worker's writer task.
    peers: RwLock<AHashMap<String, mpsc::UnboundedSender<IpcEnvelope>>>,
    /// Outstanding RPCs awaiting their reply envelope.
    pending: Mutex<AHashMap<Uuid, oneshot::Sender<IpcEnvelope>>>,
    max_message_bytes: usize,
    enabled: AtomicBool,
}

impl Default for IpcBus {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_BYTES)
    }
}

impl IpcBus {
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            peers: RwLock::new(AHashMap::default()),
            pending: Mutex::new(AHashMap::default()),
            max_message_bytes,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    /// Turns the bus into a permanent no-op (single-process fallback).
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn register_peer(&self, worker_id: &str, tx: mpsc::UnboundedSender<IpcEnvelope>) {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(worker_id.to_string(), tx);
    }

    pub fn remove_peer(&self, worker_id: &str) {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(worker_id);
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn push(&self, worker_id: &str, envelope: IpcEnvelope) -> Result<(), AppError> {
        // Size enforcement happens at the sender so oversize failures are
        // visible where the message originates.
        encode_envelope(&envelope, self.max_message_bytes)?;
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        match peers.get(worker_id) {
            Some(tx) => tx.send(envelope).map_err(|_| AppError::Internal {
                message: format!("worker {} writer is gone", worker_id),
            }),
            None => Err(AppError::Internal {
                message: format!("no such worker: {}", worker_id),
            }),
        }
    }

    /// Sends a fully built envelope (used for RPC replies, which must
    /// keep their `reply_to` correlation).
    pub fn send_envelope(&self, worker_id: &str, envelope: IpcEnvelope) -> Result<(), AppError> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.push(worker_id, envelope)
    }

    /// Sends one envelope to one worker.
    pub fn send_to(
        &self,
        worker_id: &str,
        kind: IpcKind,
        payload: Value,
    ) -> Result<(), AppError> {
        if !self.is_enabled() {
            return Ok(());
        }
        let envelope = IpcEnvelope::new(
            PARENT_ID,
            IpcTarget::Worker(worker_id.to_string()),
            kind,
            payload,
        );
        self.push(worker_id, envelope)
    }

    /// Sends to every registered worker. Individual failures are logged
    /// and skipped; broadcast is best-effort by contract.
    pub fn broadcast(&self, kind: IpcKind, payload: Value) -> Result<(), AppError> {
        if !self.is_enabled() {
            return Ok(());
        }
        for worker_id in self.peer_ids() {
            let envelope =
                IpcEnvelope::new(PARENT_ID, IpcTarget::Broadcast, kind, payload.clone());
            if let Err(e) = self.push(&worker_id, envelope) {
                debug!("ipc: broadcast to {} failed: {}", worker_id, e);
            }
        }
        Ok(())
    }

    /// Sends to one randomly chosen worker.
    pub fn send_random(&self, kind: IpcKind, payload: Value) -> Result<(), AppError> {
        if !self.is_enabled() {
            return Ok(());
        }
        let target = {
            let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
            peers.keys().choose(&mut rand::thread_rng()).cloned()
        };
        match target {
            Some(worker_id) => {
                let envelope =
                    IpcEnvelope::new(PARENT_ID, IpcTarget::Random, kind, payload);
                self.push(&worker_id, envelope)
            }
            None => Ok(()),
        }
    }

    /// Request-reply: sends an `RpcRequest` and awaits the matching
    /// `RpcReply` within `timeout`. When the bus is disabled the call
    /// resolves immediately with `Value::Null`.
    pub async fn rpc(
        &self,
        worker_id: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, AppError> {
        if !self.is_enabled() {
            return Ok(Value::Null);
        }
        let envelope = IpcEnvelope::new(
            PARENT_ID,
            IpcTarget::Worker(worker_id.to_string()),
            IpcKind::RpcRequest,
            payload,
        );
        let envelope_id = envelope.envelope_id;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(envelope_id, tx);

        if let Err(e) = self.push(worker_id, envelope) {
            self.pending.lock().await.remove(&envelope_id);
            return Err(e);
        }

        let deadline = timeout.unwrap_or(DEFAULT_RPC_TIMEOUT);
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(reply)) => Ok(reply.payload),
            Ok(Err(_)) => Err(AppError::IpcTimeout {
                envelope_id: envelope_id.to_string(),
            }),
            Err(_) => {
                self.pending.lock().await.remove(&envelope_id);
                Err(AppError::IpcTimeout {
                    envelope_id: envelope_id.to_string(),
                })
            }
        }
    }

    /// Routes an inbound envelope: RPC replies complete their waiter,
    /// everything else is returned to the caller for dispatch.
    pub async fn dispatch_inbound(&self, envelope: IpcEnvelope) -> Option<IpcEnvelope> {
        if envelope.kind == IpcKind::RpcReply {
            if let Some(reply_to) = envelope.reply_to {
                if let Some(tx) = self.pending.lock().await.remove(&reply_to) {
                    let _ = tx.send(envelope);
                    return None;
                }
                debug!("ipc: late rpc reply for {}", reply_to);
                return None;
            }
        }
        Some(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn oversize_messages_are_rejected_at_the_sender() {
        let bus = IpcBus::new(128);
        let (tx, _rx) = mpsc::unbounded_channel();
        bus.register_peer("w1", tx);
        let err = bus
            .send_to("w1", IpcKind::AppMessage, json!({"blob": "x".repeat(512)}))
            .unwrap_err();
        assert!(matches!(err, AppError::IpcOversize { .. }));
    }

    #[test]
    fn disabled_bus_apis_are_silent_no_ops() {
        let bus = IpcBus::default();
        bus.disable();
        assert!(bus.send_to("nobody", IpcKind::Shutdown, json!({})).is_ok());
        assert!(bus.broadcast(IpcKind::AppMessage, json!({})).is_ok());
        assert!(bus.send_random(IpcKind::AppMessage, json!({})).is_ok());
    }

    #[tokio::test]
    async fn disabled_bus_rpc_resolves_null() {
        let bus = IpcBus::default();
        bus.disable();
        let value = bus.rpc("nobody", json!({"q": 1}), None).await.unwrap();
        assert_eq!(value, Value::Null);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_peer() {
        let bus = IpcBus::default();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        bus.register_peer("w1", tx1);
        bus.register_peer("w2", tx2);
        bus.broadcast(IpcKind::AppMessage, json!({"n": 1})).unwrap();
        assert_eq!(rx1.recv().await.unwrap().payload["n"], 1);
        assert_eq!(rx2.recv().await.unwrap().payload["n"], 1);
    }

    #[tokio::test]
    async fn random_send_picks_exactly_one_peer() {
        let bus = IpcBus::default();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        bus.register_peer("w1", tx1);
        bus.register_peer("w2", tx2);
        bus.send_random(IpcKind::AppMessage, json!({})).unwrap();
        let delivered = usize::from(rx1.try_recv().is_ok()) + usize::from(rx2.try_recv().is_ok());
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn rpc_round_trip_and_timeout() {
        let bus = std::sync::Arc::new(IpcBus::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.register_peer("w1", tx);

        // A fake worker loop answering RPC requests.
        let bus_for_worker = bus.clone();
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                if request.kind == IpcKind::RpcRequest {
                    let reply = request.reply("w1", json!({"answer": 42}));
                    bus_for_worker.dispatch_inbound(reply).await;
                }
            }
        });

        let value = bus.rpc("w1", json!({"q": "meaning"}), None).await.unwrap();
        assert_eq!(value["answer"], 42);

        // No worker registered under this id: immediate error.
        assert!(bus.rpc("ghost", json!({}), None).await.is_err());
    }

    #[tokio::test]
    async fn rpc_times_out_without_reply() {
        let bus = IpcBus::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        bus.register_peer("mute", tx);
        let err = bus
            .rpc("mute", json!({}), Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::IpcTimeout { .. }));
    }

    #[tokio::test]
    async fn non_rpc_envelopes_pass_through_dispatch() {
        let bus = IpcBus::default();
        let envelope = IpcEnvelope::new("w1", IpcTarget::Parent, IpcKind::Heartbeat, json!({}));
        let back = bus.dispatch_inbound(envelope.clone()).await.unwrap();
        assert_eq!(back.envelope_id, envelope.envelope_id);
    }
}
