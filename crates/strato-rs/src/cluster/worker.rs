//! The per-process worker runtime.
//!
//! A worker is the same executable started with `CLUSTER_MODE=true`. It
//! rebuilds its configuration from the environment the supervisor
//! prepared (clustering forcibly disabled, so a worker can never spawn
//! its own cluster), serves HTTP on its assigned port, and keeps two
//! duties toward the supervisor: obeying inbound control messages
//! (config updates, graceful stop) and reporting heartbeats and
//! resource metrics.
//!
//! Protocol transport is stdio: inbound on stdin, outbound on stdout.
//! Supervisor death closes stdin, which the read loop treats as a stop
//! signal — orphaned workers drain and exit instead of lingering.

use crate::app::App;
use crate::cluster::ipc::{decode_envelope, encode_envelope, DEFAULT_MAX_MESSAGE_BYTES};
use crate::config::worker_config_from_env;
use crate::models::config::ServerConfig;
use crate::models::error::AppError;
use crate::models::ipc::{IpcEnvelope, IpcKind, IpcTarget, WorkerMetrics};
use crate::server::spawn_server;
use log::{debug, error, info, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// Builds the application for a configuration snapshot. The same factory
/// runs in the supervisor (fallback path) and in every worker, so all
/// processes agree on the route table.
pub type AppFactory = Arc<dyn Fn(ServerConfig) -> App + Send + Sync>;

struct IpcClient {
    worker_id: String,
    tx: mpsc::UnboundedSender<IpcEnvelope>,
}

impl IpcClient {
    /// Spawns the single writer task that owns stdout.
    fn start(worker_id: &str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<IpcEnvelope>();
        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(envelope) = rx.recv().await {
                match encode_envelope(&envelope, DEFAULT_MAX_MESSAGE_BYTES) {
                    Ok(mut line) => {
                        line.push('\n');
                        if stdout.write_all(line.as_bytes()).await.is_err() {
                            break;
                        }
                        let _ = stdout.flush().await;
                    }
                    Err(e) => warn!("worker ipc: dropping oversize outbound: {}", e),
                }
            }
        });
        Self {
            worker_id: worker_id.to_string(),
            tx,
        }
    }

    fn send(&self, kind: IpcKind, payload: serde_json::Value) {
        let envelope = IpcEnvelope::new(
            self.worker_id.clone(),
            IpcTarget::Parent,
            kind,
            payload,
        );
        let _ = self.tx.send(envelope);
    }

    fn send_envelope(&self, envelope: IpcEnvelope) {
        let _ = self.tx.send(envelope);
    }
}

/// Samples this process's CPU and memory share.
fn sample_resources(system: &mut System) -> (f64, f64) {
    system.refresh_memory();
    system.refresh_processes();
    let pid = Pid::from_u32(std::process::id());
    let Some(process) = system.process(pid) else {
        return (0.0, 0.0);
    };
    let cpu_pct = process.cpu_usage() as f64;
    let total = system.total_memory();
    let mem_pct = if total > 0 {
        process.memory() as f64 / total as f64 * 100.0
    } else {
        0.0
    };
    (cpu_pct, mem_pct)
}

/// Entry point for a process started in worker mode. Returns when the
/// supervisor asks for a stop or disappears.
pub async fn run_worker(factory: AppFactory) -> Result<(), AppError> {
    let config = worker_config_from_env()?;
    let worker_id =
        std::env::var(crate::config::WORKER_ID_VAR).unwrap_or_else(|_| "worker-?".to_string());
    info!(
        "worker {}: starting on port {}",
        worker_id, config.server.port
    );

    let app = factory(config.clone());
    app.role().set(&format!("worker:{}", worker_id));
    let lifecycle = app.lifecycle().clone();
    let stats = app.stats().clone();
    let cache = app.cache().clone();
    let _sweeper = cache.start_maintenance(Duration::from_secs(60));

    let running = spawn_server(
        app.build_dispatcher(),
        &config.server.host,
        config.server.port,
    )
    .map_err(|e| AppError::WorkerStartup {
        worker_id: worker_id.clone(),
        reason: format!("bind failed: {}", e),
    })?;
    let dispatcher_slot = running.dispatcher.clone();
    let server_handle = running.handle.clone();

    let ipc = Arc::new(IpcClient::start(&worker_id));
    ipc.send(IpcKind::Ready, json!({ "port": config.server.port }));

    // Heartbeats.
    {
        let ipc = ipc.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                ticker.tick().await;
                ipc.send(IpcKind::Heartbeat, json!({}));
            }
        });
    }

    // Resource and traffic metrics.
    {
        let ipc = ipc.clone();
        let lifecycle = lifecycle.clone();
        let stats = stats.clone();
        let started = Instant::now();
        tokio::spawn(async move {
            let mut system = System::new();
            let mut ticker = tokio::time::interval(METRICS_INTERVAL);
            loop {
                ticker.tick().await;
                let (cpu_pct, mem_pct) = sample_resources(&mut system);
                let metrics = WorkerMetrics {
                    cpu_pct,
                    mem_pct,
                    inflight: lifecycle.inflight() as u64,
                    requests_total: stats.total(),
                    errors_total: stats.errors(),
                    avg_response_time_ms: stats.avg_response_time_ms(),
                    uptime_secs: started.elapsed().as_secs(),
                };
                match serde_json::to_value(&metrics) {
                    Ok(payload) => ipc.send(IpcKind::Metrics, payload),
                    Err(e) => debug!("metrics serialization failed: {}", e),
                }
            }
        });
    }

    // Control loop over stdin. Ends on Shutdown or supervisor death.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let Some(envelope) = decode_envelope(&line) else {
                    continue;
                };
                match envelope.kind {
                    IpcKind::Shutdown => {
                        info!("worker {}: shutdown requested", worker_id);
                        break;
                    }
                    IpcKind::ConfigUpdate => {
                        match serde_json::from_value::<ServerConfig>(envelope.payload.clone()) {
                            Ok(mut updated) => {
                                updated.cluster.enabled = false;
                                updated.server.port = config.server.port;
                                info!("worker {}: applying config update", worker_id);
                                let new_app = factory(updated);
                                new_app.role().set(&format!("worker:{}", worker_id));
                                dispatcher_slot.swap(new_app.build_dispatcher());
                            }
                            Err(e) => {
                                error!("worker {}: bad config update: {}", worker_id, e)
                            }
                        }
                    }
                    IpcKind::RpcRequest => {
                        let reply = envelope.reply(
                            worker_id.clone(),
                            json!({
                                "worker": worker_id,
                                "inflight": lifecycle.inflight(),
                                "requests": stats.total(),
                            }),
                        );
                        ipc.send_envelope(reply);
                    }
                    IpcKind::AppMessage => {
                        debug!(
                            "worker {}: app message: {}",
                            worker_id, envelope.payload
                        );
                    }
                    other => debug!("worker {}: ignoring {:?}", worker_id, other),
                }
            }
            Ok(None) => {
                warn!("worker {}: supervisor channel closed", worker_id);
                break;
            }
            Err(e) => {
                error!("worker {}: stdin error: {}", worker_id, e);
                break;
            }
        }
    }

    // Graceful drain, then stop the engine.
    let graceful =
        Duration::from_millis(config.cluster.process_management.graceful_shutdown_timeout_ms);
    let drained = lifecycle.shutdown(graceful).await;
    server_handle.stop(drained).await;
    info!("worker {}: stopped", worker_id);
    Ok(())
}
