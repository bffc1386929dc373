//! The cluster supervisor: worker spawning, readiness, health, respawn
//! and scaling.
//!
//! Workers are child processes running the same executable with
//! `CLUSTER_MODE=true`; each receives its identity, its port and the full
//! configuration snapshot through the environment, talks to the
//! supervisor over stdio IPC, and serves HTTP on its own port
//! (`base_port + ordinal`). The supervisor never crashes because of a
//! worker fault: startup failures fall back to single-process serving,
//! runtime deaths respawn within the restart policy.

use crate::cluster::autoscaler::{AutoScaler, ClusterMetrics, ScaleExecutor};
use crate::cluster::ipc::{decode_envelope, IpcBus};
use crate::config::{CLUSTER_MODE_VAR, WORKER_CONFIG_VAR, WORKER_ID_VAR, WORKER_PORT_VAR};
use crate::models::config::ServerConfig;
use crate::models::error::AppError;
use crate::models::ipc::{IpcEnvelope, IpcKind, WorkerMetrics};
use crate::models::worker::{WorkerDescriptor, WorkerState};
use ahash::HashMap as AHashMap;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde_json::json;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};

/// Events observable by tests and operators; every event is also logged.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    WorkerSpawned { id: String, pid: u32 },
    WorkerReady { id: String },
    WorkerStartupFailed { id: String, reason: String },
    WorkerExited { id: String, code: Option<i32> },
    WorkerRestarting { id: String, attempt: u32 },
    WorkerHealth { id: String, state: WorkerState },
    FallbackSingleProcess,
    ScalingExecuted { up: bool, step: usize },
}

/// Outcome of cluster startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStartOutcome {
    /// All initial workers came up; the supervisor coordinates them.
    Clustered { workers: usize },
    /// Worker startup failed; the caller should serve in-process.
    SingleProcessFallback,
}

pub struct ClusterSupervisor {
    config: Arc<ServerConfig>,
    bus: Arc<IpcBus>,
    workers: Arc<RwLock<AHashMap<String, WorkerDescriptor>>>,
    kill_switches: Mutex<AHashMap<String, oneshot::Sender<()>>>,
    events: broadcast::Sender<SupervisorEvent>,
    next_ordinal: AtomicUsize,
    shutting_down: Arc<AtomicBool>,
    /// Last instant any worker reported nonzero inflight load.
    last_busy: RwLock<Instant>,
    http: reqwest::Client,
}

impl ClusterSupervisor {
    pub fn new(config: Arc<ServerConfig>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            config,
            bus: Arc::new(IpcBus::default()),
            workers: Arc::new(RwLock::new(AHashMap::default())),
            kill_switches: Mutex::new(AHashMap::default()),
            events,
            next_ordinal: AtomicUsize::new(0),
            shutting_down: Arc::new(AtomicBool::new(false)),
            last_busy: RwLock::new(Instant::now()),
            http: reqwest::Client::new(),
        })
    }

    pub fn bus(&self) -> &Arc<IpcBus> {
        &self.bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SupervisorEvent) {
        debug!("supervisor event: {:?}", event);
        let _ = self.events.send(event);
    }

    fn worker_exec(&self) -> Result<std::path::PathBuf, AppError> {
        match &self.config.cluster.worker_exec {
            Some(path) => Ok(std::path::PathBuf::from(path)),
            None => std::env::current_exe().map_err(|e| AppError::Config {
                message: format!("cannot resolve worker executable: {}", e),
            }),
        }
    }

    /// Starts the initial worker set. Any startup failure tears the
    /// partial cluster down and reports the single-process fallback —
    /// request handling must survive even when clustering cannot.
    pub async fn start(self: &Arc<Self>) -> Result<ClusterStartOutcome, AppError> {
        let initial = self.config.cluster.workers.resolve();
        let overall = Duration::from_millis(self.config.cluster.cluster_start_timeout_ms);
        info!("cluster: starting {} worker(s)", initial);

        let startup = async {
            for _ in 0..initial {
                self.spawn_next_worker().await?;
            }
            Ok::<(), AppError>(())
        };

        match tokio::time::timeout(overall, startup).await {
            Ok(Ok(())) => {
                self.start_health_loop();
                self.start_scaling_loop();
                info!("cluster: {} worker(s) ready", initial);
                Ok(ClusterStartOutcome::Clustered { workers: initial })
            }
            Ok(Err(e)) => {
                error!("cluster: worker startup failed: {}", e);
                self.fall_back().await;
                Ok(ClusterStartOutcome::SingleProcessFallback)
            }
            Err(_) => {
                error!(
                    "cluster: startup exceeded {}ms",
                    self.config.cluster.cluster_start_timeout_ms
                );
                self.fall_back().await;
                Ok(ClusterStartOutcome::SingleProcessFallback)
            }
        }
    }

    async fn fall_back(&self) {
        self.emit(SupervisorEvent::FallbackSingleProcess);
        self.kill_all().await;
        self.bus.disable();
        warn!("cluster: falling back to single-process mode");
    }

    /// Spawns the next worker ordinal and waits for readiness.
    async fn spawn_next_worker(self: &Arc<Self>) -> Result<String, AppError> {
        let ordinal = self.next_ordinal.fetch_add(1, Ordering::SeqCst);
        let id = format!("worker-{}", ordinal);
        let port = self
            .config
            .server
            .port
            .wrapping_add(1)
            .wrapping_add(ordinal as u16);
        self.spawn_worker(&id, port, 0).await?;
        self.wait_ready(&id).await?;
        Ok(id)
    }

    /// Launches the worker process and wires its stdio into the bus.
    fn spawn_worker<'a>(
        self: &'a Arc<Self>,
        id: &'a str,
        port: u16,
        restart_count: u32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), AppError>> + Send + 'a>>
    {
        Box::pin(async move {
        let exec = self.worker_exec()?;
        let config_blob =
            serde_json::to_string(self.config.as_ref()).map_err(|e| AppError::Config {
                message: format!("cannot serialize worker config: {}", e),
            })?;

        let mut child = match Command::new(&exec)
            .env(CLUSTER_MODE_VAR, "true")
            .env(WORKER_ID_VAR, id)
            .env(WORKER_PORT_VAR, port.to_string())
            .env(WORKER_CONFIG_VAR, config_blob)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.emit(SupervisorEvent::WorkerStartupFailed {
                    id: id.to_string(),
                    reason: e.to_string(),
                });
                return Err(AppError::WorkerStartup {
                    worker_id: id.to_string(),
                    reason: format!("spawn failed: {}", e),
                });
            }
        };

        let pid = child.id().unwrap_or(0);
        let stdin = child.stdin.take().ok_or_else(|| AppError::WorkerStartup {
            worker_id: id.to_string(),
            reason: "no stdin pipe".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| AppError::WorkerStartup {
            worker_id: id.to_string(),
            reason: "no stdout pipe".to_string(),
        })?;

        {
            let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
            let mut descriptor = WorkerDescriptor::new(id, port);
            descriptor.pid = Some(pid);
            descriptor.restart_count = restart_count;
            workers.insert(id.to_string(), descriptor);
        }
        self.emit(SupervisorEvent::WorkerSpawned {
            id: id.to_string(),
            pid,
        });

        // Writer task owns the child's stdin; the bus sends through it.
        let (tx, mut rx) = mpsc::unbounded_channel::<IpcEnvelope>();
        self.bus.register_peer(id, tx);
        let max_bytes = self.bus.max_message_bytes();
        let writer_id = id.to_string();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(envelope) = rx.recv().await {
                match crate::cluster::ipc::encode_envelope(&envelope, max_bytes) {
                    Ok(mut line) => {
                        line.push('\n');
                        if stdin.write_all(line.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("ipc: drop outbound to {}: {}", writer_id, e),
                }
            }
        });

        // Reader task: worker stdout lines → bus → supervisor handling.
        let reader_self = Arc::clone(self);
        let reader_id = id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(envelope) = decode_envelope(&line) {
                    if let Some(envelope) = reader_self.bus.dispatch_inbound(envelope).await {
                        reader_self.handle_inbound(&reader_id, envelope);
                    }
                }
            }
        });

        // Monitor task: waits for exit (or a kill switch) and drives the
        // dead → starting respawn edge.
        let (kill_tx, kill_rx) = oneshot::channel();
        self.kill_switches
            .lock()
            .await
            .insert(id.to_string(), kill_tx);
        let monitor_self = Arc::clone(self);
        let monitor_id = id.to_string();
        tokio::spawn(async move {
            monitor_self.monitor_worker(monitor_id, child, kill_rx, port).await;
        });

        Ok(())
        })
    }

    async fn monitor_worker(
        self: Arc<Self>,
        id: String,
        mut child: Child,
        kill_rx: oneshot::Receiver<()>,
        port: u16,
    ) {
        let status = tokio::select! {
            status = child.wait() => status.ok(),
            _ = kill_rx => {
                let _ = child.start_kill();
                child.wait().await.ok()
            }
        };
        let code = status.and_then(|s| s.code());
        self.bus.remove_peer(&id);
        self.kill_switches.lock().await.remove(&id);

        let restart_count = {
            let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
            match workers.get_mut(&id) {
                Some(w) => {
                    // Exit can arrive from any state; route through
                    // stopping so the machine stays on declared edges.
                    if w.state.is_serving() || w.state == WorkerState::Starting {
                        let _ = w.transition(WorkerState::Stopping);
                    }
                    let _ = w.transition(WorkerState::Dead);
                    w.pid = None;
                    w.restart_count
                }
                None => return,
            }
        };
        self.emit(SupervisorEvent::WorkerExited {
            id: id.clone(),
            code,
        });

        let pm = &self.config.cluster.process_management;
        let should_respawn = pm.respawn
            && !self.shutting_down.load(Ordering::SeqCst)
            && self.bus.is_enabled()
            && restart_count < pm.max_restarts;
        if !should_respawn {
            info!("cluster: worker {} will not be respawned", id);
            return;
        }

        let attempt = restart_count + 1;
        let backoff = Duration::from_millis(pm.restart_delay_ms * attempt as u64);
        self.emit(SupervisorEvent::WorkerRestarting {
            id: id.clone(),
            attempt,
        });
        info!(
            "cluster: respawning {} in {}ms (attempt {}/{})",
            id,
            backoff.as_millis(),
            attempt,
            pm.max_restarts
        );
        tokio::time::sleep(backoff).await;
        {
            let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
            if let Some(w) = workers.get_mut(&id) {
                let _ = w.transition(WorkerState::Starting);
            }
        }
        if let Err(e) = self.spawn_worker(&id, port, attempt).await {
            error!("cluster: respawn of {} failed: {}", id, e);
        }
    }

    /// Inbound non-RPC traffic from one worker.
    fn handle_inbound(&self, worker_id: &str, envelope: IpcEnvelope) {
        match envelope.kind {
            IpcKind::Ready => {
                let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
                if let Some(w) = workers.get_mut(worker_id) {
                    if w.transition(WorkerState::Alive).is_ok() {
                        drop(workers);
                        self.emit(SupervisorEvent::WorkerReady {
                            id: worker_id.to_string(),
                        });
                    }
                }
            }
            IpcKind::Heartbeat => {
                let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
                if let Some(w) = workers.get_mut(worker_id) {
                    w.last_heartbeat = Some(Instant::now());
                }
            }
            IpcKind::Metrics => {
                if let Ok(metrics) =
                    serde_json::from_value::<WorkerMetrics>(envelope.payload.clone())
                {
                    if metrics.inflight > 0 {
                        *self.last_busy.write().unwrap_or_else(|e| e.into_inner()) =
                            Instant::now();
                    }
                    let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
                    if let Some(w) = workers.get_mut(worker_id) {
                        w.metrics = metrics;
                        w.last_heartbeat = Some(Instant::now());
                    }
                }
            }
            IpcKind::AppMessage => {
                debug!("app message from {}: {}", worker_id, envelope.payload);
            }
            IpcKind::RpcRequest => {
                // Workers may query the supervisor; answer with the
                // cluster roster.
                let roster = self.descriptor_snapshot();
                let ids: Vec<String> = roster.iter().map(|w| w.id.clone()).collect();
                let reply = envelope.reply("parent", json!({ "workers": ids }));
                let _ = self.bus.send_envelope(worker_id, reply);
            }
            other => debug!("unhandled inbound kind {:?} from {}", other, worker_id),
        }
    }

    /// Readiness: a `ready` envelope, or one second of process stability,
    /// whichever comes first — bounded by the per-worker timeout.
    async fn wait_ready(&self, id: &str) -> Result<(), AppError> {
        let deadline =
            Instant::now() + Duration::from_millis(self.config.cluster.worker_start_timeout_ms);
        let stable_at = Instant::now() + Duration::from_secs(1);
        loop {
            let state = {
                let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
                workers.get(id).map(|w| w.state)
            };
            match state {
                Some(WorkerState::Alive) => return Ok(()),
                Some(WorkerState::Dead) | None => {
                    self.emit(SupervisorEvent::WorkerStartupFailed {
                        id: id.to_string(),
                        reason: "exited before becoming ready".to_string(),
                    });
                    return Err(AppError::WorkerStartup {
                        worker_id: id.to_string(),
                        reason: "worker exited during startup".to_string(),
                    });
                }
                Some(WorkerState::Starting) if Instant::now() >= stable_at => {
                    // Alive for a second without exiting counts as ready.
                    let mut workers =
                        self.workers.write().unwrap_or_else(|e| e.into_inner());
                    if let Some(w) = workers.get_mut(id) {
                        let _ = w.transition(WorkerState::Alive);
                    }
                    drop(workers);
                    self.emit(SupervisorEvent::WorkerReady { id: id.to_string() });
                    return Ok(());
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                self.emit(SupervisorEvent::WorkerStartupFailed {
                    id: id.to_string(),
                    reason: "readiness timeout".to_string(),
                });
                return Err(AppError::WorkerStartup {
                    worker_id: id.to_string(),
                    reason: format!(
                        "not ready within {}ms",
                        self.config.cluster.worker_start_timeout_ms
                    ),
                });
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Periodic HTTP health probes against each serving worker.
    fn start_health_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let interval = Duration::from_millis(this.config.cluster.health_check.interval_ms);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if this.shutting_down.load(Ordering::SeqCst) || !this.bus.is_enabled() {
                    return;
                }
                this.probe_all().await;
            }
        });
    }

    async fn probe_all(self: &Arc<Self>) {
        let targets: Vec<(String, u16)> = {
            let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
            workers
                .values()
                .filter(|w| w.state.is_serving())
                .map(|w| (w.id.clone(), w.port))
                .collect()
        };
        let timeout = Duration::from_millis(self.config.cluster.health_check.timeout_ms);
        let max_failures = self.config.cluster.health_check.max_failures;

        for (id, port) in targets {
            let url = format!("http://127.0.0.1:{}/health", port);
            let healthy = self
                .http
                .get(&url)
                .timeout(timeout)
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false);

            let changed = {
                let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
                let Some(w) = workers.get_mut(&id) else { continue };
                if healthy {
                    w.consecutive_probe_failures = 0;
                    if w.state == WorkerState::Degraded {
                        let _ = w.transition(WorkerState::Alive);
                        Some(WorkerState::Alive)
                    } else {
                        None
                    }
                } else {
                    w.consecutive_probe_failures += 1;
                    if w.state == WorkerState::Alive
                        && w.consecutive_probe_failures >= max_failures
                    {
                        let _ = w.transition(WorkerState::Degraded);
                        Some(WorkerState::Degraded)
                    } else {
                        None
                    }
                }
            };
            if let Some(state) = changed {
                warn!("cluster: worker {} is now {:?}", id, state);
                self.emit(SupervisorEvent::WorkerHealth { id, state });
            }
        }
    }

    fn start_scaling_loop(self: &Arc<Self>) {
        if !self.config.cluster.auto_scaling.enabled {
            return;
        }
        let this = Arc::clone(self);
        let scaler = AutoScaler::new(self.config.cluster.auto_scaling.clone());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scaler.check_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if this.shutting_down.load(Ordering::SeqCst) || !this.bus.is_enabled() {
                    return;
                }
                let metrics = this.aggregate_metrics();
                scaler.tick(&metrics, &this).await;
            }
        });
    }

    /// Folds the latest worker reports into one cluster sample.
    pub fn aggregate_metrics(&self) -> ClusterMetrics {
        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        let serving: Vec<&WorkerDescriptor> =
            workers.values().filter(|w| w.state.is_serving()).collect();
        if serving.is_empty() {
            return ClusterMetrics::default();
        }
        let n = serving.len() as f64;
        let total_requests: u64 = serving.iter().map(|w| w.metrics.requests_total).sum();
        let total_errors: u64 = serving.iter().map(|w| w.metrics.errors_total).sum();
        ClusterMetrics {
            avg_cpu_pct: serving.iter().map(|w| w.metrics.cpu_pct).sum::<f64>() / n,
            avg_mem_pct: serving.iter().map(|w| w.metrics.mem_pct).sum::<f64>() / n,
            avg_response_time_ms: serving
                .iter()
                .map(|w| w.metrics.avg_response_time_ms)
                .sum::<f64>()
                / n,
            queue_len: serving.iter().map(|w| w.metrics.inflight as f64).sum(),
            error_rate: if total_requests > 0 {
                total_errors as f64 / total_requests as f64
            } else {
                0.0
            },
            active_workers: serving.len(),
            idle_secs: self
                .last_busy
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .elapsed()
                .as_secs_f64(),
        }
    }

    /// Stable snapshot of the worker roster.
    pub fn descriptor_snapshot(&self) -> Vec<WorkerDescriptor> {
        self.workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Asks one worker to stop and escalates to a kill after the
    /// graceful timeout.
    async fn stop_worker(&self, id: &str) {
        {
            let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
            if let Some(w) = workers.get_mut(id) {
                if w.transition(WorkerState::Stopping).is_err() {
                    return;
                }
            } else {
                return;
            }
        }
        let _ = self.bus.send_to(id, IpcKind::Shutdown, json!({}));

        let graceful = Duration::from_millis(
            self.config
                .cluster
                .process_management
                .graceful_shutdown_timeout_ms,
        );
        let deadline = Instant::now() + graceful;
        loop {
            let dead = {
                let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
                workers
                    .get(id)
                    .map(|w| w.state == WorkerState::Dead)
                    .unwrap_or(true)
            };
            if dead {
                return;
            }
            if Instant::now() >= deadline {
                warn!("cluster: killing {} after graceful timeout", id);
                if let Some(kill) = self.kill_switches.lock().await.remove(id) {
                    let _ = kill.send(());
                }
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn kill_all(&self) {
        let ids: Vec<String> = {
            let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
            workers.keys().cloned().collect()
        };
        let mut switches = self.kill_switches.lock().await;
        for id in ids {
            if let Some(kill) = switches.remove(&id) {
                let _ = kill.send(());
            }
        }
    }

    /// Broadcasts a configuration snapshot to every worker.
    pub fn push_config_update(&self, config: &ServerConfig) -> Result<(), AppError> {
        let payload = serde_json::to_value(config).map_err(|e| AppError::Config {
            message: format!("cannot serialize config update: {}", e),
        })?;
        self.bus.broadcast(IpcKind::ConfigUpdate, payload)
    }

    /// Graceful cluster shutdown: stop every worker in parallel.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        info!("cluster: shutting down workers");
        let ids: Vec<String> = {
            let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
            workers.keys().cloned().collect()
        };
        let stops = ids.iter().map(|id| self.stop_worker(id));
        futures::future::join_all(stops).await;
        info!("cluster: all workers stopped");
    }
}

#[async_trait]
impl ScaleExecutor for Arc<ClusterSupervisor> {
    async fn scale_up(&self, step: usize) -> Result<(), AppError> {
        for _ in 0..step {
            self.spawn_next_worker().await?;
        }
        self.emit(SupervisorEvent::ScalingExecuted { up: true, step });
        Ok(())
    }

    async fn scale_down(&self, step: usize) -> Result<(), AppError> {
        // Retire the highest-ordinal serving workers.
        let mut targets: Vec<(usize, String)> = {
            let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
            workers
                .values()
                .filter(|w| w.state.is_serving())
                .filter_map(|w| {
                    w.id.rsplit('-')
                        .next()
                        .and_then(|n| n.parse::<usize>().ok())
                        .map(|ord| (ord, w.id.clone()))
                })
                .collect()
        };
        targets.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, id) in targets.into_iter().take(step) {
            self.stop_worker(&id).await;
        }
        self.emit(SupervisorEvent::ScalingExecuted { up: false, step });
        Ok(())
    }
}
