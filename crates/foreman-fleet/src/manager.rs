//! Fleet ownership and the blue/green policy: at most one active proxy, at
//! most one canary, and a bounded executor pool.

use crate::launch::{WorkerLauncher, WorkerSpawnSpec};
use crate::proxy::{ProxyStatus, WorkerProxy};
use chrono::{DateTime, Utc};
use foreman_core::{
    ExecutionMode, ForemanConfig, ForemanError, ForemanResult, JsonTelemetrySink, RingBuffer,
    WorkerRole, MAX_EXECUTORS,
};
use futures_util::future::join_all;
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Options for `start_active` / `start_canary`.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Execution mode override. Active defaults to `Mutating`, canary to
    /// `ReadOnly`.
    pub mode: Option<ExecutionMode>,
    /// Explicit override for the active-mutation invariant. Without it,
    /// starting an active worker in `ReadOnly` mode fails before spawning.
    pub allow_read_only_active: bool,
    pub feature_flags: Vec<String>,
    /// Self-disposal deadline, typically set for canaries.
    pub idle_timeout: Option<Duration>,
}

/// What happened in the fleet, kept in a bounded ring (evicted only by
/// capacity).
#[derive(Debug, Clone, Serialize)]
pub struct FleetEvent {
    pub kind: FleetEventKind,
    pub label: String,
    pub role: Option<WorkerRole>,
    pub pid: Option<u32>,
    pub detail: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetEventKind {
    Spawned,
    Ready,
    /// Unexpected termination. Deliberate teardown records `Disposed`.
    Exited,
    Disposed,
    Switched,
    Error,
}

/// Per-proxy view inside a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyInfo {
    pub label: String,
    pub role: WorkerRole,
    pub mode: ExecutionMode,
    pub pid: Option<u32>,
    pub status: ProxyStatus,
    pub spawned_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub version: Option<String>,
    pub flags: Vec<String>,
    /// `None` when no health check ran (proxy not ready).
    pub healthy: Option<bool>,
    pub last_health_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

/// Aggregate fleet health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FleetStatus {
    Healthy,
    Degraded,
}

/// Point-in-time view of the whole fleet, rebuilt on demand and persisted
/// best-effort.
#[derive(Debug, Clone, Serialize)]
pub struct FleetSnapshot {
    pub at: DateTime<Utc>,
    pub status: FleetStatus,
    /// Why the fleet is degraded; empty when healthy.
    pub notes: Vec<String>,
    pub active: Option<ProxyInfo>,
    pub canary: Option<ProxyInfo>,
    pub executors: Vec<ProxyInfo>,
    pub desired_executors: usize,
    pub events: Vec<FleetEvent>,
}

/// Result of a successful canary promotion.
#[derive(Debug, Clone, Serialize)]
pub struct SwitchReport {
    pub previous_pid: Option<u32>,
    pub promoted_pid: Option<u32>,
    pub at: DateTime<Utc>,
}

/// Owns the worker fleet: one active, at most one canary, and an executor
/// pool reconciled to the desired size. All role→proxy state lives on this
/// instance; there are no process-wide registries.
pub struct WorkerManager {
    config: ForemanConfig,
    launcher: Arc<dyn WorkerLauncher>,
    telemetry: Option<Arc<JsonTelemetrySink>>,
    active: RwLock<Option<Arc<WorkerProxy>>>,
    canary: RwLock<Option<Arc<WorkerProxy>>>,
    /// Role reservations while a worker is still starting, so the slot locks
    /// are never held across the readiness wait.
    active_starting: AtomicBool,
    canary_starting: AtomicBool,
    executors: RwLock<Vec<Arc<WorkerProxy>>>,
    cursor: AtomicUsize,
    desired_executors: AtomicUsize,
    executor_seq: AtomicU64,
    events: Arc<SyncMutex<RingBuffer<FleetEvent>>>,
    reconcile_tx: mpsc::UnboundedSender<()>,
    reconcile_rx: SyncMutex<Option<mpsc::UnboundedReceiver<()>>>,
    background: SyncMutex<Option<JoinHandle<()>>>,
}

impl WorkerManager {
    pub fn new(config: ForemanConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let (reconcile_tx, reconcile_rx) = mpsc::unbounded_channel();
        let desired = config.desired_executors.min(MAX_EXECUTORS);
        let event_capacity = config.event_capacity;
        Self {
            config,
            launcher,
            telemetry: None,
            active: RwLock::new(None),
            canary: RwLock::new(None),
            active_starting: AtomicBool::new(false),
            canary_starting: AtomicBool::new(false),
            executors: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            desired_executors: AtomicUsize::new(desired),
            executor_seq: AtomicU64::new(0),
            events: Arc::new(SyncMutex::new(RingBuffer::new(event_capacity))),
            reconcile_tx,
            reconcile_rx: SyncMutex::new(Some(reconcile_rx)),
            background: SyncMutex::new(None),
        }
    }

    /// Persist snapshots to this sink (best-effort).
    pub fn with_telemetry(mut self, sink: Arc<JsonTelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    /// Start the active worker, wait for readiness, then reconcile the
    /// executor pool.
    ///
    /// Hard invariant: an active worker never runs with mutations disabled.
    /// A `ReadOnly` request without `allow_read_only_active` fails before
    /// anything is spawned.
    pub async fn start_active(&self, opts: StartOptions) -> ForemanResult<Arc<WorkerProxy>> {
        let mode = opts.mode.unwrap_or(ExecutionMode::Mutating);
        if mode == ExecutionMode::ReadOnly && !opts.allow_read_only_active {
            return Err(ForemanError::UnsafeMutationMode);
        }

        let spec = WorkerSpawnSpec {
            label: "active".to_string(),
            role: WorkerRole::Active,
            mode,
            feature_flags: opts.feature_flags,
            startup_deadline: self.config.startup_deadline(),
            idle_timeout: None,
        };
        let proxy = self
            .start_into_slot(&self.active, &self.active_starting, spec)
            .await?;

        self.reconcile_executors().await;
        Ok(proxy)
    }

    /// Start a canary worker alongside the active one. Defaults to
    /// `ReadOnly` so a candidate build can answer health/plan-shaped calls
    /// without touching shared state.
    pub async fn start_canary(&self, opts: StartOptions) -> ForemanResult<Arc<WorkerProxy>> {
        let spec = WorkerSpawnSpec {
            label: "canary".to_string(),
            role: WorkerRole::Canary,
            mode: opts.mode.unwrap_or(ExecutionMode::ReadOnly),
            feature_flags: opts.feature_flags,
            startup_deadline: self.config.startup_deadline(),
            idle_timeout: opts.idle_timeout,
        };
        self.start_into_slot(&self.canary, &self.canary_starting, spec)
            .await
    }

    /// Reserve a single-occupancy role, start the worker, then store it.
    ///
    /// The reservation flag makes a concurrent second start a `DuplicateRole`
    /// while the slot lock itself is only taken to store the ready proxy, so
    /// accessors and snapshots stay responsive through a cold start.
    async fn start_into_slot(
        &self,
        slot: &RwLock<Option<Arc<WorkerProxy>>>,
        starting: &AtomicBool,
        spec: WorkerSpawnSpec,
    ) -> ForemanResult<Arc<WorkerProxy>> {
        if slot.read().await.is_some() || starting.swap(true, Ordering::SeqCst) {
            return Err(ForemanError::DuplicateRole(spec.role));
        }

        let result = self.start_worker(&spec).await;
        if let Ok(proxy) = &result {
            *slot.write().await = Some(Arc::clone(proxy));
        }
        starting.store(false, Ordering::SeqCst);
        result
    }

    /// Atomically promote the canary to active, disposing the previous
    /// active worker. The only path by which the active role changes.
    pub async fn switch_to_canary(&self) -> ForemanResult<SwitchReport> {
        let mut canary_slot = self.canary.write().await;
        let promoted = match canary_slot.as_ref() {
            Some(c) if c.is_ready() => Arc::clone(c),
            _ => return Err(ForemanError::NoReadyCanary),
        };
        *canary_slot = None;
        drop(canary_slot);

        if promoted.mode() == ExecutionMode::ReadOnly {
            warn!(
                label = %promoted.label(),
                pid = ?promoted.pid(),
                "promoting a read-only canary to active"
            );
        }

        let previous = {
            let mut active_slot = self.active.write().await;
            active_slot.replace(Arc::clone(&promoted))
        };
        let previous_pid = previous.as_ref().and_then(|p| p.pid());
        if let Some(prev) = previous {
            prev.dispose().await;
            self.record_event(
                FleetEventKind::Disposed,
                prev.label(),
                Some(prev.role()),
                prev.pid(),
                "previous active disposed on switch",
            );
        }

        let report = SwitchReport {
            previous_pid,
            promoted_pid: promoted.pid(),
            at: Utc::now(),
        };
        self.record_event(
            FleetEventKind::Switched,
            promoted.label(),
            Some(WorkerRole::Active),
            promoted.pid(),
            "canary promoted to active",
        );
        Ok(report)
    }

    /// Bring the executor pool to the desired size: prune dead proxies,
    /// dispose excess, spawn missing. No-op while no active worker exists.
    /// Desired 0 drains the pool. Resets the round-robin cursor on any size
    /// change.
    pub async fn reconcile_executors(&self) -> usize {
        if self.active.read().await.is_none() {
            return 0;
        }
        let desired = self.desired_executors.load(Ordering::Relaxed).min(MAX_EXECUTORS);

        let mut pool = self.executors.write().await;
        let before = pool.len();
        pool.retain(|p| !p.status().is_terminal());

        while pool.len() > desired {
            if let Some(proxy) = pool.pop() {
                proxy.dispose().await;
                self.record_event(
                    FleetEventKind::Disposed,
                    proxy.label(),
                    Some(WorkerRole::Executor),
                    proxy.pid(),
                    "executor disposed: pool over desired size",
                );
            }
        }

        while pool.len() < desired {
            let seq = self.executor_seq.fetch_add(1, Ordering::Relaxed) + 1;
            let spec = WorkerSpawnSpec {
                label: format!("executor-{seq}"),
                role: WorkerRole::Executor,
                // Executors always run with mutations enabled.
                mode: ExecutionMode::Mutating,
                feature_flags: Vec::new(),
                startup_deadline: self.config.startup_deadline(),
                idle_timeout: None,
            };
            match self.start_worker(&spec).await {
                Ok(proxy) => pool.push(proxy),
                Err(e) => {
                    warn!(label = %spec.label, error = %e, "executor spawn failed");
                    break;
                }
            }
        }

        if pool.len() != before {
            self.cursor.store(0, Ordering::Relaxed);
        }
        pool.len()
    }

    /// Change the desired executor pool size (clamped) and reconcile.
    pub async fn set_desired_executors(&self, count: usize) -> usize {
        self.desired_executors
            .store(count.min(MAX_EXECUTORS), Ordering::Relaxed);
        self.reconcile_executors().await
    }

    pub async fn get_active(&self) -> Option<Arc<WorkerProxy>> {
        self.active.read().await.clone()
    }

    pub async fn get_canary(&self) -> Option<Arc<WorkerProxy>> {
        self.canary.read().await.clone()
    }

    /// Round-robin over ready executors only. `None` when none are ready —
    /// callers fall back to the active proxy.
    pub async fn get_executor(&self) -> Option<Arc<WorkerProxy>> {
        let pool = self.executors.read().await;
        let ready: Vec<&Arc<WorkerProxy>> = pool.iter().filter(|p| p.is_ready()).collect();
        if ready.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % ready.len();
        Some(Arc::clone(ready[idx]))
    }

    /// Health-check every proxy concurrently (bounded per-check timeout,
    /// failures recorded never thrown) and compute the aggregate status.
    /// Persisted best-effort when a telemetry sink is configured.
    pub async fn snapshot(&self) -> FleetSnapshot {
        let active = self.get_active().await;
        let canary = self.get_canary().await;
        let executors: Vec<Arc<WorkerProxy>> = self.executors.read().await.clone();
        let timeout = self.config.health_check_timeout();

        let (active_info, canary_info, executor_infos) = tokio::join!(
            async {
                match &active {
                    Some(p) => Some(check_proxy(p, timeout).await),
                    None => None,
                }
            },
            async {
                match &canary {
                    Some(p) => Some(check_proxy(p, timeout).await),
                    None => None,
                }
            },
            join_all(executors.iter().map(|p| check_proxy(p, timeout))),
        );

        let desired = self.desired_executors.load(Ordering::Relaxed).min(MAX_EXECUTORS);
        let now = Utc::now();
        let mut notes = Vec::new();

        match &active_info {
            None => notes.push("no active worker".to_string()),
            Some(info) => {
                if info.status != ProxyStatus::Ready {
                    notes.push(format!("active worker is {}", info.status));
                } else if info.healthy == Some(false) {
                    notes.push("active worker failed its health check".to_string());
                    // last_health_at only moves on success, so it dates the
                    // last good reading.
                    let fresh = info
                        .last_health_at
                        .is_some_and(|at| now - at <= chrono::Duration::minutes(5));
                    if !fresh {
                        notes.push("active worker health data is stale".to_string());
                    }
                }
            }
        }

        let recent_exit = self
            .events
            .lock()
            .iter()
            .any(|e| e.kind == FleetEventKind::Exited && now - e.at < chrono::Duration::minutes(10));
        if recent_exit {
            notes.push("worker exit within the last 10 minutes".to_string());
        }

        if active_info.is_some() && desired > 0 {
            let healthy_executors = executor_infos
                .iter()
                .filter(|i| i.status == ProxyStatus::Ready && i.healthy != Some(false))
                .count();
            if healthy_executors < desired {
                notes.push(format!(
                    "executor pool undersized: {healthy_executors}/{desired} healthy"
                ));
            }
        }

        let status = if notes.is_empty() {
            FleetStatus::Healthy
        } else {
            FleetStatus::Degraded
        };

        let snapshot = FleetSnapshot {
            at: now,
            status,
            notes,
            active: active_info,
            canary: canary_info,
            executors: executor_infos,
            desired_executors: desired,
            events: self.events.lock().to_vec(),
        };

        if let Some(sink) = &self.telemetry {
            if let Err(e) = sink.write_record("snapshot", &snapshot).await {
                warn!(error = %e, "failed to persist fleet snapshot");
            }
        }

        snapshot
    }

    /// Run periodic snapshots (independent of callers) and service
    /// exit-driven reconcile requests. Idempotent.
    pub fn start_background(self: &Arc<Self>) {
        let mut guard = self.background.lock();
        if guard.is_some() {
            return;
        }
        let Some(mut reconcile_rx) = self.reconcile_rx.lock().take() else {
            return;
        };
        let manager = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(manager.config.snapshot_interval());
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            timer.tick().await; // the immediate first tick
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let _ = manager.snapshot().await;
                        manager.reconcile_executors().await;
                    }
                    msg = reconcile_rx.recv() => match msg {
                        Some(()) => {
                            manager.reconcile_executors().await;
                        }
                        None => break,
                    }
                }
            }
        }));
    }

    /// Stop the background loop, take one final best-effort snapshot, then
    /// dispose every proxy.
    pub async fn stop_all(&self) {
        if let Some(handle) = self.background.lock().take() {
            handle.abort();
        }
        let _ = self.snapshot().await;

        if let Some(canary) = self.canary.write().await.take() {
            canary.dispose().await;
        }
        if let Some(active) = self.active.write().await.take() {
            active.dispose().await;
        }
        let executors: Vec<Arc<WorkerProxy>> =
            self.executors.write().await.drain(..).collect();
        for proxy in executors {
            proxy.dispose().await;
        }
        info!("worker fleet stopped");
    }

    /// The newest `limit` fleet events, newest first.
    pub fn recent_events(&self, limit: usize) -> Vec<FleetEvent> {
        self.events.lock().recent(limit).into_iter().cloned().collect()
    }

    /// Launch + readiness + event bookkeeping shared by every start path.
    async fn start_worker(&self, spec: &WorkerSpawnSpec) -> ForemanResult<Arc<WorkerProxy>> {
        let proxy = self.launcher.launch(spec).await.map_err(|e| {
            self.record_event(
                FleetEventKind::Error,
                &spec.label,
                Some(spec.role),
                None,
                format!("spawn failed: {e}"),
            );
            e
        })?;
        self.record_event(
            FleetEventKind::Spawned,
            proxy.label(),
            Some(proxy.role()),
            proxy.pid(),
            "worker spawned",
        );

        if let Err(e) = proxy.wait_ready().await {
            self.record_event(
                FleetEventKind::Error,
                proxy.label(),
                Some(proxy.role()),
                proxy.pid(),
                format!("worker failed to start: {e}"),
            );
            proxy.dispose().await;
            return Err(e);
        }

        self.record_event(
            FleetEventKind::Ready,
            proxy.label(),
            Some(proxy.role()),
            proxy.pid(),
            "worker ready",
        );
        self.watch_exit(Arc::clone(&proxy));
        Ok(proxy)
    }

    /// Record the terminal transition of a proxy and request reconciliation.
    fn watch_exit(&self, proxy: Arc<WorkerProxy>) {
        let events = Arc::clone(&self.events);
        let reconcile_tx = self.reconcile_tx.clone();
        tokio::spawn(async move {
            proxy.wait_terminal().await;
            let kind = if proxy.status() == ProxyStatus::Failed {
                FleetEventKind::Exited
            } else {
                FleetEventKind::Disposed
            };
            let detail = proxy
                .last_exit()
                .map(|e| e.reason)
                .unwrap_or_else(|| "unknown".to_string());
            info!(
                label = %proxy.label(),
                role = %proxy.role(),
                pid = ?proxy.pid(),
                detail = %detail,
                "worker reached terminal state"
            );
            events.lock().push(FleetEvent {
                kind,
                label: proxy.label().to_string(),
                role: Some(proxy.role()),
                pid: proxy.pid(),
                detail,
                at: Utc::now(),
            });
            let _ = reconcile_tx.send(());
        });
    }

    fn record_event(
        &self,
        kind: FleetEventKind,
        label: &str,
        role: Option<WorkerRole>,
        pid: Option<u32>,
        detail: impl Into<String>,
    ) {
        let detail = detail.into();
        info!(?kind, label, pid = ?pid, detail = %detail, "fleet event");
        self.events.lock().push(FleetEvent {
            kind,
            label: label.to_string(),
            role,
            pid,
            detail,
            at: Utc::now(),
        });
    }
}

async fn check_proxy(proxy: &Arc<WorkerProxy>, timeout: Duration) -> ProxyInfo {
    let mut note = None;
    let healthy = if proxy.is_ready() {
        match proxy.check_health(timeout).await {
            Ok(_) => Some(true),
            Err(e) => {
                note = Some(format!("health check failed: {e}"));
                Some(false)
            }
        }
    } else {
        note = Some(format!("no health data: worker is {}", proxy.status()));
        None
    };

    let ready_info = proxy.ready_info();
    ProxyInfo {
        label: proxy.label().to_string(),
        role: proxy.role(),
        mode: proxy.mode(),
        pid: proxy.pid(),
        status: proxy.status(),
        spawned_at: proxy.spawned_at(),
        ready_at: proxy.ready_at(),
        version: ready_info.version,
        flags: ready_info.flags,
        healthy,
        last_health_at: proxy.last_health().map(|h| h.at),
        note,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Launcher that records attempts and always fails. Good enough for the
    /// pre-spawn rejection paths; the full fleet scenarios live in the
    /// integration tests with a scripted transport.
    struct FailingLauncher {
        attempts: AtomicUsize,
    }

    impl FailingLauncher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                attempts: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl WorkerLauncher for FailingLauncher {
        async fn launch(&self, _spec: &WorkerSpawnSpec) -> ForemanResult<Arc<WorkerProxy>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(ForemanError::Io(std::io::Error::other("no such worker")))
        }
    }

    fn config() -> ForemanConfig {
        ForemanConfig::default()
    }

    #[tokio::test]
    async fn test_read_only_active_rejected_before_spawn() {
        let launcher = FailingLauncher::new();
        let manager = WorkerManager::new(config(), launcher.clone());

        let err = manager
            .start_active(StartOptions {
                mode: Some(ExecutionMode::ReadOnly),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ForemanError::UnsafeMutationMode));
        // The invariant is checked before anything is spawned.
        assert_eq!(launcher.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_switch_without_canary_fails_without_mutation() {
        let manager = WorkerManager::new(config(), FailingLauncher::new());
        let err = manager.switch_to_canary().await.unwrap_err();
        assert!(matches!(err, ForemanError::NoReadyCanary));
        assert!(manager.get_active().await.is_none());
        assert!(manager.get_canary().await.is_none());
    }

    #[tokio::test]
    async fn test_reconcile_noop_without_active() {
        let launcher = FailingLauncher::new();
        let manager = WorkerManager::new(config(), launcher.clone());
        let count = manager.set_desired_executors(4).await;
        assert_eq!(count, 0);
        assert_eq!(launcher.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_get_executor_none_when_pool_empty() {
        let manager = WorkerManager::new(config(), FailingLauncher::new());
        assert!(manager.get_executor().await.is_none());
    }

    #[tokio::test]
    async fn test_failed_spawn_recorded_in_events() {
        let manager = WorkerManager::new(config(), FailingLauncher::new());
        let _ = manager.start_active(StartOptions::default()).await;
        let events = manager.recent_events(10);
        assert!(events
            .iter()
            .any(|e| e.kind == FleetEventKind::Error && e.label == "active"));
    }

    #[tokio::test]
    async fn test_snapshot_without_workers_is_degraded() {
        let manager = WorkerManager::new(config(), FailingLauncher::new());
        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.status, FleetStatus::Degraded);
        assert!(snapshot.notes.iter().any(|n| n.contains("no active worker")));
        assert!(snapshot.active.is_none());
        assert!(snapshot.executors.is_empty());
    }
}
