//! Per-worker proxy: owns one worker process and implements the call
//! protocol, readiness gating, timeouts, and disposal.

use crate::protocol::{ExitRecord, ReadyInfo, WireError, WorkerMessage, WorkerRequest};
use chrono::{DateTime, Utc};
use foreman_core::{ExecutionMode, ForemanError, ForemanResult, WorkerRole};
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

const STARTUP_TIMEOUT_REASON: &str = "startup deadline exceeded";

/// Lifecycle state of a proxy, published over a watch channel so callers can
/// await transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyStatus {
    Starting,
    Ready,
    Stopped,
    Failed,
}

impl ProxyStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProxyStatus::Stopped | ProxyStatus::Failed)
    }
}

impl std::fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyStatus::Starting => write!(f, "starting"),
            ProxyStatus::Ready => write!(f, "ready"),
            ProxyStatus::Stopped => write!(f, "stopped"),
            ProxyStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Construction parameters for a proxy.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub label: String,
    pub role: WorkerRole,
    pub mode: ExecutionMode,
    /// How long the worker has to report readiness after spawn.
    pub startup_deadline: Duration,
    /// When set, the proxy disposes itself after this much inactivity.
    /// Used for ephemeral/canary workers.
    pub idle_timeout: Option<Duration>,
}

/// The most recent health payload a worker returned.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReading {
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

struct PendingCall {
    tx: oneshot::Sender<ForemanResult<serde_json::Value>>,
    method: String,
    started: Instant,
}

/// Owns exactly one worker process (or an in-memory transport in tests).
///
/// Every call awaits the worker's one-time readiness signal before it is
/// sent. Each pending call resolves exactly once: with the worker's
/// response, a per-call timeout, or a process-exit error when the worker
/// terminates. Disposal is idempotent and drains everything outstanding.
pub struct WorkerProxy {
    label: String,
    role: WorkerRole,
    mode: ExecutionMode,
    pid: Option<u32>,
    spawned_at: DateTime<Utc>,
    spawn_instant: Instant,
    startup_deadline: Duration,
    status_tx: watch::Sender<ProxyStatus>,
    next_id: AtomicU64,
    disposed: AtomicBool,
    pending: Mutex<HashMap<u64, PendingCall>>,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    child: Mutex<Option<Child>>,
    ready_info: SyncMutex<ReadyInfo>,
    ready_at: SyncMutex<Option<DateTime<Utc>>>,
    last_health: SyncMutex<Option<HealthReading>>,
    last_exit: SyncMutex<Option<ExitRecord>>,
    last_activity: SyncMutex<Instant>,
}

impl std::fmt::Debug for WorkerProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProxy")
            .field("label", &self.label)
            .field("role", &self.role)
            .field("mode", &self.mode)
            .field("pid", &self.pid)
            .field("spawned_at", &self.spawned_at)
            .finish_non_exhaustive()
    }
}

impl WorkerProxy {
    /// Spawn a worker process and attach a proxy to its stdio.
    pub fn spawn(
        options: ProxyOptions,
        entry_point: &Path,
        env: &[(String, String)],
    ) -> ForemanResult<Arc<Self>> {
        let mut cmd = Command::new(entry_point);
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        for (key, val) in env {
            cmd.env(key, val);
        }

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("worker stdin not available"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("worker stdout not available"))?;
        let pid = child.id();

        info!(
            label = %options.label,
            role = %options.role,
            mode = %options.mode,
            pid = ?pid,
            "worker process spawned"
        );

        let proxy = Self::from_transport(options, pid, stdout, stdin);
        if let Ok(mut guard) = proxy.child.try_lock() {
            *guard = Some(child);
        }
        Ok(proxy)
    }

    /// Attach a proxy to an arbitrary transport. This is how tests drive the
    /// protocol over `tokio::io::duplex` without real processes.
    pub fn from_transport<R, W>(
        options: ProxyOptions,
        pid: Option<u32>,
        reader: R,
        writer: W,
    ) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (status_tx, _) = watch::channel(ProxyStatus::Starting);
        let idle_timeout = options.idle_timeout;

        let proxy = Arc::new(Self {
            label: options.label,
            role: options.role,
            mode: options.mode,
            pid,
            spawned_at: Utc::now(),
            spawn_instant: Instant::now(),
            startup_deadline: options.startup_deadline,
            status_tx,
            next_id: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            writer: Mutex::new(Box::new(writer)),
            child: Mutex::new(None),
            ready_info: SyncMutex::new(ReadyInfo::default()),
            ready_at: SyncMutex::new(None),
            last_health: SyncMutex::new(None),
            last_exit: SyncMutex::new(None),
            last_activity: SyncMutex::new(Instant::now()),
        });

        let reader_proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            reader_proxy.read_loop(reader).await;
        });

        if let Some(idle) = idle_timeout {
            proxy.spawn_idle_watchdog(idle);
        }

        proxy
    }

    /// Send `method` to the worker and await its response.
    ///
    /// Waits for readiness first, so a call issued before the handshake
    /// proceeds once the worker is ready (or fails after the startup
    /// deadline). On timeout the pending entry is dropped and a late
    /// response for that id is ignored.
    pub async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> ForemanResult<serde_json::Value> {
        self.wait_ready().await?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = serde_json::to_string(&WorkerRequest {
            id,
            method: method.to_string(),
            params,
        })?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            id,
            PendingCall {
                tx,
                method: method.to_string(),
                started: Instant::now(),
            },
        );
        *self.last_activity.lock() = Instant::now();

        debug!(
            label = %self.label,
            role = %self.role,
            method,
            id,
            pid = ?self.pid,
            timeout_ms = timeout.as_millis() as u64,
            "worker call dispatched"
        );

        let started = Instant::now();
        if let Err(e) = self.write_line(&line).await {
            self.pending.lock().await.remove(&id);
            error!(label = %self.label, method, error = %e, "worker stdin write failed");
            self.terminate("worker stdin write failed", None, None).await;
            return Err(e.into());
        }

        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without a verdict; only possible if the proxy
            // is being torn down.
            Ok(Err(_)) => Err(self.exit_error()),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ForemanError::CallTimeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        };

        *self.last_activity.lock() = Instant::now();
        let duration_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(_) => info!(
                label = %self.label,
                role = %self.role,
                method,
                pid = ?self.pid,
                duration_ms,
                "worker call complete"
            ),
            Err(e) => warn!(
                label = %self.label,
                role = %self.role,
                method,
                pid = ?self.pid,
                duration_ms,
                error = %e,
                "worker call failed"
            ),
        }
        outcome
    }

    /// Run a bounded health check and record the reading on success.
    pub async fn check_health(&self, timeout: Duration) -> ForemanResult<serde_json::Value> {
        let result = tokio::time::timeout(
            timeout,
            self.call("health", serde_json::json!({}), timeout),
        )
        .await
        .map_err(|_| ForemanError::CallTimeout {
            method: "health".to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })??;

        *self.last_health.lock() = Some(HealthReading {
            payload: result.clone(),
            at: Utc::now(),
        });
        Ok(result)
    }

    /// Block until the worker has signalled readiness, failing after the
    /// startup deadline. The first caller to observe a missed deadline marks
    /// the proxy failed; every waiter gets `StartupTimeout`.
    pub async fn wait_ready(&self) -> ForemanResult<()> {
        let mut rx = self.status_tx.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            match status {
                ProxyStatus::Ready => return Ok(()),
                ProxyStatus::Stopped | ProxyStatus::Failed => return Err(self.exit_error()),
                ProxyStatus::Starting => {}
            }

            let deadline = self.spawn_instant + self.startup_deadline;
            let now = Instant::now();
            if now >= deadline {
                self.fail_startup().await;
                return Err(ForemanError::StartupTimeout {
                    label: self.label.clone(),
                });
            }
            match tokio::time::timeout(deadline - now, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(self.exit_error()),
                Err(_) => {
                    self.fail_startup().await;
                    return Err(ForemanError::StartupTimeout {
                        label: self.label.clone(),
                    });
                }
            }
        }
    }

    /// Resolve once the proxy reaches a terminal state.
    pub async fn wait_terminal(&self) {
        let mut rx = self.status_tx.subscribe();
        loop {
            if rx.borrow_and_update().is_terminal() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Tear the proxy down: fail everything outstanding, kill the process,
    /// move to `Stopped`. Calling it twice is a no-op.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.terminate("proxy disposed", None, None).await;
        info!(label = %self.label, role = %self.role, "worker proxy disposed");
    }

    pub fn status(&self) -> ProxyStatus {
        *self.status_tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.status() == ProxyStatus::Ready
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn role(&self) -> WorkerRole {
        self.role
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn spawned_at(&self) -> DateTime<Utc> {
        self.spawned_at
    }

    pub fn ready_at(&self) -> Option<DateTime<Utc>> {
        *self.ready_at.lock()
    }

    pub fn ready_info(&self) -> ReadyInfo {
        self.ready_info.lock().clone()
    }

    pub fn last_health(&self) -> Option<HealthReading> {
        self.last_health.lock().clone()
    }

    pub fn last_exit(&self) -> Option<ExitRecord> {
        self.last_exit.lock().clone()
    }

    async fn read_loop<R: AsyncRead + Send + Unpin>(self: Arc<Self>, reader: R) {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<WorkerMessage>(trimmed) {
                        Ok(msg) => {
                            if self.handle_message(msg).await {
                                return;
                            }
                        }
                        Err(e) => {
                            debug!(
                                label = %self.label,
                                line = %trimmed,
                                error = %e,
                                "unparseable worker line"
                            );
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(label = %self.label, error = %e, "error reading worker stream");
                    break;
                }
            }
        }
        self.terminate("worker stream closed", None, None).await;
    }

    /// Returns true when the message was terminal for the proxy.
    async fn handle_message(&self, msg: WorkerMessage) -> bool {
        match msg {
            WorkerMessage::Ready { version, flags } => {
                let became_ready = self.status_tx.send_if_modified(|s| {
                    if *s == ProxyStatus::Starting {
                        *s = ProxyStatus::Ready;
                        true
                    } else {
                        false
                    }
                });
                if became_ready {
                    *self.ready_info.lock() = ReadyInfo {
                        version: version.clone(),
                        flags,
                    };
                    *self.ready_at.lock() = Some(Utc::now());
                    info!(
                        label = %self.label,
                        role = %self.role,
                        pid = ?self.pid,
                        version = ?version,
                        "worker ready"
                    );
                } else {
                    debug!(label = %self.label, "duplicate ready signal ignored");
                }
                false
            }
            WorkerMessage::Log { level, message } => {
                match level.as_str() {
                    "error" => error!(label = %self.label, "worker: {message}"),
                    "warn" => warn!(label = %self.label, "worker: {message}"),
                    "debug" => debug!(label = %self.label, "worker: {message}"),
                    _ => info!(label = %self.label, "worker: {message}"),
                }
                false
            }
            WorkerMessage::Response {
                id,
                ok,
                result,
                error,
            } => {
                let entry = self.pending.lock().await.remove(&id);
                match entry {
                    Some(call) => {
                        let outcome = if ok {
                            Ok(result.unwrap_or(serde_json::Value::Null))
                        } else {
                            let err = error.unwrap_or(WireError {
                                message: "unspecified worker error".to_string(),
                                code: None,
                                details: None,
                            });
                            Err(ForemanError::Remote {
                                message: err.message,
                                code: err.code,
                                details: err.details,
                            })
                        };
                        let _ = call.tx.send(outcome);
                    }
                    None => {
                        debug!(label = %self.label, id, "response for unknown or expired call id");
                    }
                }
                false
            }
            WorkerMessage::Exit {
                reason,
                code,
                signal,
            } => {
                self.terminate(&reason, code, signal).await;
                true
            }
        }
    }

    async fn fail_startup(&self) {
        warn!(label = %self.label, role = %self.role, "worker missed readiness deadline");
        self.terminate(STARTUP_TIMEOUT_REASON, None, None).await;
    }

    /// Move to a terminal state, record the exit, and fail every pending
    /// call. Safe to call more than once.
    async fn terminate(&self, reason: &str, code: Option<i32>, signal: Option<String>) {
        let target = if self.disposed.load(Ordering::SeqCst) {
            ProxyStatus::Stopped
        } else {
            ProxyStatus::Failed
        };
        let transitioned = self.status_tx.send_if_modified(|s| {
            if s.is_terminal() {
                false
            } else {
                *s = target;
                true
            }
        });

        {
            let mut exit = self.last_exit.lock();
            if exit.is_none() {
                *exit = Some(ExitRecord {
                    reason: reason.to_string(),
                    code,
                    signal: signal.clone(),
                    at: Utc::now(),
                });
            }
        }

        let drained: Vec<(u64, PendingCall)> =
            self.pending.lock().await.drain().collect();
        for (_, call) in drained {
            warn!(
                label = %self.label,
                method = %call.method,
                age_ms = call.started.elapsed().as_millis() as u64,
                "failing pending call: worker terminal"
            );
            let _ = call.tx.send(Err(ForemanError::ProcessExit {
                label: self.label.clone(),
                reason: reason.to_string(),
                code,
                signal: signal.clone(),
            }));
        }

        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
        }

        if transitioned {
            info!(
                label = %self.label,
                role = %self.role,
                pid = ?self.pid,
                reason,
                code = ?code,
                "worker terminal"
            );
        }
    }

    fn exit_error(&self) -> ForemanError {
        match self.last_exit.lock().clone() {
            Some(rec) if rec.reason == STARTUP_TIMEOUT_REASON => ForemanError::StartupTimeout {
                label: self.label.clone(),
            },
            Some(rec) => ForemanError::ProcessExit {
                label: self.label.clone(),
                reason: rec.reason,
                code: rec.code,
                signal: rec.signal,
            },
            None => ForemanError::ProcessExit {
                label: self.label.clone(),
                reason: "worker stopped".to_string(),
                code: None,
                signal: None,
            },
        }
    }

    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }

    fn spawn_idle_watchdog(self: &Arc<Self>, idle: Duration) {
        let proxy = Arc::clone(self);
        tokio::spawn(async move {
            let tick = idle
                .min(Duration::from_secs(5))
                .max(Duration::from_millis(20));
            loop {
                tokio::time::sleep(tick).await;
                if proxy.status().is_terminal() {
                    break;
                }
                let idle_for = proxy.last_activity.lock().elapsed();
                if idle_for >= idle {
                    info!(
                        label = %proxy.label,
                        idle_ms = idle_for.as_millis() as u64,
                        "disposing idle worker"
                    );
                    proxy.dispose().await;
                    break;
                }
            }
        });
    }
}
