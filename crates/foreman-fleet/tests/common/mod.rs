//! Scripted worker harness: a launcher that wires proxies to in-memory
//! duplex transports, with a simple request loop on the worker side.

use async_trait::async_trait;
use foreman_core::ForemanResult;
use foreman_fleet::{
    ProxyOptions, WireError, WorkerLauncher, WorkerMessage, WorkerProxy, WorkerRequest,
    WorkerSpawnSpec,
};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// How a scripted worker behaves after spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerScript {
    /// Handshake immediately, answer every call.
    Responsive,
    /// Never send the ready signal.
    NeverReady,
    /// Handshake after a 200ms delay, then answer every call.
    SlowReady,
    /// Handshake immediately, but fail every health call.
    FailingHealth,
}

/// Launcher that replaces real processes with scripted duplex workers.
/// Assigns sequential fake pids starting at 1000.
pub struct ScriptedLauncher {
    script: WorkerScript,
    next_pid: AtomicU32,
    launches: AtomicUsize,
}

impl ScriptedLauncher {
    pub fn new(script: WorkerScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            next_pid: AtomicU32::new(1000),
            launches: AtomicUsize::new(0),
        })
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerLauncher for ScriptedLauncher {
    async fn launch(&self, spec: &WorkerSpawnSpec) -> ForemanResult<Arc<WorkerProxy>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(client);
        run_worker(server, self.script);

        let options = ProxyOptions {
            label: spec.label.clone(),
            role: spec.role,
            mode: spec.mode,
            startup_deadline: spec.startup_deadline,
            idle_timeout: spec.idle_timeout,
        };
        Ok(WorkerProxy::from_transport(options, Some(pid), read, write))
    }
}

async fn send(write: &mut tokio::io::WriteHalf<tokio::io::DuplexStream>, msg: &WorkerMessage) {
    #[allow(clippy::unwrap_used)]
    let line = serde_json::to_string(msg).unwrap();
    let _ = write.write_all(line.as_bytes()).await;
    let _ = write.write_all(b"\n").await;
    let _ = write.flush().await;
}

fn run_worker(server: tokio::io::DuplexStream, script: WorkerScript) {
    let (read, mut write) = tokio::io::split(server);
    tokio::spawn(async move {
        if script == WorkerScript::SlowReady {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        if script != WorkerScript::NeverReady {
            send(
                &mut write,
                &WorkerMessage::Ready {
                    version: Some("9.9.9".to_string()),
                    flags: Vec::new(),
                },
            )
            .await;
        }
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let req: WorkerRequest = match serde_json::from_str(&line) {
                Ok(req) => req,
                Err(_) => continue,
            };
            match req.method.as_str() {
                "health" if script == WorkerScript::FailingHealth => {
                    send(
                        &mut write,
                        &WorkerMessage::Response {
                            id: req.id,
                            ok: false,
                            result: None,
                            error: Some(WireError {
                                message: "subsystem degraded".to_string(),
                                code: Some(503),
                                details: None,
                            }),
                        },
                    )
                    .await;
                }
                "health" => {
                    send(
                        &mut write,
                        &WorkerMessage::Response {
                            id: req.id,
                            ok: true,
                            result: Some(serde_json::json!({"ok": true})),
                            error: None,
                        },
                    )
                    .await;
                }
                "echo" => {
                    send(
                        &mut write,
                        &WorkerMessage::Response {
                            id: req.id,
                            ok: true,
                            result: Some(req.params),
                            error: None,
                        },
                    )
                    .await;
                }
                "crash" => {
                    send(
                        &mut write,
                        &WorkerMessage::Exit {
                            reason: "worker crashed".to_string(),
                            code: Some(1),
                            signal: None,
                        },
                    )
                    .await;
                    return;
                }
                other => {
                    send(
                        &mut write,
                        &WorkerMessage::Response {
                            id: req.id,
                            ok: false,
                            result: None,
                            error: Some(WireError {
                                message: format!("unknown method '{other}'"),
                                code: Some(-32601),
                                details: None,
                            }),
                        },
                    )
                    .await;
                }
            }
        }
    });
}

/// Short deadlines so failure paths resolve quickly in tests.
#[allow(clippy::unwrap_used)]
pub fn test_config() -> foreman_core::ForemanConfig {
    foreman_core::ForemanConfig::from_toml(
        r#"
        startup_deadline_secs = 1
        call_timeout_secs = 2
        health_check_timeout_secs = 1
        "#,
    )
    .unwrap()
}

/// Convenience: a manager over responsive scripted workers.
pub fn scripted_manager() -> (Arc<foreman_fleet::WorkerManager>, Arc<ScriptedLauncher>) {
    let launcher = ScriptedLauncher::new(WorkerScript::Responsive);
    let manager = Arc::new(foreman_fleet::WorkerManager::new(
        test_config(),
        launcher.clone(),
    ));
    (manager, launcher)
}

#[allow(dead_code)]
pub fn short_timeout() -> Duration {
    Duration::from_secs(1)
}
