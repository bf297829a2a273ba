//! The repeating observe/orient/decide/act cycle.

use crate::detect::{detect, Anomaly};
use crate::metrics::{observe, HealthSample, ObserveResult};
use crate::policy::plan;
use crate::remediate::{act, RemediationOutcome};
use chrono::Utc;
use foreman_core::{
    AgentPool, ForemanConfig, ForemanResult, JsonTelemetrySink, RingBuffer, StateStore,
};
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Shape of the periodic telemetry export.
#[derive(Debug, Serialize)]
struct MonitorExport {
    at: chrono::DateTime<chrono::Utc>,
    samples: Vec<HealthSample>,
    /// Anomalies detected within the last 10 minutes.
    active_anomalies: Vec<Anomaly>,
    outcomes: Vec<RemediationOutcome>,
}

/// Self-healing loop over the external task/agent state.
///
/// `start` runs one cycle immediately, then repeats on a fixed interval.
/// Each cycle samples state, detects anomalies, maps them through the fixed
/// policy, and executes safe remediations. A cycle error is logged and never
/// stops the timer. Histories are bounded rings; nothing grows without
/// limit.
pub struct HealthMonitor {
    store: Arc<dyn StateStore>,
    pool: Arc<dyn AgentPool>,
    config: ForemanConfig,
    telemetry: Option<Arc<JsonTelemetrySink>>,
    samples: SyncMutex<RingBuffer<HealthSample>>,
    anomalies: SyncMutex<RingBuffer<Anomaly>>,
    outcomes: SyncMutex<RingBuffer<RemediationOutcome>>,
    last_export: SyncMutex<Option<Instant>>,
    shutdown_tx: watch::Sender<bool>,
    handle: SyncMutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<dyn StateStore>,
        pool: Arc<dyn AgentPool>,
        config: ForemanConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let cap = config.history_capacity;
        Self {
            store,
            pool,
            config,
            telemetry: None,
            samples: SyncMutex::new(RingBuffer::new(cap)),
            anomalies: SyncMutex::new(RingBuffer::new(cap)),
            outcomes: SyncMutex::new(RingBuffer::new(cap)),
            last_export: SyncMutex::new(None),
            shutdown_tx,
            handle: SyncMutex::new(None),
        }
    }

    /// Export cycle summaries to this sink (best-effort).
    pub fn with_telemetry(mut self, sink: Arc<JsonTelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    /// Run the loop: one cycle immediately, then every monitor interval.
    /// Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.handle.lock();
        if guard.is_some() {
            return;
        }
        let monitor = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *guard = Some(tokio::spawn(async move {
            info!(
                interval_secs = monitor.config.monitor_interval_secs,
                auto_remediation = monitor.config.auto_remediation,
                "health monitor started"
            );
            monitor.run_cycle().await;
            let mut timer = tokio::time::interval(monitor.config.monitor_interval());
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            timer.tick().await; // the immediate first tick
            loop {
                tokio::select! {
                    _ = timer.tick() => monitor.run_cycle().await,
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("health monitor stopped");
        }));
    }

    /// Signal shutdown and wait for the loop (any in-flight cycle finishes).
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// One full observe → orient → decide → act pass. Errors are logged,
    /// never propagated to the timer.
    pub async fn run_cycle(&self) {
        if let Err(e) = self.cycle().await {
            warn!(error = %e, "monitor cycle failed");
        }
        self.maybe_export().await;
    }

    async fn cycle(&self) -> ForemanResult<()> {
        let ObserveResult {
            sample,
            stale_tasks,
        } = observe(
            self.store.as_ref(),
            self.pool.as_ref(),
            std::time::Duration::from_secs(self.config.stale_task_threshold_secs),
        )
        .await?;

        let prior_samples = self.samples.lock().len();
        let detected = detect(
            &sample,
            prior_samples,
            self.config.baseline_throughput_per_hour,
        );
        self.samples.lock().push(sample);

        for anomaly in detected {
            info!(
                kind = %anomaly.kind,
                severity = %anomaly.severity,
                description = %anomaly.description,
                "anomaly detected"
            );
            self.anomalies.lock().push(anomaly.clone());

            let plan = plan(anomaly);
            let outcome = act(
                self.store.as_ref(),
                plan,
                &stale_tasks,
                self.config.auto_remediation,
            )
            .await;
            self.outcomes.lock().push(outcome);
        }

        Ok(())
    }

    /// Export when the export interval has elapsed. The first cycle only
    /// arms the timer.
    async fn maybe_export(&self) {
        if self.telemetry.is_none() {
            return;
        }
        let due = {
            let mut last = self.last_export.lock();
            match *last {
                None => {
                    *last = Some(Instant::now());
                    false
                }
                Some(at) if at.elapsed() >= self.config.export_interval() => {
                    *last = Some(Instant::now());
                    true
                }
                Some(_) => false,
            }
        };
        if due {
            self.export_now().await;
        }
    }

    /// Write one export record immediately. Failures are logged only.
    pub async fn export_now(&self) {
        let Some(sink) = &self.telemetry else {
            return;
        };
        let cutoff = Utc::now() - chrono::Duration::minutes(10);
        let export = MonitorExport {
            at: Utc::now(),
            samples: self
                .samples
                .lock()
                .recent(12)
                .into_iter()
                .cloned()
                .collect(),
            active_anomalies: self
                .anomalies
                .lock()
                .iter()
                .filter(|a| a.detected_at >= cutoff)
                .cloned()
                .collect(),
            outcomes: self
                .outcomes
                .lock()
                .recent(20)
                .into_iter()
                .cloned()
                .collect(),
        };
        match sink.write_record("monitor_export", &export).await {
            Ok(path) => info!(path = %path.display(), "monitor export written"),
            Err(e) => warn!(error = %e, "monitor export failed"),
        }
    }

    /// The most recent metrics sample, if any cycle has run.
    pub fn latest_sample(&self) -> Option<HealthSample> {
        self.samples.lock().latest().cloned()
    }

    /// The newest `limit` anomalies, newest first.
    pub fn recent_anomalies(&self, limit: usize) -> Vec<Anomaly> {
        self.anomalies.lock().recent(limit).into_iter().cloned().collect()
    }

    /// The newest `limit` remediation outcomes, newest first.
    pub fn recent_outcomes(&self, limit: usize) -> Vec<RemediationOutcome> {
        self.outcomes.lock().recent(limit).into_iter().cloned().collect()
    }

    /// Dashboard-shaped summary of the monitor's current view.
    pub fn status_json(&self) -> serde_json::Value {
        let samples = self.samples.lock();
        let anomalies = self.anomalies.lock();
        let outcomes = self.outcomes.lock();
        serde_json::json!({
            "running": self.handle.lock().is_some(),
            "auto_remediation": self.config.auto_remediation,
            "cycles": samples.len(),
            "latest_sample": samples.latest(),
            "anomalies_recorded": anomalies.len(),
            "latest_anomaly": anomalies.latest(),
            "remediations_recorded": outcomes.len(),
        })
    }
}
