//! End-to-end monitor cycles against the in-memory store and pool.

#![allow(clippy::unwrap_used)]

mod common;

use common::{completed_task, in_progress_task, test_config, FixedPool, MemoryStore};
use foreman_core::{AgentPool, JsonTelemetrySink, StateStore, TaskRecord, TaskStatus};
use foreman_monitor::{
    observe, AnomalyKind, HealthMonitor, RemediationAction, Severity,
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn monitor(store: &Arc<MemoryStore>, pool: &Arc<FixedPool>) -> Arc<HealthMonitor> {
    Arc::new(HealthMonitor::new(
        Arc::clone(store) as Arc<dyn StateStore>,
        Arc::clone(pool) as Arc<dyn AgentPool>,
        test_config(),
    ))
}

#[tokio::test]
async fn test_observe_counts_and_staleness() {
    let store = MemoryStore::new();
    store.insert(TaskRecord::new(TaskStatus::Pending));
    store.insert(TaskRecord::new(TaskStatus::Ready));
    store.insert(TaskRecord::new(TaskStatus::Ready));
    store.insert(in_progress_task(10));
    store.insert(in_progress_task(120)); // past the 60s test threshold
    store.insert(completed_task(30));
    let pool = FixedPool::new(4, 3);

    let result = observe(store.as_ref(), pool.as_ref(), Duration::from_secs(60))
        .await
        .unwrap();
    let sample = &result.sample;

    assert_eq!(sample.pending, 1);
    assert_eq!(sample.ready, 2);
    assert_eq!(sample.queue_depth, 2);
    assert_eq!(sample.in_progress, 2);
    assert_eq!(sample.completed, 1);
    assert_eq!(sample.stale_count, 1);
    assert!(sample.max_stale_age_secs >= 120);
    assert_eq!(result.stale_tasks.len(), 1);
    assert_eq!(sample.agents_busy, 3);
    assert_eq!(sample.agents_idle, 1);
    assert!((sample.wip_utilization - 0.75).abs() < f64::EPSILON);
    // Five-minute window rate-converted to per-hour.
    assert!((sample.throughput_recent_hourly - 12.0).abs() < f64::EPSILON);
    assert!((sample.dependency_sync_ratio - 1.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_observe_dependency_sync_ratio() {
    let store = MemoryStore::new();
    let dep = store.insert(completed_task(600));

    let synced = TaskRecord::new(TaskStatus::Pending).with_dependencies(vec![dep]);
    store.insert(synced);

    let desynced = TaskRecord::new(TaskStatus::Pending).with_dependencies(vec![dep]);
    let desynced_id = store.insert(desynced);
    // The dependency table lost this task's rows.
    store.set_recorded_dependencies(desynced_id, Vec::new());

    let pool = FixedPool::new(2, 0);
    let result = observe(store.as_ref(), pool.as_ref(), Duration::from_secs(60))
        .await
        .unwrap();
    assert!((result.sample.dependency_sync_ratio - 0.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_stale_tasks_recovered_through_full_cycle() {
    let store = MemoryStore::new();
    let mut stale_ids = Vec::new();
    for _ in 0..4 {
        stale_ids.push(store.insert(in_progress_task(300)));
    }
    let pool = FixedPool::new(4, 4);
    let monitor = monitor(&store, &pool);

    monitor.run_cycle().await;

    // One critical stale_tasks anomaly.
    let anomalies = monitor.recent_anomalies(10);
    let stale: Vec<_> = anomalies
        .iter()
        .filter(|a| a.kind == AnomalyKind::StaleTasks)
        .collect();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].severity, Severity::Critical);

    // All four transitioned back to pending with recovery metadata.
    for id in &stale_ids {
        let task = store.get(*id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.metadata["recovered_by"], "health_monitor");
        assert!(task.metadata["stale_age_secs"].as_i64().unwrap() >= 300);
    }

    let outcomes = monitor.recent_outcomes(10);
    let recovery = outcomes
        .iter()
        .find(|o| o.plan.action == RemediationAction::RecoverStaleTasks)
        .unwrap();
    assert!(recovery.success);
    assert_eq!(recovery.metrics.as_ref().unwrap()["recovered"], 4);
}

#[tokio::test]
async fn test_starvation_is_alert_only() {
    let store = MemoryStore::new();
    for _ in 0..10 {
        store.insert(TaskRecord::new(TaskStatus::Pending));
    }
    let pool = FixedPool::new(2, 0); // two idle agents, nothing ready
    let monitor = monitor(&store, &pool);

    monitor.run_cycle().await;

    let anomalies = monitor.recent_anomalies(10);
    let starvation: Vec<_> = anomalies
        .iter()
        .filter(|a| a.kind == AnomalyKind::WipStarvation)
        .collect();
    assert_eq!(starvation.len(), 1);

    let outcomes = monitor.recent_outcomes(10);
    let outcome = outcomes
        .iter()
        .find(|o| o.plan.anomaly.kind == AnomalyKind::WipStarvation)
        .unwrap();
    assert_eq!(outcome.plan.action, RemediationAction::AlertOnly);

    // Alerting never mutates task state.
    assert_eq!(store.count_by_status(TaskStatus::Pending), 10);
    assert_eq!(store.count_by_status(TaskStatus::Ready), 0);
}

#[tokio::test]
async fn test_auto_remediation_off_skips_recovery() {
    let store = MemoryStore::new();
    let id = store.insert(in_progress_task(300));
    let pool = FixedPool::new(2, 2);
    let mut config = test_config();
    config.auto_remediation = false;
    let monitor = Arc::new(HealthMonitor::new(
        Arc::clone(&store) as Arc<dyn StateStore>,
        Arc::clone(&pool) as Arc<dyn AgentPool>,
        config,
    ));

    monitor.run_cycle().await;

    // Still in progress; the skip is recorded as an unsuccessful outcome.
    assert_eq!(store.get(id).unwrap().status, TaskStatus::InProgress);
    let outcomes = monitor.recent_outcomes(10);
    let skipped = outcomes
        .iter()
        .find(|o| o.plan.action == RemediationAction::RecoverStaleTasks)
        .unwrap();
    assert!(!skipped.success);
    assert!(skipped.message.contains("disabled"));
}

#[tokio::test]
async fn test_single_recovery_failure_not_fatal() {
    let store = MemoryStore::new();
    let good = store.insert(in_progress_task(300));
    let bad = store.insert(in_progress_task(300));
    let c = store.insert(in_progress_task(300));
    store.poison(bad);
    let pool = FixedPool::new(2, 2);
    let monitor = monitor(&store, &pool);

    monitor.run_cycle().await;

    assert_eq!(store.get(good).unwrap().status, TaskStatus::Pending);
    assert_eq!(store.get(c).unwrap().status, TaskStatus::Pending);
    assert_eq!(store.get(bad).unwrap().status, TaskStatus::InProgress);

    let outcomes = monitor.recent_outcomes(10);
    let recovery = outcomes
        .iter()
        .find(|o| o.plan.action == RemediationAction::RecoverStaleTasks)
        .unwrap();
    assert!(!recovery.success);
    assert_eq!(recovery.metrics.as_ref().unwrap()["recovered"], 2);
    assert_eq!(recovery.metrics.as_ref().unwrap()["failed"], 1);
}

#[tokio::test]
async fn test_desync_alert_does_not_mutate() {
    let store = MemoryStore::new();
    let dep = store.insert(completed_task(600));
    for _ in 0..3 {
        let task = TaskRecord::new(TaskStatus::Pending).with_dependencies(vec![dep]);
        let id = store.insert(task);
        store.set_recorded_dependencies(id, Vec::new());
    }
    let pool = FixedPool::new(2, 2);
    let monitor = monitor(&store, &pool);

    monitor.run_cycle().await;

    let anomalies = monitor.recent_anomalies(10);
    let desync = anomalies
        .iter()
        .find(|a| a.kind == AnomalyKind::DependencyDesync)
        .unwrap();
    assert_eq!(desync.severity, Severity::Critical);

    let outcomes = monitor.recent_outcomes(10);
    let outcome = outcomes
        .iter()
        .find(|o| o.plan.anomaly.kind == AnomalyKind::DependencyDesync)
        .unwrap();
    assert_eq!(outcome.plan.action, RemediationAction::ResyncDependencies);
    // Alert-only: no transitions were issued.
    assert_eq!(store.count_by_status(TaskStatus::Pending), 3);
}

#[tokio::test]
async fn test_cycle_error_does_not_stop_loop() {
    /// Store whose queries fail outright.
    struct BrokenStore;

    #[async_trait::async_trait]
    impl foreman_core::StateStore for BrokenStore {
        async fn tasks_by_status(
            &self,
            _status: TaskStatus,
        ) -> foreman_core::ForemanResult<Vec<TaskRecord>> {
            Err(foreman_core::ForemanError::Store("db offline".into()))
        }
        async fn recorded_dependencies(
            &self,
            _task_id: Uuid,
        ) -> foreman_core::ForemanResult<Vec<Uuid>> {
            Err(foreman_core::ForemanError::Store("db offline".into()))
        }
        async fn transition(
            &self,
            _task_id: Uuid,
            _to: TaskStatus,
            _metadata: serde_json::Value,
        ) -> foreman_core::ForemanResult<()> {
            Err(foreman_core::ForemanError::Store("db offline".into()))
        }
    }

    let pool = FixedPool::new(2, 0);
    let monitor = Arc::new(HealthMonitor::new(
        Arc::new(BrokenStore),
        Arc::clone(&pool) as Arc<dyn AgentPool>,
        test_config(),
    ));

    // Both cycles fail; neither panics and the monitor stays usable.
    monitor.run_cycle().await;
    monitor.run_cycle().await;
    assert!(monitor.latest_sample().is_none());
    assert_eq!(monitor.status_json()["cycles"], 0);
}

#[tokio::test]
async fn test_start_runs_immediately_and_stop_halts() {
    let store = MemoryStore::new();
    store.insert(TaskRecord::new(TaskStatus::Ready));
    let pool = FixedPool::new(2, 1);
    let monitor = monitor(&store, &pool);

    monitor.start();
    // First cycle runs immediately, before the first interval elapses.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(monitor.latest_sample().is_some());
    assert_eq!(monitor.status_json()["running"], true);

    monitor.stop().await;
    let cycles = monitor.status_json()["cycles"].clone();
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(monitor.status_json()["cycles"], cycles);
}

#[tokio::test]
async fn test_export_writes_record() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    store.insert(in_progress_task(300));
    let pool = FixedPool::new(2, 2);
    let monitor = Arc::new(
        HealthMonitor::new(
            Arc::clone(&store) as Arc<dyn StateStore>,
            Arc::clone(&pool) as Arc<dyn AgentPool>,
            test_config(),
        )
        .with_telemetry(Arc::new(JsonTelemetrySink::new(dir.path()))),
    );

    monitor.run_cycle().await;
    monitor.export_now().await;

    let sink = JsonTelemetrySink::new(dir.path());
    let records = sink.list_records("monitor_export").await.unwrap();
    assert_eq!(records.len(), 1);
    let content = tokio::fs::read_to_string(&records[0]).await.unwrap();
    assert!(content.contains("stale_tasks"));
    assert!(content.contains("active_anomalies"));
}
