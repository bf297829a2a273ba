//! Observe: build one metrics sample from the state store and agent pool.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use foreman_core::{AgentPool, ForemanResult, StateStore, TaskRecord, TaskStatus};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// One point-in-time reading of task and agent state. Appended to a bounded
/// history each monitor cycle.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSample {
    pub at: DateTime<Utc>,
    pub pending: usize,
    pub ready: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    /// Tasks ready for dispatch right now.
    pub queue_depth: usize,
    /// Busy agents over capacity, in `[0.0, 1.0]`.
    pub wip_utilization: f64,
    /// Tasks completed in the last hour.
    pub throughput_last_hour: f64,
    /// Tasks completed in the last 5 minutes, rate-converted to per-hour so
    /// the two windows compare directly.
    pub throughput_recent_hourly: f64,
    pub stale_count: usize,
    /// Age of the oldest stale task; 0 when none are stale.
    pub max_stale_age_secs: i64,
    /// Declaring tasks whose declared dependencies are all recorded, over all
    /// declaring tasks. 1.0 when nothing declares dependencies.
    pub dependency_sync_ratio: f64,
    pub agents_busy: usize,
    pub agents_idle: usize,
}

/// The sample plus the stale task records it was computed from, so a
/// recovery action can reuse them without a second query.
#[derive(Debug, Clone)]
pub struct ObserveResult {
    pub sample: HealthSample,
    pub stale_tasks: Vec<TaskRecord>,
}

/// Read task/agent state and compute one [`HealthSample`].
pub async fn observe(
    store: &dyn StateStore,
    pool: &dyn AgentPool,
    stale_threshold: Duration,
) -> ForemanResult<ObserveResult> {
    let now = Utc::now();

    let pending = store.tasks_by_status(TaskStatus::Pending).await?;
    let ready = store.tasks_by_status(TaskStatus::Ready).await?;
    let in_progress = store.tasks_by_status(TaskStatus::InProgress).await?;
    let completed = store.tasks_by_status(TaskStatus::Completed).await?;
    let failed = store.tasks_by_status(TaskStatus::Failed).await?;
    let agents = pool.status().await?;

    let threshold_secs = stale_threshold.as_secs() as i64;
    let mut stale_tasks = Vec::new();
    let mut max_stale_age_secs = 0;
    for task in &in_progress {
        if let Some(age) = task.in_progress_age_secs(now) {
            if age >= threshold_secs {
                max_stale_age_secs = max_stale_age_secs.max(age);
                stale_tasks.push(task.clone());
            }
        }
    }

    let hour_ago = now - ChronoDuration::hours(1);
    let five_min_ago = now - ChronoDuration::minutes(5);
    let completed_last_hour = completed
        .iter()
        .filter(|t| t.completed_at.is_some_and(|at| at >= hour_ago))
        .count();
    let completed_recent = completed
        .iter()
        .filter(|t| t.completed_at.is_some_and(|at| at >= five_min_ago))
        .count();

    let dependency_sync_ratio =
        dependency_sync_ratio(store, pending.iter().chain(&ready).chain(&in_progress)).await?;

    let sample = HealthSample {
        at: now,
        pending: pending.len(),
        ready: ready.len(),
        in_progress: in_progress.len(),
        completed: completed.len(),
        failed: failed.len(),
        queue_depth: ready.len(),
        wip_utilization: agents.utilization(),
        throughput_last_hour: completed_last_hour as f64,
        throughput_recent_hourly: completed_recent as f64 * 12.0,
        stale_count: stale_tasks.len(),
        max_stale_age_secs,
        dependency_sync_ratio,
        agents_busy: agents.busy(),
        agents_idle: agents.idle(),
    };

    debug!(
        pending = sample.pending,
        ready = sample.ready,
        in_progress = sample.in_progress,
        stale = sample.stale_count,
        sync_ratio = sample.dependency_sync_ratio,
        "health sample collected"
    );

    Ok(ObserveResult {
        sample,
        stale_tasks,
    })
}

/// Fraction of dependency-declaring tasks whose declared edges are all
/// present in the authoritative dependency table.
async fn dependency_sync_ratio<'a>(
    store: &dyn StateStore,
    tasks: impl Iterator<Item = &'a TaskRecord>,
) -> ForemanResult<f64> {
    let mut declaring = 0usize;
    let mut in_sync = 0usize;

    for task in tasks.filter(|t| !t.dependencies.is_empty()) {
        declaring += 1;
        let recorded = store.recorded_dependencies(task.id).await?;
        if task.dependencies.iter().all(|dep| recorded.contains(dep)) {
            in_sync += 1;
        }
    }

    if declaring == 0 {
        Ok(1.0)
    } else {
        Ok(in_sync as f64 / declaring as f64)
    }
}
