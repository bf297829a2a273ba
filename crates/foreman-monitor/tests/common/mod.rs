//! In-memory state store and agent pool standing in for the external
//! collaborators.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use foreman_core::{
    AgentPool, AgentPoolStatus, ForemanError, ForemanResult, StateStore, TaskRecord, TaskStatus,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Task table plus a separately maintained dependency table, so tests can
/// make the two disagree.
#[derive(Default)]
pub struct MemoryStore {
    tasks: Mutex<HashMap<Uuid, TaskRecord>>,
    recorded_deps: Mutex<HashMap<Uuid, Vec<Uuid>>>,
    /// Task ids whose transitions should fail.
    poisoned: Mutex<Vec<Uuid>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, task: TaskRecord) -> Uuid {
        let id = task.id;
        // Declared deps are recorded as in-sync unless a test overrides them.
        self.recorded_deps
            .lock()
            .insert(id, task.dependencies.clone());
        self.tasks.lock().insert(id, task);
        id
    }

    /// Make the recorded dependency rows for `task_id` diverge from what the
    /// task declares.
    pub fn set_recorded_dependencies(&self, task_id: Uuid, deps: Vec<Uuid>) {
        self.recorded_deps.lock().insert(task_id, deps);
    }

    /// Every transition for `task_id` will fail with a store error.
    pub fn poison(&self, task_id: Uuid) {
        self.poisoned.lock().push(task_id);
    }

    pub fn get(&self, task_id: Uuid) -> Option<TaskRecord> {
        self.tasks.lock().get(&task_id).cloned()
    }

    pub fn count_by_status(&self, status: TaskStatus) -> usize {
        self.tasks
            .lock()
            .values()
            .filter(|t| t.status == status)
            .count()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn tasks_by_status(&self, status: TaskStatus) -> ForemanResult<Vec<TaskRecord>> {
        Ok(self
            .tasks
            .lock()
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect())
    }

    async fn recorded_dependencies(&self, task_id: Uuid) -> ForemanResult<Vec<Uuid>> {
        Ok(self
            .recorded_deps
            .lock()
            .get(&task_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn transition(
        &self,
        task_id: Uuid,
        to: TaskStatus,
        metadata: serde_json::Value,
    ) -> ForemanResult<()> {
        if self.poisoned.lock().contains(&task_id) {
            return Err(ForemanError::Store(format!(
                "transition rejected for {task_id}"
            )));
        }
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| ForemanError::Store(format!("no such task {task_id}")))?;
        task.status = to;
        task.metadata = metadata;
        if to == TaskStatus::Pending {
            task.started_at = None;
        }
        Ok(())
    }
}

/// Fixed-capacity pool with a settable reservation count.
pub struct FixedPool {
    capacity: usize,
    reserved: Mutex<usize>,
}

impl FixedPool {
    pub fn new(capacity: usize, reserved: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            reserved: Mutex::new(reserved),
        })
    }

    #[allow(dead_code)]
    pub fn set_reserved(&self, reserved: usize) {
        *self.reserved.lock() = reserved;
    }
}

#[async_trait]
impl AgentPool for FixedPool {
    async fn status(&self) -> ForemanResult<AgentPoolStatus> {
        Ok(AgentPoolStatus {
            capacity: self.capacity,
            reserved: *self.reserved.lock(),
        })
    }
}

/// An in-progress task started `age_secs` ago.
pub fn in_progress_task(age_secs: i64) -> TaskRecord {
    let mut task = TaskRecord::new(TaskStatus::InProgress);
    task.started_at = Some(Utc::now() - ChronoDuration::seconds(age_secs));
    task
}

/// A completed task finished `ago_secs` ago.
pub fn completed_task(ago_secs: i64) -> TaskRecord {
    let mut task = TaskRecord::new(TaskStatus::Completed);
    task.completed_at = Some(Utc::now() - ChronoDuration::seconds(ago_secs));
    task
}

/// Config with a short stale threshold so tests can age tasks in seconds.
#[allow(clippy::unwrap_used)]
pub fn test_config() -> foreman_core::ForemanConfig {
    foreman_core::ForemanConfig::from_toml(
        r#"
        stale_task_threshold_secs = 60
        monitor_interval_secs = 1
        "#,
    )
    .unwrap()
}
