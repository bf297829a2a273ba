use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role a worker process plays in the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRole {
    /// The current production worker. Exactly one at a time.
    Active,
    /// A candidate build running alongside the active worker.
    Canary,
    /// A stateless pool worker drawn round-robin for general dispatch.
    Executor,
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerRole::Active => write!(f, "active"),
            WorkerRole::Canary => write!(f, "canary"),
            WorkerRole::Executor => write!(f, "executor"),
        }
    }
}

/// Whether a worker may write to shared state.
///
/// Threaded through worker startup and enforced at the call-dispatch boundary
/// inside the worker. A canary defaults to `ReadOnly` so a candidate build can
/// answer health/plan-shaped calls without touching anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Mutating,
    ReadOnly,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Mutating => write!(f, "mutating"),
            ExecutionMode::ReadOnly => write!(f, "read_only"),
        }
    }
}

/// Status of a task in the external state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Ready,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A task row as read from the external state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Task IDs this task declares it depends on.
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl TaskRecord {
    pub fn new(status: TaskStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            status,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            dependencies: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Age of an in-progress task, in seconds. `None` when not started.
    pub fn in_progress_age_secs(&self, now: DateTime<Utc>) -> Option<i64> {
        match (self.status, self.started_at) {
            (TaskStatus::InProgress, Some(started)) => {
                Some((now - started).num_seconds())
            }
            _ => None,
        }
    }
}

/// Capacity and current reservations of the external agent pool.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AgentPoolStatus {
    pub capacity: usize,
    pub reserved: usize,
}

impl AgentPoolStatus {
    pub fn busy(&self) -> usize {
        self.reserved.min(self.capacity)
    }

    pub fn idle(&self) -> usize {
        self.capacity.saturating_sub(self.reserved)
    }

    /// Work-in-progress utilization in `[0.0, 1.0]`. Zero capacity reads as 0.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.busy() as f64 / self.capacity as f64
        }
    }
}
