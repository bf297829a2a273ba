use crate::error::ForemanResult;
use crate::types::{AgentPoolStatus, TaskRecord, TaskStatus};
use async_trait::async_trait;
use uuid::Uuid;

/// Read/transition access to the durable task-state store.
///
/// The storage engine itself lives outside this workspace; the health monitor
/// reads task state through these queries and writes only through
/// [`StateStore::transition`], which the store is assumed to serialize
/// against conflicting writers.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// All tasks currently in the given status.
    async fn tasks_by_status(&self, status: TaskStatus) -> ForemanResult<Vec<TaskRecord>>;

    /// Dependency edges recorded in the authoritative dependency table for
    /// one task. May lag the dependencies the task itself declares.
    async fn recorded_dependencies(&self, task_id: Uuid) -> ForemanResult<Vec<Uuid>>;

    /// Atomically move a task to `to`, attaching `metadata` to the record.
    async fn transition(
        &self,
        task_id: Uuid,
        to: TaskStatus,
        metadata: serde_json::Value,
    ) -> ForemanResult<()>;
}

/// Capacity/reservation view of the external agent pool.
#[async_trait]
pub trait AgentPool: Send + Sync {
    async fn status(&self) -> ForemanResult<AgentPoolStatus>;
}
