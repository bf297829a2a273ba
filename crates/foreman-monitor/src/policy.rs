//! Decide: the fixed anomaly-to-action policy.

use crate::detect::{Anomaly, AnomalyKind};
use serde::Serialize;

/// What the monitor may do about an anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    RecoverStaleTasks,
    ResyncDependencies,
    AlertOnly,
    #[serde(rename = "none")]
    NoAction,
}

impl std::fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemediationAction::RecoverStaleTasks => write!(f, "recover_stale_tasks"),
            RemediationAction::ResyncDependencies => write!(f, "resync_dependencies"),
            RemediationAction::AlertOnly => write!(f, "alert_only"),
            RemediationAction::NoAction => write!(f, "none"),
        }
    }
}

/// Blast-radius estimate of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    Low,
    Medium,
    High,
}

/// One anomaly mapped to exactly one action. Only plans marked `safe`
/// auto-execute; safety is static, never re-evaluated at runtime.
#[derive(Debug, Clone, Serialize)]
pub struct RemediationPlan {
    pub anomaly: Anomaly,
    pub action: RemediationAction,
    pub rationale: String,
    pub impact: Impact,
    pub safe: bool,
}

/// The fixed policy table.
pub fn plan(anomaly: Anomaly) -> RemediationPlan {
    let (action, rationale, impact, safe) = match anomaly.kind {
        AnomalyKind::StaleTasks => (
            RemediationAction::RecoverStaleTasks,
            "return stale in-progress tasks to the queue so another agent can pick them up",
            Impact::Low,
            true,
        ),
        AnomalyKind::DependencyDesync => (
            RemediationAction::ResyncDependencies,
            "rebuild missing dependency rows from task declarations; idempotent",
            Impact::Medium,
            true,
        ),
        AnomalyKind::ThroughputDegradation => (
            RemediationAction::AlertOnly,
            "low throughput is a symptom, not a root cause; needs a human look",
            Impact::Low,
            true,
        ),
        AnomalyKind::WipStarvation => (
            RemediationAction::AlertOnly,
            "idle capacity with a blocked queue points at scheduling, not task state",
            Impact::Low,
            true,
        ),
        AnomalyKind::QueueEmpty => (
            RemediationAction::NoAction,
            "expected while the backlog is dependency-blocked",
            Impact::Low,
            true,
        ),
    };

    RemediationPlan {
        anomaly,
        action,
        rationale: rationale.to_string(),
        impact,
        safe,
    }
}
