//! Act: execute (or deliberately skip) a remediation plan.

use crate::policy::{RemediationAction, RemediationPlan};
use chrono::Utc;
use foreman_core::{StateStore, TaskRecord, TaskStatus};
use serde::Serialize;
use tracing::{info, warn};

/// What happened when a plan was acted on.
#[derive(Debug, Clone, Serialize)]
pub struct RemediationOutcome {
    pub plan: RemediationPlan,
    pub success: bool,
    pub message: String,
    /// Action-specific counters, e.g. `{"recovered": 4}`.
    pub metrics: Option<serde_json::Value>,
}

/// Execute one plan against the state store.
///
/// Mutating actions are skipped when auto-remediation is disabled or the
/// plan is not marked safe; alert/none actions always log. Never returns an
/// error: a failed remediation is an outcome, not a cycle failure.
pub async fn act(
    store: &dyn StateStore,
    plan: RemediationPlan,
    stale_tasks: &[TaskRecord],
    auto_remediation: bool,
) -> RemediationOutcome {
    match plan.action {
        RemediationAction::AlertOnly => {
            warn!(
                kind = %plan.anomaly.kind,
                severity = %plan.anomaly.severity,
                description = %plan.anomaly.description,
                "anomaly alert"
            );
            outcome(plan, true, "alert raised", None)
        }
        RemediationAction::NoAction => {
            info!(
                kind = %plan.anomaly.kind,
                description = %plan.anomaly.description,
                "anomaly noted, no action"
            );
            outcome(plan, true, "no action required", None)
        }
        RemediationAction::RecoverStaleTasks | RemediationAction::ResyncDependencies
            if !auto_remediation =>
        {
            warn!(
                kind = %plan.anomaly.kind,
                action = %plan.action,
                "auto-remediation disabled, alerting instead"
            );
            outcome(plan, false, "skipped: auto-remediation disabled", None)
        }
        RemediationAction::RecoverStaleTasks | RemediationAction::ResyncDependencies
            if !plan.safe =>
        {
            warn!(kind = %plan.anomaly.kind, action = %plan.action, "plan not marked safe, skipping");
            outcome(plan, false, "skipped: plan not marked safe", None)
        }
        RemediationAction::RecoverStaleTasks => recover_stale_tasks(store, plan, stale_tasks).await,
        RemediationAction::ResyncDependencies => {
            // The safe resync primitive lives outside the monitor; this stays
            // alert-only until one exists.
            warn!(
                description = %plan.anomaly.description,
                "dependency desync detected; resync must be run externally"
            );
            outcome(plan, true, "resync alert raised; no automatic resync wired", None)
        }
    }
}

/// Move every stale in-progress task back to pending, tagged with recovery
/// metadata. A single task's failure is logged and skipped.
async fn recover_stale_tasks(
    store: &dyn StateStore,
    plan: RemediationPlan,
    stale_tasks: &[TaskRecord],
) -> RemediationOutcome {
    let now = Utc::now();
    let mut recovered = 0usize;
    let mut failures = 0usize;

    for task in stale_tasks {
        let age = task.in_progress_age_secs(now).unwrap_or(0);
        let metadata = serde_json::json!({
            "recovered_by": "health_monitor",
            "stale_age_secs": age,
            "recovered_at": now.to_rfc3339(),
        });
        match store.transition(task.id, TaskStatus::Pending, metadata).await {
            Ok(()) => {
                info!(task_id = %task.id, stale_age_secs = age, "stale task recovered");
                recovered += 1;
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "stale task recovery failed");
                failures += 1;
            }
        }
    }

    let message = format!("recovered {recovered} of {} stale task(s)", stale_tasks.len());
    outcome(
        plan,
        failures == 0,
        message,
        Some(serde_json::json!({
            "recovered": recovered,
            "failed": failures,
        })),
    )
}

fn outcome(
    plan: RemediationPlan,
    success: bool,
    message: impl Into<String>,
    metrics: Option<serde_json::Value>,
) -> RemediationOutcome {
    RemediationOutcome {
        plan,
        success,
        message: message.into(),
        metrics,
    }
}
