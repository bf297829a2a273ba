//! Orient: fixed-threshold anomaly detection over the latest sample.

use crate::metrics::HealthSample;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// What went wrong, as classified by the threshold rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    StaleTasks,
    DependencyDesync,
    ThroughputDegradation,
    WipStarvation,
    QueueEmpty,
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnomalyKind::StaleTasks => write!(f, "stale_tasks"),
            AnomalyKind::DependencyDesync => write!(f, "dependency_desync"),
            AnomalyKind::ThroughputDegradation => write!(f, "throughput_degradation"),
            AnomalyKind::WipStarvation => write!(f, "wip_starvation"),
            AnomalyKind::QueueEmpty => write!(f, "queue_empty"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// One detected anomaly with the metrics that triggered it.
#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub description: String,
    pub metrics: serde_json::Value,
    pub detected_at: DateTime<Utc>,
}

/// Evaluate the fixed thresholds against `sample`.
///
/// `prior_samples` is the history length before this sample; the throughput
/// rule stays silent until at least 5 prior samples exist so a freshly
/// started monitor does not alert on an empty window.
pub fn detect(sample: &HealthSample, prior_samples: usize, baseline_per_hour: f64) -> Vec<Anomaly> {
    let now = sample.at;
    let mut anomalies = Vec::new();

    if sample.stale_count > 0 {
        let severity = if sample.stale_count >= 3 {
            Severity::Critical
        } else {
            Severity::Warning
        };
        anomalies.push(Anomaly {
            kind: AnomalyKind::StaleTasks,
            severity,
            description: format!(
                "{} in-progress task(s) stale, oldest {}s",
                sample.stale_count, sample.max_stale_age_secs
            ),
            metrics: serde_json::json!({
                "stale_count": sample.stale_count,
                "max_stale_age_secs": sample.max_stale_age_secs,
            }),
            detected_at: now,
        });
    }

    if sample.dependency_sync_ratio < 0.8 {
        let severity = if sample.dependency_sync_ratio < 0.5 {
            Severity::Critical
        } else {
            Severity::Warning
        };
        anomalies.push(Anomaly {
            kind: AnomalyKind::DependencyDesync,
            severity,
            description: format!(
                "dependency table out of sync: {:.0}% of declaring tasks recorded",
                sample.dependency_sync_ratio * 100.0
            ),
            metrics: serde_json::json!({
                "dependency_sync_ratio": sample.dependency_sync_ratio,
            }),
            detected_at: now,
        });
    }

    if prior_samples >= 5 {
        if sample.throughput_recent_hourly == 0.0 {
            anomalies.push(Anomaly {
                kind: AnomalyKind::ThroughputDegradation,
                severity: Severity::Critical,
                description: "no tasks completed in the last 5 minutes".to_string(),
                metrics: serde_json::json!({
                    "throughput_recent_hourly": sample.throughput_recent_hourly,
                    "throughput_last_hour": sample.throughput_last_hour,
                    "baseline_per_hour": baseline_per_hour,
                }),
                detected_at: now,
            });
        } else if sample.throughput_recent_hourly < baseline_per_hour * 0.5 {
            anomalies.push(Anomaly {
                kind: AnomalyKind::ThroughputDegradation,
                severity: Severity::Warning,
                description: format!(
                    "throughput {:.1}/hr below 50% of baseline {:.1}/hr",
                    sample.throughput_recent_hourly, baseline_per_hour
                ),
                metrics: serde_json::json!({
                    "throughput_recent_hourly": sample.throughput_recent_hourly,
                    "baseline_per_hour": baseline_per_hour,
                }),
                detected_at: now,
            });
        }
    }

    if sample.agents_idle > 0 && sample.queue_depth == 0 && sample.pending > 0 {
        anomalies.push(Anomaly {
            kind: AnomalyKind::WipStarvation,
            severity: Severity::Warning,
            description: format!(
                "{} idle agent(s) with an empty queue and {} pending task(s)",
                sample.agents_idle, sample.pending
            ),
            metrics: serde_json::json!({
                "agents_idle": sample.agents_idle,
                "queue_depth": sample.queue_depth,
                "pending": sample.pending,
            }),
            detected_at: now,
        });
    }

    // Expected when the backlog is dependency-blocked; informational only.
    if sample.queue_depth == 0 && sample.pending > 5 && sample.agents_idle > 0 {
        anomalies.push(Anomaly {
            kind: AnomalyKind::QueueEmpty,
            severity: Severity::Info,
            description: format!(
                "queue empty while {} task(s) wait on dependencies",
                sample.pending
            ),
            metrics: serde_json::json!({
                "pending": sample.pending,
                "agents_idle": sample.agents_idle,
            }),
            detected_at: now,
        });
    }

    anomalies
}
