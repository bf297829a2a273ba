use crate::error::{ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hard cap on the executor pool, regardless of configuration.
pub const MAX_EXECUTORS: usize = 8;

/// Control-plane configuration.
///
/// Every field has a default so a config file only needs to name what it
/// changes. `validate` clamps out-of-range values rather than failing where
/// a safe bound exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForemanConfig {
    /// Desired executor pool size. Clamped to `MAX_EXECUTORS`. Zero drains
    /// the pool.
    #[serde(default)]
    pub desired_executors: usize,

    /// Seconds a freshly spawned worker has to report readiness.
    #[serde(default = "default_startup_deadline")]
    pub startup_deadline_secs: u64,

    /// Default per-call deadline. Generous because some operations
    /// legitimately run for minutes.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Per-proxy deadline for snapshot health checks.
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_secs: u64,

    /// Interval of the manager's background snapshot loop.
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,

    /// Capacity of the fleet event ring buffer.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Capacity of the monitor's metric/anomaly/remediation histories.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Seconds an in-progress task may run before it counts as stale.
    #[serde(default = "default_stale_threshold")]
    pub stale_task_threshold_secs: u64,

    /// Interval between health monitor cycles.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,

    /// When false, the monitor only alerts; it never executes remediations.
    #[serde(default = "default_true")]
    pub auto_remediation: bool,

    /// Expected tasks-per-hour used by the throughput degradation check.
    #[serde(default = "default_baseline_throughput")]
    pub baseline_throughput_per_hour: f64,

    /// Interval between periodic telemetry exports.
    #[serde(default = "default_export_interval")]
    pub export_interval_secs: u64,

    /// Directory for snapshot/export records. Telemetry is disabled when
    /// unset.
    #[serde(default)]
    pub telemetry_dir: Option<PathBuf>,
}

fn default_startup_deadline() -> u64 {
    20
}
fn default_call_timeout() -> u64 {
    300
}
fn default_health_check_timeout() -> u64 {
    5
}
fn default_snapshot_interval() -> u64 {
    30
}
fn default_event_capacity() -> usize {
    50
}
fn default_history_capacity() -> usize {
    100
}
fn default_stale_threshold() -> u64 {
    1800
}
fn default_monitor_interval() -> u64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_baseline_throughput() -> f64 {
    10.0
}
fn default_export_interval() -> u64 {
    300
}

impl Default for ForemanConfig {
    fn default() -> Self {
        // serde defaults are the single source of truth
        #[allow(clippy::expect_used)]
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

impl ForemanConfig {
    /// Load from a TOML file.
    pub async fn from_file(path: impl AsRef<Path>) -> ForemanResult<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        let config = Self::from_toml(&raw)?;
        tracing::info!(path = %path.as_ref().display(), "configuration loaded");
        Ok(config)
    }

    /// Parse from a TOML string.
    pub fn from_toml(raw: &str) -> ForemanResult<Self> {
        let config: ForemanConfig =
            toml::from_str(raw).map_err(|e| ForemanError::Config(e.to_string()))?;
        config.validate()
    }

    /// Clamp out-of-range values and reject the unrecoverable ones.
    pub fn validate(mut self) -> ForemanResult<Self> {
        self.desired_executors = self.desired_executors.min(MAX_EXECUTORS);
        self.event_capacity = self.event_capacity.max(1);
        self.history_capacity = self.history_capacity.max(1);
        self.baseline_throughput_per_hour = self.baseline_throughput_per_hour.max(0.0);
        if self.monitor_interval_secs == 0 {
            return Err(ForemanError::Config(
                "monitor_interval_secs must be positive".into(),
            ));
        }
        if self.startup_deadline_secs == 0 || self.call_timeout_secs == 0 {
            return Err(ForemanError::Config(
                "startup and call deadlines must be positive".into(),
            ));
        }
        Ok(self)
    }

    pub fn startup_deadline(&self) -> Duration {
        Duration::from_secs(self.startup_deadline_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn export_interval(&self) -> Duration {
        Duration::from_secs(self.export_interval_secs)
    }
}
