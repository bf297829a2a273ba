//! The process spawn boundary: how a worker entry point is resolved and
//! started with role-specific configuration.

use crate::proxy::{ProxyOptions, WorkerProxy};
use async_trait::async_trait;
use foreman_core::{ExecutionMode, ForemanResult, WorkerRole};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Everything the launcher needs to start one worker.
#[derive(Debug, Clone)]
pub struct WorkerSpawnSpec {
    pub label: String,
    pub role: WorkerRole,
    pub mode: ExecutionMode,
    /// Feature flags forwarded to the worker at startup.
    pub feature_flags: Vec<String>,
    pub startup_deadline: Duration,
    /// Self-disposal deadline for ephemeral workers.
    pub idle_timeout: Option<Duration>,
}

impl WorkerSpawnSpec {
    fn proxy_options(&self) -> ProxyOptions {
        ProxyOptions {
            label: self.label.clone(),
            role: self.role,
            mode: self.mode,
            startup_deadline: self.startup_deadline,
            idle_timeout: self.idle_timeout,
        }
    }
}

/// Seam between the manager and whatever actually starts workers.
///
/// Production uses [`ProcessLauncher`]; tests substitute scripted in-memory
/// transports.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, spec: &WorkerSpawnSpec) -> ForemanResult<Arc<WorkerProxy>>;
}

/// Spawns the configured worker entry point as an OS process with
/// role-specific environment.
pub struct ProcessLauncher {
    entry_point: PathBuf,
    base_env: Vec<(String, String)>,
}

impl ProcessLauncher {
    pub fn new(entry_point: impl Into<PathBuf>) -> Self {
        Self {
            entry_point: entry_point.into(),
            base_env: Vec::new(),
        }
    }

    /// Extra environment applied to every worker, before the role-specific
    /// variables.
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.base_env = env;
        self
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, spec: &WorkerSpawnSpec) -> ForemanResult<Arc<WorkerProxy>> {
        let mut env = self.base_env.clone();
        env.push(("FOREMAN_ROLE".to_string(), spec.role.to_string()));
        env.push((
            "FOREMAN_MUTATIONS".to_string(),
            match spec.mode {
                ExecutionMode::Mutating => "enabled".to_string(),
                ExecutionMode::ReadOnly => "disabled".to_string(),
            },
        ));
        env.push((
            "FOREMAN_FEATURES".to_string(),
            spec.feature_flags.join(","),
        ));

        WorkerProxy::spawn(spec.proxy_options(), &self.entry_point, &env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> WorkerSpawnSpec {
        WorkerSpawnSpec {
            label: "executor-1".to_string(),
            role: WorkerRole::Executor,
            mode: ExecutionMode::Mutating,
            feature_flags: vec!["batch_ops".to_string()],
            startup_deadline: Duration::from_millis(100),
            idle_timeout: None,
        }
    }

    #[tokio::test]
    async fn test_launch_missing_entry_point_fails() {
        let launcher = ProcessLauncher::new("/nonexistent/foreman-worker");
        assert!(launcher.launch(&spec()).await.is_err());
    }

    #[test]
    fn test_proxy_options_carry_spec() {
        let opts = spec().proxy_options();
        assert_eq!(opts.label, "executor-1");
        assert_eq!(opts.role, WorkerRole::Executor);
        assert_eq!(opts.mode, ExecutionMode::Mutating);
        assert_eq!(opts.startup_deadline, Duration::from_millis(100));
    }
}
