use crate::types::WorkerRole;
use thiserror::Error;

/// Convenience alias used across the workspace.
pub type ForemanResult<T> = Result<T, ForemanError>;

/// Error taxonomy for the control plane.
///
/// Call-level failures (`CallTimeout`, `Remote`) return to the immediate
/// caller. Process-level failures (`StartupTimeout`, `ProcessExit`) also move
/// the owning proxy to a terminal state. Role violations are rejected
/// synchronously with no state change.
#[derive(Error, Debug)]
pub enum ForemanError {
    #[error("worker '{label}' missed its readiness deadline")]
    StartupTimeout { label: String },

    #[error("call '{method}' timed out after {timeout_ms}ms")]
    CallTimeout { method: String, timeout_ms: u64 },

    #[error("worker error {code:?}: {message}")]
    Remote {
        message: String,
        code: Option<i64>,
        details: Option<serde_json::Value>,
    },

    #[error("worker '{label}' exited: {reason}")]
    ProcessExit {
        label: String,
        reason: String,
        code: Option<i32>,
        signal: Option<String>,
    },

    #[error("a {0} worker is already running")]
    DuplicateRole(WorkerRole),

    #[error("refusing to start an active worker with mutations disabled")]
    UnsafeMutationMode,

    #[error("no ready canary worker to promote")]
    NoReadyCanary,

    #[error("state store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForemanError {
    /// True for errors that indicate the worker process itself is gone.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ForemanError::StartupTimeout { .. } | ForemanError::ProcessExit { .. }
        )
    }
}
