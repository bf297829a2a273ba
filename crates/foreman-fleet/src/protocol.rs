//! Wire envelopes exchanged with a worker process.
//!
//! Transport is line-delimited JSON over the worker's stdio. The control
//! plane sends [`WorkerRequest`] envelopes; the worker answers with
//! [`WorkerMessage`] lines — call responses plus the three lifecycle signals
//! (ready, log, exit).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outbound call envelope. `id` is unique per proxy and is how the response
/// finds its pending entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: u64,
    pub method: String,
    pub params: serde_json::Value,
}

/// Structured failure reported by the worker for one call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

/// Any inbound line from a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Reply to a [`WorkerRequest`] with the matching `id`.
    Response {
        id: u64,
        #[serde(default)]
        ok: bool,
        #[serde(default)]
        result: Option<serde_json::Value>,
        #[serde(default)]
        error: Option<WireError>,
    },
    /// One-time handshake: the worker is accepting calls.
    Ready {
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        flags: Vec<String>,
    },
    /// Log line relayed from the worker. No state change.
    Log {
        #[serde(default = "default_log_level")]
        level: String,
        message: String,
    },
    /// The worker is going away.
    Exit {
        reason: String,
        #[serde(default)]
        code: Option<i32>,
        #[serde(default)]
        signal: Option<String>,
    },
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Version and feature flags reported in the ready handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadyInfo {
    pub version: Option<String>,
    pub flags: Vec<String>,
}

/// Why and how a worker process ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitRecord {
    pub reason: String,
    pub code: Option<i32>,
    pub signal: Option<String>,
    pub at: DateTime<Utc>,
}
