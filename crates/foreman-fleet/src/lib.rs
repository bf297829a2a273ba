//! Worker process orchestration: lifecycle, call protocol, and blue/green
//! upgrades.
//!
//! A [`WorkerProxy`] owns exactly one worker process and implements the
//! timeout/cancellation-safe call protocol over its stdio. The
//! [`WorkerManager`] owns the fleet — at most one active proxy, at most one
//! canary, and a bounded executor pool — and aggregates per-proxy health
//! into a persisted [`FleetSnapshot`].
//!
//! # Main types
//!
//! - [`WorkerProxy`] — call/response, readiness gating, disposal for one
//!   worker.
//! - [`WorkerManager`] — fleet ownership, canary promotion, executor pool
//!   reconciliation, snapshots.
//! - [`WorkerLauncher`] / [`ProcessLauncher`] — the process spawn boundary.
//! - [`protocol`] — the wire envelopes.

/// Spawn boundary: spawn parameters, launcher trait, process launcher.
pub mod launch;
/// Fleet ownership and blue/green policy.
pub mod manager;
/// Wire envelopes.
pub mod protocol;
/// Per-worker proxy.
pub mod proxy;

pub use launch::{ProcessLauncher, WorkerLauncher, WorkerSpawnSpec};
pub use manager::{
    FleetEvent, FleetEventKind, FleetSnapshot, FleetStatus, ProxyInfo, StartOptions, SwitchReport,
    WorkerManager,
};
pub use protocol::{ExitRecord, ReadyInfo, WireError, WorkerMessage, WorkerRequest};
pub use proxy::{HealthReading, ProxyOptions, ProxyStatus, WorkerProxy};
