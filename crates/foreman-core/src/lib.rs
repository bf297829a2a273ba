//! Shared foundation for the foreman control plane.
//!
//! Holds the pieces every other crate leans on: the error taxonomy,
//! worker/task/agent-pool types, validated configuration, fixed-capacity
//! ring buffers, the seams to external collaborators (state store, agent
//! pool), and the JSON telemetry sink.
//!
//! # Main types
//!
//! - [`ForemanError`] / [`ForemanResult`] — workspace-wide error taxonomy.
//! - [`ForemanConfig`] — validated, clamped control-plane configuration.
//! - [`RingBuffer`] — bounded FIFO history used for every operational log.
//! - [`StateStore`] / [`AgentPool`] — traits the external collaborators
//!   implement.
//! - [`JsonTelemetrySink`] — durable JSON record writer.

/// Control-plane configuration and clamping.
pub mod config;
/// Error taxonomy.
pub mod error;
/// Fixed-capacity FIFO buffer.
pub mod ring;
/// External collaborator traits.
pub mod store;
/// Durable telemetry sink.
pub mod telemetry;
/// Shared worker/task/agent types.
pub mod types;

pub use config::{ForemanConfig, MAX_EXECUTORS};
pub use error::{ForemanError, ForemanResult};
pub use ring::RingBuffer;
pub use store::{AgentPool, StateStore};
pub use telemetry::JsonTelemetrySink;
pub use types::{AgentPoolStatus, ExecutionMode, TaskRecord, TaskStatus, WorkerRole};

/// Install the default tracing subscriber (env-filtered, no-op if one is
/// already set).
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
