//! Self-healing health monitor for the task/agent control plane.
//!
//! Runs a repeating observe → orient → decide → act cycle: sample task and
//! agent state through the [`foreman_core::StateStore`] /
//! [`foreman_core::AgentPool`] seams, detect anomalies against fixed
//! thresholds, map each to exactly one action through a static policy, and
//! execute the safe ones. Every history is a bounded ring.
//!
//! # Main types
//!
//! - [`HealthMonitor`] — the loop itself.
//! - [`HealthSample`] / [`Anomaly`] / [`RemediationPlan`] /
//!   [`RemediationOutcome`] — one cycle's artifacts, in order.

/// Orient: threshold-based anomaly detection.
pub mod detect;
/// Observe: metrics sampling.
pub mod metrics;
/// The repeating cycle.
pub mod monitor;
/// Decide: the fixed anomaly-to-action policy.
pub mod policy;
/// Act: remediation execution.
pub mod remediate;

pub use detect::{detect, Anomaly, AnomalyKind, Severity};
pub use metrics::{observe, HealthSample, ObserveResult};
pub use monitor::HealthMonitor;
pub use policy::{plan, Impact, RemediationAction, RemediationPlan};
pub use remediate::{act, RemediationOutcome};
