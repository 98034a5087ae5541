//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (monitor.rs):
//!     Periodic timer, or a 502 seen by the router
//!     → Probe the backend over the activation socket (not the public path)
//!     → Update state.rs (HealthStatus)
//!     → Report to the supervisor state machine
//!
//! Supervisor (supervisor::state):
//!     Listening → Healthy ⇄ Unhealthy → Crashed
//!     With thresholds to prevent flapping
//! ```
//!
//! # Design Decisions
//! - The monitor observes; only the supervisor transitions
//! - Probes are GETs against a side-effect-free endpoint
//! - Settings are re-read every cycle so reloads apply without a restart

pub mod monitor;
pub mod state;

pub use monitor::{probe_backend, HealthMonitor};
pub use state::{HealthStatus, ProbeOutcome};
