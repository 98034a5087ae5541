//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Backend crash:
//!     → supervisor state machine enters Crashed
//!     → backoff.rs (exponential delay with jitter)
//!     → restart when the delay elapses
//!
//! Sustained health:
//!     → backoff.rs resets, so the next crash restarts quickly
//! ```
//!
//! # Design Decisions
//! - Restart delays grow per consecutive crash to avoid restart storms
//! - Jitter spreads restarts of co-located proxies
//! - Timeouts live with the code that waits (client, proxy, monitor)

pub mod backoff;

pub use backoff::{calculate_backoff, RestartBackoff};
