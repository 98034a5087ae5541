//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → limits.rs (request line, header count and size)
//!     → admission.rs (classify, then per-zone token bucket)
//!         → zones.rs (zone policy + limiter)
//!         → rate_limit.rs (per-key bucket)
//!     → headers.rs (strip hop-by-hop, add X-Forwarded-*)
//!     → Forward to backend
//!
//! Outgoing response:
//!     → headers.rs (strip hop-by-hop, inject security headers)
//! ```
//!
//! # Design Decisions
//! - Defense in depth: multiple layers of protection
//! - Fail closed: reject on any security check failure
//! - Denied requests never reach the backend

pub mod admission;
pub mod headers;
pub mod limits;
pub mod rate_limit;
pub mod zones;

pub use admission::{Admission, AdmissionControl, AdmissionPolicy, ClientIdentity};
pub use rate_limit::{Decision, TokenBucketLimiter};
pub use zones::{Zone, ZoneName, ZoneRegistry};
