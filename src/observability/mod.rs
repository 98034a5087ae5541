//! Logs and metrics.
//!
//! # Data Flow
//! ```text
//! proxy handler   → request counters, latency histogram, 429/4xx rejections
//! admission sweep → tracked keys per zone
//! supervisor      → backend state gauge, restart counter
//! health monitor  → probe outcomes
//!     ↓
//! logging.rs (text or JSON lines on stdout)
//! metrics.rs (Prometheus scrape endpoint, when enabled)
//! ```
//!
//! # Design Decisions
//! - Every log line inside a request carries its request ID via the trace span
//! - Metric calls are no-ops until a recorder is installed

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
