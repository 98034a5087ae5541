//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → tls.rs (optional TLS handshake, SNI certificate selection)
//!     → Hand off to HTTP layer
//! ```

pub mod tls;

pub use tls::{load_tls_config, reload_tls_config};
