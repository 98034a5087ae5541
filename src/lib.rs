//! Edge proxy: admission control in front of a socket-activated backend.
//!
//! # Architecture Overview
//!
//! ```text
//!   Client ──TLS──▶ http::server ──▶ http::proxy ──▶ backend socket ──▶ backend process
//!                        │                │                 ▲                  ▲
//!                        │     routing::classifier          │                  │
//!                        │     security::admission          │                  │
//!                        │      (zones, token buckets)      │                  │
//!                        ▼                                  │                  │
//!                  security::limits                  supervisor (socket + process group)
//!                  security::headers                        ▲
//!                                                           │ probe outcomes
//!                                                    health::monitor
//! ```

// Core subsystems
pub mod config;
pub mod error;
pub mod http;
pub mod net;
pub mod routing;

// Backend side
pub mod backend;
pub mod health;
pub mod supervisor;

// Cross-cutting concerns
pub mod admin;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod security;

pub use config::schema::ProxyConfig;
pub use error::ProxyError;
pub use http::HttpServer;
pub use lifecycle::{Gateway, Shutdown};
