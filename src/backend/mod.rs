//! Backend connectivity.
//!
//! The backend is reached only through the activation socket owned by the
//! supervisor. Its path never changes across restarts, so the client is
//! built once at startup.

pub mod client;

pub use client::{BackendClient, BackendError};
