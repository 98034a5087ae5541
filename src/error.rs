//! Error taxonomy for the admission and supervision layer.
//!
//! # Design Decisions
//! - Recoverable conditions (`AdmissionDenied`, `BackendUnavailable`,
//!   `ProbeTimeout`) surface only as an HTTP status or a restart action
//! - `ConfigInvalid` is the only error that aborts startup
//! - Every variant maps to exactly one response status

use std::io;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, HeaderValue, StatusCode, Version},
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::backend::BackendError;
use crate::config::loader::ConfigError;
use crate::security::limits::RequestRejection;
use crate::security::zones::ZoneName;
use crate::supervisor::{ExitKind, SupervisorError};

/// Top-level error for the proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The zone's token bucket for this client is empty.
    #[error("rate limit exceeded in zone {zone}")]
    AdmissionDenied {
        zone: ZoneName,
        retry_after: Duration,
    },

    /// The backend socket is missing, refused the connection, or dropped it.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[source] BackendError),

    /// The backend accepted the request but sent no response headers in time.
    #[error("backend did not respond within {0:?}")]
    BackendTimeout(Duration),

    /// The backend process exited unexpectedly.
    #[error("backend crashed: {0}")]
    BackendCrashed(ExitKind),

    /// Malformed configuration. Fatal at startup, rejected on reload.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(#[from] ConfigError),

    /// Health probe did not complete in time.
    #[error("health probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    /// Health probe completed with a non-success status.
    #[error("health probe returned {0}")]
    ProbeRejected(StatusCode),

    /// Request refused before admission (size limits, bad path).
    #[error("request rejected: {0}")]
    RequestRejected(#[from] RequestRejection),

    /// Backend socket or process could not be set up.
    #[error("startup failed: {0}")]
    Startup(#[from] SupervisorError),

    /// A public or admin listener could not be bound.
    #[error("listener failed: {0}")]
    Listen(#[source] io::Error),
}

impl ProxyError {
    /// Status code returned to the client for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::AdmissionDenied { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::BackendUnavailable(_) | ProxyError::BackendCrashed(_) => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::BackendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::RequestRejected(rejection) => rejection.status(),
            ProxyError::ProbeTimeout(_) | ProxyError::ProbeRejected(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::ConfigInvalid(_) | ProxyError::Startup(_) | ProxyError::Listen(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Build the client response, closing HTTP/1 connections of denied clients
    /// so a throttled client does not hold a connection slot.
    pub fn into_response_for(self, version: Version) -> Response {
        let close = matches!(self, ProxyError::AdmissionDenied { .. })
            && version <= Version::HTTP_11;
        let mut response = self.into_response();
        if close {
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
        response
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = Response::new(Body::from(
            status.canonical_reason().unwrap_or("Error").to_string(),
        ));
        *response.status_mut() = status;

        if let ProxyError::AdmissionDenied { retry_after, .. } = &self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs(*retry_after)));
        }
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        response
    }
}

/// Whole seconds for a `Retry-After` header, rounded up and never zero.
pub fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs_f64().ceil() as u64;
    secs.max(1)
}
