//! The proxy handler.
//!
//! Normalizes the request, runs admission, and forwards admitted requests to
//! the backend socket. Denied requests never reach the backend.

use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, Request, Uri, Version},
    response::{IntoResponse, Response},
};

use crate::error::ProxyError;
use crate::http::request::{normalize_path, RequestIdExt};
use crate::http::response::{from_backend, with_idle_timeout};
use crate::http::server::AppState;
use crate::observability::metrics;
use crate::security::admission::{Admission, ClientIdentity};
use crate::security::headers::{add_forwarding_headers, strip_hop_by_hop};
use crate::security::limits::RequestRejection;

/// Main proxy handler.
pub async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let version = request.version();
    let request_id = request.request_id().to_string();

    let path = match normalize_path(request.uri().path()) {
        Ok(path) => path,
        Err(rejection) => {
            tracing::warn!(request_id = %request_id, path = %request.uri().path(), "Rejected unnormalizable path");
            metrics::record_rejection(rejection.status());
            return ProxyError::RequestRejected(rejection).into_response();
        }
    };

    let client = ClientIdentity::new(peer.ip(), request.headers());
    let zone = match state.admission.check(&method, &path, &client) {
        Admission::Unclassified => None,
        Admission::Admitted { zone } => Some(zone),
        Admission::Denied { zone, retry_after } => {
            tracing::info!(
                request_id = %request_id,
                zone = %zone,
                client = %peer.ip(),
                ?retry_after,
                "Admission denied"
            );
            metrics::record_rate_limited(&zone);
            metrics::record_request(method.as_str(), 429, Some(&zone), start);
            return ProxyError::AdmissionDenied { zone, retry_after }.into_response_for(version);
        }
    };

    tracing::debug!(
        request_id = %request_id,
        method = %method,
        path = %path,
        zone = zone.as_deref().unwrap_or("none"),
        "Proxying request"
    );

    let (mut parts, body) = request.into_parts();
    let target = match parts.uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };
    let authority = parts.uri.authority().cloned();
    parts.uri = match Uri::try_from(target) {
        Ok(uri) => uri,
        Err(_) => {
            metrics::record_rejection(RequestRejection::BadPath.status());
            return ProxyError::RequestRejected(RequestRejection::BadPath).into_response();
        }
    };

    strip_hop_by_hop(&mut parts.headers);
    // HTTP/2 clients carry the host in the authority only.
    if !parts.headers.contains_key(header::HOST) {
        if let Some(value) = authority.and_then(|a| HeaderValue::from_str(a.as_str()).ok()) {
            parts.headers.insert(header::HOST, value);
        }
    }
    add_forwarding_headers(&mut parts.headers, peer.ip(), state.scheme);
    parts.version = Version::HTTP_11;

    let idle = state.timeouts.idle();
    let outbound = Request::from_parts(parts, with_idle_timeout(body, idle));
    let response_timeout = state.timeouts.backend_response();

    let response = match tokio::time::timeout(response_timeout, state.client.send(outbound)).await {
        Ok(Ok(response)) => from_backend(response, idle),
        Ok(Err(e)) => {
            tracing::error!(
                request_id = %request_id,
                error = %e,
                connect = e.is_connect(),
                "Backend unavailable"
            );
            state.probe_now.notify_one();
            ProxyError::BackendUnavailable(e).into_response()
        }
        Err(_) => {
            tracing::warn!(request_id = %request_id, timeout = ?response_timeout, "Backend response timed out");
            ProxyError::BackendTimeout(response_timeout).into_response()
        }
    };

    metrics::record_request(method.as_str(), response.status().as_u16(), zone.as_deref(), start);
    response
}
