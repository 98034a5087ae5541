//! Request line and header limits.
//!
//! # Responsibilities
//! - Enforce maximum request line length (414 URI Too Long)
//! - Enforce maximum header count and field size (431)
//!
//! # Design Decisions
//! - Checked before admission, so oversized requests never consume tokens
//! - Body size is enforced separately by `RequestBodyLimitLayer` (413)

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode, Version},
    middleware::Next,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::config::LimitsConfig;
use crate::error::ProxyError;

/// Reasons a request is refused before admission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestRejection {
    #[error("request line of {len} bytes exceeds {limit}")]
    UriTooLong { len: usize, limit: usize },

    #[error("{count} header fields exceed {limit}")]
    TooManyHeaders { count: usize, limit: usize },

    #[error("header field {name} of {len} bytes exceeds {limit}")]
    HeaderTooLarge {
        name: String,
        len: usize,
        limit: usize,
    },

    #[error("path escapes the root or is malformed")]
    BadPath,
}

impl RequestRejection {
    pub fn status(&self) -> StatusCode {
        match self {
            RequestRejection::UriTooLong { .. } => StatusCode::URI_TOO_LONG,
            RequestRejection::TooManyHeaders { .. } | RequestRejection::HeaderTooLarge { .. } => {
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
            }
            RequestRejection::BadPath => StatusCode::BAD_REQUEST,
        }
    }
}

fn version_len(version: Version) -> usize {
    match version {
        Version::HTTP_09 | Version::HTTP_10 | Version::HTTP_11 => "HTTP/1.1".len(),
        _ => "HTTP/2".len(),
    }
}

/// Check a request's head against `limits`.
pub fn check_request<B>(request: &Request<B>, limits: &LimitsConfig) -> Result<(), RequestRejection> {
    let target_len = request
        .uri()
        .path_and_query()
        .map_or(1, |pq| pq.as_str().len());
    // "METHOD SP target SP version"
    let line_len = request.method().as_str().len() + 1 + target_len + 1 + version_len(request.version());
    if line_len > limits.max_request_line {
        return Err(RequestRejection::UriTooLong {
            len: line_len,
            limit: limits.max_request_line,
        });
    }

    let count = request.headers().len();
    if count > limits.max_headers {
        return Err(RequestRejection::TooManyHeaders {
            count,
            limit: limits.max_headers,
        });
    }

    for (name, value) in request.headers() {
        // "name: value"
        let len = name.as_str().len() + 2 + value.len();
        if len > limits.max_header_size {
            return Err(RequestRejection::HeaderTooLarge {
                name: name.to_string(),
                len,
                limit: limits.max_header_size,
            });
        }
    }
    Ok(())
}

/// Middleware rejecting requests over the configured limits.
pub async fn enforce_limits(
    State(limits): State<Arc<LimitsConfig>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match check_request(&request, &limits) {
        Ok(()) => next.run(request).await,
        Err(rejection) => {
            tracing::warn!(
                method = %request.method(),
                error = %rejection,
                "Request rejected by limits"
            );
            crate::observability::metrics::record_rejection(rejection.status());
            ProxyError::RequestRejected(rejection).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str) -> Request<()> {
        Request::builder().uri(uri).body(()).unwrap()
    }

    #[test]
    fn accepts_ordinary_request() {
        assert_eq!(check_request(&request("/api/colleagues/?page=2"), &LimitsConfig::default()), Ok(()));
    }

    #[test]
    fn long_request_line_is_414() {
        let uri = format!("/api/{}", "a".repeat(4100));
        let err = check_request(&request(&uri), &LimitsConfig::default()).unwrap_err();
        assert_eq!(err.status(), StatusCode::URI_TOO_LONG);
    }

    #[test]
    fn request_line_at_limit_is_accepted() {
        // GET + SP + target + SP + HTTP/1.1 == 4094
        let target = format!("/{}", "a".repeat(4094 - 4 - 1 - 8 - 1));
        assert_eq!(check_request(&request(&target), &LimitsConfig::default()), Ok(()));
    }

    #[test]
    fn too_many_headers_is_431() {
        let mut builder = Request::builder().uri("/");
        for i in 0..101 {
            builder = builder.header(format!("x-h{i}"), "v");
        }
        let err = check_request(&builder.body(()).unwrap(), &LimitsConfig::default()).unwrap_err();
        assert!(matches!(err, RequestRejection::TooManyHeaders { count: 101, .. }));
        assert_eq!(err.status(), StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
    }

    #[test]
    fn oversized_header_field_is_431() {
        let req = Request::builder()
            .uri("/")
            .header("cookie", "x".repeat(8200))
            .body(())
            .unwrap();
        let err = check_request(&req, &LimitsConfig::default()).unwrap_err();
        assert!(matches!(err, RequestRejection::HeaderTooLarge { ref name, .. } if name == "cookie"));
    }
}
