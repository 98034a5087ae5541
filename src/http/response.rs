//! Response handling and transformation.
//!
//! # Responsibilities
//! - Transform backend response for client
//! - Strip hop-by-hop headers
//! - Stream bodies in both directions with an idle timeout
//!
//! # Design Decisions
//! - Streaming responses avoid buffering entire body
//! - A stalled peer ends the body with an error instead of holding the
//!   connection open; dropping the stream drops the backend connection

use std::time::Duration;

use axum::body::Body;
use axum::http::Response;
use futures_util::{stream, StreamExt};
use hyper::body::Incoming;
use thiserror::Error;

use crate::security::headers::strip_hop_by_hop;

/// No chunk arrived within the idle window.
#[derive(Debug, Error)]
#[error("body idle for more than {0:?}")]
pub struct IdleTimeout(pub Duration);

/// Wrap `body` so that each chunk must arrive within `idle`.
pub fn with_idle_timeout(body: Body, idle: Duration) -> Body {
    let chunks = stream::unfold(Some(body.into_data_stream()), move |state| async move {
        let mut chunks = state?;
        match tokio::time::timeout(idle, chunks.next()).await {
            Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some(chunks))),
            Ok(Some(Err(e))) => Some((Err(e), None)),
            Ok(None) => None,
            Err(_) => Some((Err(axum::Error::new(IdleTimeout(idle))), None)),
        }
    });
    Body::from_stream(chunks)
}

/// Turn a backend response into the client response.
pub fn from_backend(response: Response<Incoming>, idle: Duration) -> Response<Body> {
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Response::from_parts(parts, with_idle_timeout(Body::new(body), idle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;

    #[tokio::test]
    async fn passes_chunks_through() {
        let source = stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ]);
        let body = with_idle_timeout(Body::from_stream(source), Duration::from_secs(1));
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"hello world");
    }

    #[tokio::test]
    async fn stalled_body_errors_after_idle_window() {
        let source = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(b"partial"))])
            .chain(stream::pending());
        let body = with_idle_timeout(Body::from_stream(source), Duration::from_millis(50));

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            axum::body::to_bytes(body, usize::MAX),
        )
        .await
        .expect("idle timeout should end the body");
        assert!(result.is_err());
    }
}
