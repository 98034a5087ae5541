//! HTTP/1.1 client for the backend's unix socket.
//!
//! # Responsibilities
//! - Connect to the activation socket for each forwarded request
//! - Perform the HTTP/1 handshake with bounded buffers
//! - Distinguish "cannot reach the backend" from "backend failed mid-request"
//!
//! # Design Decisions
//! - One connection per request: a dropped client future drops the request
//!   sender and the backend connection with it
//! - No retries here; the caller decides what a failure means

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::UnixStream;

/// Smallest read buffer hyper accepts.
const MIN_BUF_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum BackendError {
    /// Socket path missing or connection refused.
    #[error("connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("handshake failed: {0}")]
    Handshake(#[source] hyper::Error),

    /// The backend accepted the connection but failed the exchange.
    #[error("request failed: {0}")]
    Request(#[source] hyper::Error),
}

impl BackendError {
    /// True when the socket could not be reached at all.
    pub fn is_connect(&self) -> bool {
        matches!(self, BackendError::Connect { .. } | BackendError::ConnectTimeout(_))
    }
}

/// Client for one backend socket.
#[derive(Debug, Clone)]
pub struct BackendClient {
    socket_path: PathBuf,
    connect_timeout: Duration,
    max_buf_size: usize,
}

impl BackendClient {
    pub fn new(socket_path: impl Into<PathBuf>, connect_timeout: Duration, max_buf_size: usize) -> Self {
        Self {
            socket_path: socket_path.into(),
            connect_timeout,
            max_buf_size: max_buf_size.max(MIN_BUF_SIZE),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn connect(&self) -> Result<UnixStream, BackendError> {
        match tokio::time::timeout(self.connect_timeout, UnixStream::connect(&self.socket_path)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(BackendError::Connect {
                path: self.socket_path.clone(),
                source,
            }),
            Err(_) => Err(BackendError::ConnectTimeout(self.connect_timeout)),
        }
    }

    /// Send `request` and return once response headers arrive. The body
    /// streams from the backend as the caller polls it.
    pub async fn send(&self, request: Request<Body>) -> Result<Response<Incoming>, BackendError> {
        let stream = self.connect().await?;

        let (mut sender, connection) = hyper::client::conn::http1::Builder::new()
            .max_buf_size(self.max_buf_size)
            .handshake::<_, Body>(TokioIo::new(stream))
            .await
            .map_err(BackendError::Handshake)?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "Backend connection closed with error");
            }
        });

        sender.send_request(request).await.map_err(BackendError::Request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_socket_is_connect_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = BackendClient::new(dir.path().join("absent.sock"), Duration::from_secs(1), 0);

        let err = client
            .send(Request::new(Body::empty()))
            .await
            .unwrap_err();
        assert!(err.is_connect());
        assert!(matches!(err, BackendError::Connect { ref source, .. } if source.kind() == io::ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn forwards_over_unix_socket() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"GET /api/health/ HTTP/1.1\r\n"));
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                .await
                .unwrap();
        });

        let client = BackendClient::new(&path, Duration::from_secs(1), 16 * 1024);
        let request = Request::builder()
            .uri("/api/health/")
            .header("host", "localhost")
            .body(Body::empty())
            .unwrap();
        let response = client.send(request).await.unwrap();
        assert_eq!(response.status(), 200);
    }
}
