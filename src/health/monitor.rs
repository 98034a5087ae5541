//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe the backend through its socket
//! - Probe immediately when the router reports the backend unreachable
//! - Optionally verify the public listener accepts connections
//! - Feed outcomes to the supervisor

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::http::{header, Method, Request};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time;

use crate::backend::BackendClient;
use crate::config::HealthCheckConfig;
use crate::error::ProxyError;
use crate::health::state::HealthStatus;
use crate::observability::metrics;
use crate::security::limits::RequestRejection;
use crate::supervisor::SupervisorHandle;

/// Probe the backend's health endpoint once.
pub async fn probe_backend(client: &BackendClient, config: &HealthCheckConfig) -> Result<(), ProxyError> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(config.path.as_str())
        .header(header::HOST, config.host.as_str())
        .header(header::USER_AGENT, "edge-proxy-health-check")
        .body(Body::empty())
        .map_err(|_| ProxyError::RequestRejected(RequestRejection::BadPath))?;

    let timeout = config.timeout();
    match time::timeout(timeout, client.send(request)).await {
        Ok(Ok(response)) if response.status().is_success() => Ok(()),
        Ok(Ok(response)) => Err(ProxyError::ProbeRejected(response.status())),
        Ok(Err(e)) => Err(ProxyError::BackendUnavailable(e)),
        Err(_) => Err(ProxyError::ProbeTimeout(timeout)),
    }
}

pub struct HealthMonitor {
    client: BackendClient,
    supervisor: SupervisorHandle,
    config: Arc<ArcSwap<HealthCheckConfig>>,
    router_addr: Option<SocketAddr>,
    probe_now: Arc<Notify>,
    status: watch::Sender<HealthStatus>,
}

impl HealthMonitor {
    pub fn new(
        client: BackendClient,
        supervisor: SupervisorHandle,
        config: Arc<ArcSwap<HealthCheckConfig>>,
        probe_now: Arc<Notify>,
    ) -> (Self, watch::Receiver<HealthStatus>) {
        let (status, status_rx) = watch::channel(HealthStatus::default());
        (
            Self {
                client,
                supervisor,
                config,
                router_addr: None,
                probe_now,
                status,
            },
            status_rx,
        )
    }

    /// Also check that the public listener at `addr` accepts connections.
    pub fn with_router(mut self, addr: SocketAddr) -> Self {
        self.router_addr = Some(addr);
        self
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            interval = ?self.config.load().interval(),
            path = %self.config.load().path,
            "Health monitor starting"
        );

        let mut last_pid = None;
        loop {
            let interval = self.config.load().interval();
            tokio::select! {
                _ = time::sleep(interval) => {}
                _ = self.probe_now.notified() => {
                    tracing::debug!("Immediate probe requested");
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }

            let config = self.config.load_full();
            if !config.enabled {
                continue;
            }

            let snapshot = self.supervisor.snapshot();
            if snapshot.pid != last_pid {
                last_pid = snapshot.pid;
                self.status.send_modify(HealthStatus::reset);
            }
            if let (true, Some(pid)) = (snapshot.state.is_probeable(), snapshot.pid) {
                self.check_backend(pid, &config).await;
            }
            if config.probe_router {
                self.check_router(&config).await;
            }
        }
    }

    async fn check_backend(&self, pid: u32, config: &HealthCheckConfig) {
        let result = probe_backend(&self.client, config).await;
        let now = SystemTime::now();
        metrics::record_probe(result.is_ok());

        match result {
            Ok(()) => {
                self.status.send_modify(|s| s.record_success(now));
                self.supervisor.report_probe(pid, true, 0).await;
            }
            Err(e) => {
                let mut consecutive = 0;
                self.status.send_modify(|s| consecutive = s.record_failure(e.to_string(), now));
                tracing::warn!(error = %e, consecutive, "Health check failed");
                self.supervisor.report_probe(pid, false, consecutive).await;
            }
        }
    }

    async fn check_router(&self, config: &HealthCheckConfig) {
        let Some(addr) = self.router_addr else {
            return;
        };
        let reachable = matches!(
            time::timeout(config.timeout(), TcpStream::connect(addr)).await,
            Ok(Ok(_))
        );
        if !reachable {
            tracing::warn!(address = %addr, "Router listener did not accept a probe connection");
        }
        self.status.send_modify(|s| s.router_reachable = Some(reachable));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    fn config(timeout_ms: u64) -> HealthCheckConfig {
        HealthCheckConfig {
            timeout_ms,
            ..HealthCheckConfig::default()
        }
    }

    async fn one_shot_backend(listener: UnixListener, reply: &'static [u8]) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        assert!(buf[..n].starts_with(b"GET /api/health/ HTTP/1.1"));
        stream.write_all(reply).await.unwrap();
    }

    #[tokio::test]
    async fn probe_ok_on_2xx() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(one_shot_backend(listener, b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n"));

        let client = BackendClient::new(&path, Duration::from_secs(1), 8192);
        assert!(probe_backend(&client, &config(1000)).await.is_ok());
    }

    #[tokio::test]
    async fn probe_rejected_on_5xx() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(one_shot_backend(
            listener,
            b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\n\r\n",
        ));

        let client = BackendClient::new(&path, Duration::from_secs(1), 8192);
        let err = probe_backend(&client, &config(1000)).await.unwrap_err();
        assert!(matches!(err, ProxyError::ProbeRejected(s) if s == 503));
    }

    #[tokio::test]
    async fn probe_times_out_when_backend_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.sock");
        // Bound and listening, but nobody ever accepts.
        let _listener = UnixListener::bind(&path).unwrap();

        let client = BackendClient::new(&path, Duration::from_secs(1), 8192);
        let err = probe_backend(&client, &config(100)).await.unwrap_err();
        assert!(matches!(err, ProxyError::ProbeTimeout(_)));
    }

    #[tokio::test]
    async fn probe_unavailable_without_socket() {
        let dir = tempfile::tempdir().unwrap();
        let client = BackendClient::new(dir.path().join("none.sock"), Duration::from_secs(1), 8192);
        let err = probe_backend(&client, &config(100)).await.unwrap_err();
        assert!(matches!(err, ProxyError::BackendUnavailable(_)));
    }
}
