//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration and load TLS material
//! - Bind the backend socket and start supervision
//! - Start background tasks (health checks, bucket eviction, file watcher)
//! - Bind listeners and begin accepting traffic
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - The backend socket is bound before the public listener, so the first
//!   proxied request queues instead of being refused
//! - Shutdown runs in reverse: drain the router, then stop the backend

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum_server::Handle;
use notify::RecommendedWatcher;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::admin::{setup_admin_router, AdminState};
use crate::config::validation::validate_config;
use crate::config::watcher::ConfigWatcher;
use crate::config::{ConfigError, ProxyConfig};
use crate::error::ProxyError;
use crate::health::{HealthMonitor, HealthStatus};
use crate::http::{AppState, HttpServer};
use crate::lifecycle::reload::Reloader;
use crate::lifecycle::shutdown::Shutdown;
use crate::net::tls::load_tls_config;
use crate::observability::metrics;
use crate::security::admission::AdmissionControl;
use crate::supervisor::{Supervisor, SupervisorHandle};

/// Grace period for admin connections at shutdown.
const ADMIN_DRAIN: Duration = Duration::from_secs(1);

/// A running proxy: router, admin API, supervisor and background tasks.
pub struct Gateway {
    shutdown: Arc<Shutdown>,
    reloader: Arc<Reloader>,
    supervisor: SupervisorHandle,
    supervisor_task: JoinHandle<()>,
    health: watch::Receiver<HealthStatus>,
    http: Listener,
    admin: Option<Listener>,
    tasks: Vec<JoinHandle<()>>,
    _watcher: Option<RecommendedWatcher>,
    drain_grace: Duration,
}

struct Listener {
    handle: Handle,
    task: JoinHandle<std::io::Result<()>>,
    addr: SocketAddr,
}

impl Listener {
    /// Wait for a spawned server to bind, or surface its bind error.
    async fn bound(handle: Handle, task: JoinHandle<std::io::Result<()>>) -> Result<Self, ProxyError> {
        match handle.listening().await {
            Some(addr) => Ok(Self { handle, task, addr }),
            None => {
                let err = match task.await {
                    Ok(Err(e)) => e,
                    Ok(Ok(())) => std::io::Error::other("listener exited before binding"),
                    Err(e) => std::io::Error::other(e),
                };
                Err(ProxyError::Listen(err))
            }
        }
    }

    async fn drain(self, grace: Duration) {
        self.handle.graceful_shutdown(Some(grace));
        match self.task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Listener ended with error"),
            Err(e) => tracing::error!(error = %e, "Listener task panicked"),
        }
    }
}

impl Gateway {
    /// Start every subsystem for `config`. `config_path` is where reloads
    /// read from.
    pub async fn start(config: ProxyConfig, config_path: Option<PathBuf>) -> Result<Self, ProxyError> {
        validate_config(&config).map_err(ConfigError::Validation)?;

        let tls = config.listener.tls.as_ref().map(load_tls_config).transpose()?;

        let (supervisor, supervisor_task) =
            Supervisor::start(&config.backend, &config.health_check, config.restart.clone())?;
        tracing::info!(socket = ?config.backend.socket_path, "Backend socket bound");

        let state = AppState::new(&config);
        let admission = state.admission.clone();
        let probe_now = state.probe_now.clone();
        let client = state.client.clone();

        let server = HttpServer::new(&config, state);
        let handle = Handle::new();
        let task = tokio::spawn(server.serve(handle.clone(), tls.clone()));
        let http = match Listener::bound(handle, task).await {
            Ok(listener) => listener,
            Err(e) => {
                supervisor.shutdown().await;
                return Err(e);
            }
        };
        tracing::info!(address = %http.addr, "Listening for connections");

        let shutdown = Arc::new(Shutdown::new());
        let health_config = Arc::new(ArcSwap::from_pointee(config.health_check.clone()));
        let mut tasks = Vec::new();

        let (monitor, health) =
            HealthMonitor::new(client, supervisor.clone(), health_config.clone(), probe_now);
        let monitor = monitor.with_router(probe_address(http.addr));
        tasks.push(tokio::spawn(monitor.run(shutdown.subscribe())));

        tasks.push(tokio::spawn(sweep_idle_buckets(
            admission.clone(),
            config.rate_limit.sweep_interval(),
            shutdown.subscribe(),
        )));

        let reloader = Arc::new(Reloader::new(
            config.clone(),
            config_path.clone(),
            admission.clone(),
            health_config,
            supervisor.clone(),
            tls,
        ));

        let mut watcher = None;
        if let (true, Some(path)) = (config.reload.watch_file, &config_path) {
            let (config_watcher, mut updates) = ConfigWatcher::new(path);
            match config_watcher.run() {
                Ok(w) => {
                    watcher = Some(w);
                    let reloader = reloader.clone();
                    tasks.push(tokio::spawn(async move {
                        while let Some(next) = updates.recv().await {
                            if let Err(e) = reloader.apply(next).await {
                                tracing::error!(error = %e, "Watched config rejected");
                            }
                        }
                    }));
                }
                Err(e) => tracing::warn!(error = %e, "Config file watcher unavailable, SIGHUP still reloads"),
            }
        }

        let admin = if config.admin.enabled {
            let state = AdminState {
                supervisor: supervisor.clone(),
                health: health.clone(),
                admission,
                reloader: reloader.clone(),
                started_at: Instant::now(),
            };
            let router = setup_admin_router(state, &config.admin.api_key);
            let addr: SocketAddr = config
                .admin
                .bind_address
                .parse()
                .map_err(|e| ProxyError::Listen(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
            let handle = Handle::new();
            let server = axum_server::bind(addr).handle(handle.clone());
            let task = tokio::spawn(server.serve(router.into_make_service()));
            match Listener::bound(handle, task).await {
                Ok(listener) => {
                    tracing::info!(address = %listener.addr, "Admin API listening");
                    Some(listener)
                }
                Err(e) => {
                    shutdown.trigger();
                    http.drain(Duration::ZERO).await;
                    supervisor.shutdown().await;
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(Self {
            shutdown,
            reloader,
            supervisor,
            supervisor_task,
            health,
            http,
            admin,
            tasks,
            _watcher: watcher,
            drain_grace: config.timeouts.shutdown_grace(),
        })
    }

    /// Address the public listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.http.addr
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin.as_ref().map(|l| l.addr)
    }

    pub fn supervisor(&self) -> &SupervisorHandle {
        &self.supervisor
    }

    pub fn reloader(&self) -> Arc<Reloader> {
        self.reloader.clone()
    }

    pub fn shutdown_trigger(&self) -> Arc<Shutdown> {
        self.shutdown.clone()
    }

    pub fn health(&self) -> watch::Receiver<HealthStatus> {
        self.health.clone()
    }

    /// Run until shutdown is triggered, then shut down in order.
    pub async fn run(self) {
        self.shutdown.wait().await;
        self.shutdown().await;
    }

    /// Stop accepting, drain in-flight requests, then stop the backend.
    pub async fn shutdown(self) {
        self.shutdown.trigger();
        tracing::info!(grace = ?self.drain_grace, "Draining connections");

        if let Some(admin) = self.admin {
            admin.drain(ADMIN_DRAIN).await;
        }
        self.http.drain(self.drain_grace).await;

        self.supervisor.shutdown().await;
        if let Err(e) = self.supervisor_task.await {
            tracing::error!(error = %e, "Supervisor task panicked");
        }
        for task in self.tasks {
            task.abort();
            let _ = task.await;
        }
        tracing::info!("Shutdown complete");
    }
}

/// Connectable address for a listener bound to `addr`.
fn probe_address(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port()),
        _ => addr,
    }
}

/// Periodically evict idle, refilled buckets and publish key counts.
async fn sweep_idle_buckets(
    admission: Arc<AdmissionControl>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = admission.evict_idle(Instant::now());
                if evicted > 0 {
                    tracing::debug!(evicted, "Evicted idle rate-limit buckets");
                }
                for zone in admission.zone_summaries() {
                    metrics::record_rate_limit_keys(&zone.name, zone.tracked_keys);
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
