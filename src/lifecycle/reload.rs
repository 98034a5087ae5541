//! Configuration reload.
//!
//! Validate first, then swap. A rejected file leaves every running snapshot
//! untouched. Sections that are baked into bound sockets or spawned
//! processes keep their running values and are reported as needing a
//! restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum_server::tls_rustls::RustlsConfig;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::validation::validate_config;
use crate::config::{load_config, ConfigError, HealthCheckConfig, ProxyConfig};
use crate::error::ProxyError;
use crate::net::tls::reload_tls_config;
use crate::security::admission::AdmissionControl;
use crate::supervisor::SupervisorHandle;

/// What a reload changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReloadReport {
    pub applied: Vec<&'static str>,
    pub restart_required: Vec<&'static str>,
}

/// Applies new configurations to the running subsystems.
pub struct Reloader {
    config_path: Option<PathBuf>,
    current: ArcSwap<ProxyConfig>,
    admission: Arc<AdmissionControl>,
    health: Arc<ArcSwap<HealthCheckConfig>>,
    supervisor: SupervisorHandle,
    tls: Option<RustlsConfig>,
    /// Serializes reloads from signals, the admin API and the watcher.
    lock: Mutex<()>,
}

fn keep_running<T: PartialEq + Clone>(
    name: &'static str,
    running: &T,
    next: &mut T,
    report: &mut ReloadReport,
) {
    if running != next {
        *next = running.clone();
        report.restart_required.push(name);
    }
}

impl Reloader {
    pub fn new(
        config: ProxyConfig,
        config_path: Option<PathBuf>,
        admission: Arc<AdmissionControl>,
        health: Arc<ArcSwap<HealthCheckConfig>>,
        supervisor: SupervisorHandle,
        tls: Option<RustlsConfig>,
    ) -> Self {
        Self {
            config_path,
            current: ArcSwap::from_pointee(config),
            admission,
            health,
            supervisor,
            tls,
            lock: Mutex::new(()),
        }
    }

    /// The configuration currently in effect.
    pub fn current(&self) -> Arc<ProxyConfig> {
        self.current.load_full()
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Re-read the configuration file and apply it.
    pub async fn reload_from_disk(&self) -> Result<ReloadReport, ProxyError> {
        let path = self.config_path.as_deref().ok_or(ConfigError::NoSource)?;
        tracing::info!(path = ?path, "Reloading configuration");
        let next = load_config(path)?;
        self.apply(next).await
    }

    pub async fn apply(&self, next: ProxyConfig) -> Result<ReloadReport, ProxyError> {
        validate_config(&next).map_err(ConfigError::Validation)?;

        let _guard = self.lock.lock().await;
        let running = self.current.load_full();
        let mut report = ReloadReport::default();
        let mut effective = next;

        keep_running(
            "listener.bind_address",
            &running.listener.bind_address,
            &mut effective.listener.bind_address,
            &mut report,
        );
        if running.listener.tls.is_some() != effective.listener.tls.is_some() {
            effective.listener.tls = running.listener.tls.clone();
            report.restart_required.push("listener.tls");
        }
        let mut backend = running.backend.clone();
        backend.restart_on_clean_exit = effective.backend.restart_on_clean_exit;
        keep_running("backend", &backend, &mut effective.backend, &mut report);
        keep_running(
            "rate_limit.sweep_interval_secs",
            &running.rate_limit.sweep_interval_secs,
            &mut effective.rate_limit.sweep_interval_secs,
            &mut report,
        );
        keep_running("timeouts", &running.timeouts, &mut effective.timeouts, &mut report);
        keep_running("buffers", &running.buffers, &mut effective.buffers, &mut report);
        keep_running("limits", &running.limits, &mut effective.limits, &mut report);
        keep_running("security", &running.security, &mut effective.security, &mut report);
        keep_running("observability", &running.observability, &mut effective.observability, &mut report);
        keep_running("admin", &running.admin, &mut effective.admin, &mut report);
        keep_running("reload", &running.reload, &mut effective.reload, &mut report);

        // Certificates are re-read even when the paths are unchanged: renewal
        // usually replaces the files in place. This is the last step that
        // can fail, so it runs before anything is swapped.
        if let (Some(running_tls), Some(tls)) = (&self.tls, &effective.listener.tls) {
            reload_tls_config(running_tls, tls)?;
            report.applied.push("listener.tls");
        }

        if running.zones != effective.zones || running.rate_limit != effective.rate_limit {
            self.admission.reload(&effective);
            report.applied.push("zones");
        }

        if running.health_check != effective.health_check
            || running.restart != effective.restart
            || running.backend.restart_on_clean_exit != effective.backend.restart_on_clean_exit
        {
            self.health.store(Arc::new(effective.health_check.clone()));
            self.supervisor
                .reconfigure(
                    &effective.health_check,
                    effective.restart.clone(),
                    effective.backend.restart_on_clean_exit,
                )
                .await;
            report.applied.push("health_check");
        }

        for section in &report.restart_required {
            tracing::warn!(section, "Setting changed but takes effect only after a restart");
        }
        tracing::info!(applied = ?report.applied, "Configuration reloaded");

        self.current.store(Arc::new(effective));
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RateSpec, RestartConfig};
    use crate::supervisor::Supervisor;
    use std::time::Instant;

    struct Harness {
        reloader: Reloader,
        admission: Arc<AdmissionControl>,
        health: Arc<ArcSwap<HealthCheckConfig>>,
        supervisor: SupervisorHandle,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ProxyConfig::default();
        config.backend.command = "/bin/sh".into();
        config.backend.args = vec!["-c".into(), "sleep 30".into()];
        config.backend.socket_path = dir.path().join("backend.sock");
        config.backend.shutdown_grace_secs = 1;

        let (supervisor, _task) =
            Supervisor::start(&config.backend, &config.health_check, RestartConfig::default()).unwrap();
        let admission = Arc::new(AdmissionControl::new(&config));
        let health = Arc::new(ArcSwap::from_pointee(config.health_check.clone()));
        let reloader = Reloader::new(
            config,
            None,
            admission.clone(),
            health.clone(),
            supervisor.clone(),
            None,
        );
        Harness {
            reloader,
            admission,
            health,
            supervisor,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn rate_change_applies_and_keeps_other_buckets() {
        let h = harness().await;
        let api_before = h.admission.policy().zones.get("api").unwrap().limiter.clone();
        api_before.check_at("192.0.2.1", Instant::now());

        let mut next = (*h.reloader.current()).clone();
        next.zones[0].rate = RateSpec::Expression("10/min".into());
        let report = h.reloader.apply(next).await.unwrap();
        assert_eq!(report.applied, vec!["zones"]);
        assert!(report.restart_required.is_empty());

        let policy = h.admission.policy();
        assert!((policy.zones.get("login").unwrap().rate - 10.0 / 60.0).abs() < 1e-9);
        let api_after = policy.zones.get("api").unwrap().limiter.clone();
        assert!(Arc::ptr_eq(&api_before, &api_after));
        h.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_config_changes_nothing() {
        let h = harness().await;
        let before = h.reloader.current();

        let mut next = (*before).clone();
        next.zones[0].burst = 0;
        next.health_check.interval_ms = 100;
        assert!(matches!(h.reloader.apply(next).await, Err(ProxyError::ConfigInvalid(_))));

        assert_eq!(h.reloader.current().zones, before.zones);
        assert_eq!(h.health.load().interval_ms, before.health_check.interval_ms);
        h.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn listener_and_backend_changes_need_restart() {
        let h = harness().await;
        let mut next = (*h.reloader.current()).clone();
        next.listener.bind_address = "127.0.0.1:9999".into();
        next.backend.command = "/usr/bin/env".into();
        next.health_check.unhealthy_threshold = 5;
        next.health_check.failure_ceiling = 8;

        let report = h.reloader.apply(next).await.unwrap();
        assert_eq!(report.restart_required, vec!["listener.bind_address", "backend"]);
        assert_eq!(report.applied, vec!["health_check"]);

        let current = h.reloader.current();
        assert_eq!(current.listener.bind_address, "0.0.0.0:8080");
        assert_eq!(current.backend.command, "/bin/sh");
        assert_eq!(h.health.load().unhealthy_threshold, 5);
        h.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn reload_from_disk_needs_a_path() {
        let h = harness().await;
        assert!(matches!(
            h.reloader.reload_from_disk().await,
            Err(ProxyError::ConfigInvalid(ConfigError::NoSource))
        ));
        h.supervisor.shutdown().await;
    }
}
