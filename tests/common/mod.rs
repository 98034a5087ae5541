//! Shared utilities for integration tests.
//!
//! Every test runs a real `Gateway` in front of the `mock-backend` binary,
//! socket-activated the same way a production backend would be.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use edge_proxy::config::load_config;
use edge_proxy::supervisor::{BackendSnapshot, BackendState};
use edge_proxy::Gateway;
use tempfile::TempDir;

pub const ADMIN_KEY: &str = "integration-key";

/// Everything a test needs to talk to a running proxy.
pub struct TestProxy {
    pub gateway: Gateway,
    pub dir: TempDir,
    pub config_path: PathBuf,
}

impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.gateway.local_addr(), path)
    }

    pub fn admin_url(&self, path: &str) -> String {
        let addr = self.gateway.admin_addr().expect("admin API enabled");
        format!("http://{addr}{path}")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.dir.path().join("backend.sock")
    }

    /// Wait until the backend reaches `state`, failing the test after `limit`.
    pub async fn wait_for_state(&self, state: BackendState, limit: Duration) -> BackendSnapshot {
        tokio::time::timeout(limit, self.gateway.supervisor().wait_for(|s| s.state == state))
            .await
            .unwrap_or_else(|_| {
                panic!(
                    "backend never reached {:?}, last snapshot {:?}",
                    state,
                    self.gateway.supervisor().snapshot()
                )
            })
    }

    pub async fn stop(self) {
        self.gateway.shutdown().await;
    }
}

/// Config file body for a proxy on an ephemeral port in front of
/// `mock-backend`. `extra` is appended verbatim.
pub fn config_toml(dir: &Path, backend_env: &[(&str, &str)], extra: &str) -> String {
    let mut env = String::new();
    for (key, value) in backend_env {
        env.push_str(&format!("{key} = {value:?}\n"));
    }
    format!(
        r#"
[listener]
bind_address = "127.0.0.1:0"

[backend]
command = {command:?}
args = []
socket_path = {socket:?}
shutdown_grace_secs = 2

[backend.env]
{env}

[health_check]
interval_ms = 100
timeout_ms = 500
unhealthy_threshold = 2
failure_ceiling = 50

[restart]
base_delay_ms = 50
max_delay_ms = 200
multiplier = 2.0

[timeouts]
backend_response_secs = 10
shutdown_grace_secs = 2

[admin]
enabled = true
api_key = "{ADMIN_KEY}"
bind_address = "127.0.0.1:0"
{extra}
"#,
        command = env!("CARGO_BIN_EXE_mock-backend"),
        socket = dir.join("backend.sock").to_string_lossy(),
    )
}

/// Write a config into a fresh temp dir and start a gateway from it.
pub async fn start_proxy(backend_env: &[(&str, &str)], extra: &str) -> TestProxy {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("proxy.toml");
    std::fs::write(&config_path, config_toml(dir.path(), backend_env, extra)).expect("write config");

    let config = load_config(&config_path).expect("valid test config");
    let gateway = Gateway::start(config, Some(config_path.clone()))
        .await
        .expect("gateway starts");
    TestProxy {
        gateway,
        dir,
        config_path,
    }
}

/// Start a proxy and wait for the backend to pass its first probe.
pub async fn start_healthy_proxy(extra: &str) -> TestProxy {
    let proxy = start_proxy(&[], extra).await;
    proxy.wait_for_state(BackendState::Healthy, Duration::from_secs(10)).await;
    proxy
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .expect("reqwest client")
}

/// Poll `check` every 50ms until it returns true or `limit` passes.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
