mod common;

use std::process::Command;
use std::time::Duration;

use common::{client, config_toml, eventually, start_healthy_proxy, ADMIN_KEY};
use reqwest::StatusCode;
use serde_json::Value;

const STRICT_ZONES: &str = r#"
[[zones]]
name = "login"
rate = "5/min"
burst = 1

[[zones.rules]]
exact = "/api/auth/admin-login/"
methods = ["POST"]
"#;

async fn zones(proxy: &common::TestProxy) -> Value {
    client()
        .get(proxy.admin_url("/zones"))
        .bearer_auth(ADMIN_KEY)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn admin_reload_applies_new_zones() {
    let proxy = start_healthy_proxy("").await;
    assert_eq!(zones(&proxy).await.as_array().unwrap().len(), 4);

    std::fs::write(&proxy.config_path, config_toml(proxy.dir.path(), &[], STRICT_ZONES)).unwrap();
    let res = client()
        .post(proxy.admin_url("/reload"))
        .bearer_auth(ADMIN_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let report: Value = res.json().await.unwrap();
    assert!(report["applied"].as_array().unwrap().iter().any(|s| s == "zones"));

    let zones = zones(&proxy).await;
    let zones = zones.as_array().unwrap();
    assert_eq!(zones.len(), 1);
    assert_eq!(zones[0]["burst"], 1);

    // Burst of one: the second login is throttled, and /api/ is now unlimited.
    let client = client();
    let login = proxy.url("/api/auth/admin-login/");
    assert_eq!(client.post(&login).send().await.unwrap().status(), StatusCode::OK);
    assert_eq!(
        client.post(&login).send().await.unwrap().status(),
        StatusCode::TOO_MANY_REQUESTS
    );
    for _ in 0..40 {
        assert_eq!(
            client.get(proxy.url("/api/colleagues/")).send().await.unwrap().status(),
            StatusCode::OK
        );
    }

    proxy.stop().await;
}

#[tokio::test]
async fn invalid_reload_keeps_running_config() {
    let proxy = start_healthy_proxy("").await;

    std::fs::write(
        &proxy.config_path,
        config_toml(
            proxy.dir.path(),
            &[],
            "[[zones]]\nname = \"broken\"\nrate = \"fast\"\nburst = 1\n",
        ),
    )
    .unwrap();
    let res = client()
        .post(proxy.admin_url("/reload"))
        .bearer_auth(ADMIN_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = res.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("rate"));

    assert_eq!(zones(&proxy).await.as_array().unwrap().len(), 4);
    proxy.stop().await;
}

#[tokio::test]
async fn restart_only_changes_are_reported_not_applied() {
    let proxy = start_healthy_proxy("").await;
    let addr = proxy.gateway.local_addr();

    let mut next = edge_proxy::config::load_config(&proxy.config_path).unwrap();
    next.listener.bind_address = "127.0.0.1:1".to_string();
    next.timeouts.backend_response_secs = 99;
    let report = proxy.gateway.reloader().apply(next).await.unwrap();

    assert!(report.restart_required.contains(&"listener.bind_address"));
    assert!(report.restart_required.contains(&"timeouts"));
    assert_eq!(proxy.gateway.reloader().current().listener.bind_address, "127.0.0.1:0");
    assert_eq!(proxy.gateway.local_addr(), addr);
    proxy.stop().await;
}

#[tokio::test]
async fn watched_file_reloads_automatically() {
    let proxy = start_healthy_proxy("[reload]\nwatch_file = true\n").await;

    let updated = config_toml(
        proxy.dir.path(),
        &[],
        &format!("[reload]\nwatch_file = true\n{STRICT_ZONES}"),
    );
    std::fs::write(&proxy.config_path, updated).unwrap();

    let url = proxy.admin_url("/zones");
    let reloaded = eventually(Duration::from_secs(10), move || {
        let request = client().get(url.clone()).bearer_auth(ADMIN_KEY);
        async move {
            let zones: Value = request.send().await.unwrap().json().await.unwrap();
            zones.as_array().map(|z| z.len()) == Some(1)
        }
    })
    .await;
    assert!(reloaded, "watcher never applied the new zones");
    proxy.stop().await;
}

#[test]
fn check_flag_validates_without_starting() {
    let dir = tempfile::tempdir().unwrap();
    let good = dir.path().join("good.toml");
    std::fs::write(&good, config_toml(dir.path(), &[], "")).unwrap();
    let bad = dir.path().join("bad.toml");
    std::fs::write(&bad, "[health_check]\ninterval_ms = 0\n").unwrap();

    let ok = Command::new(env!("CARGO_BIN_EXE_edge-proxy"))
        .arg("--config")
        .arg(&good)
        .arg("--check")
        .output()
        .unwrap();
    assert!(ok.status.success(), "{}", String::from_utf8_lossy(&ok.stderr));
    assert!(!dir.path().join("backend.sock").exists());

    let failed = Command::new(env!("CARGO_BIN_EXE_edge-proxy"))
        .arg("--config")
        .arg(&bad)
        .arg("--check")
        .output()
        .unwrap();
    assert!(!failed.status.success());
}

#[test]
fn check_flag_loads_tls_material() {
    let dir = tempfile::tempdir().unwrap();
    let cert = dir.path().join("cert.pem");
    let key = dir.path().join("key.pem");
    std::fs::write(&cert, "not a certificate").unwrap();
    std::fs::write(&key, "not a key").unwrap();
    let tls = format!(
        "[[listener.tls.certificates]]\ncert_path = {:?}\nkey_path = {:?}\n",
        cert.to_string_lossy(),
        key.to_string_lossy()
    );
    let path = dir.path().join("tls.toml");
    std::fs::write(&path, config_toml(dir.path(), &[], &tls)).unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_edge-proxy"))
        .arg("--config")
        .arg(&path)
        .arg("--check")
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("configuration invalid"));
}
