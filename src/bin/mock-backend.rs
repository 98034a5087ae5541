//! Minimal socket-activated backend used by tests and demos.
//!
//! Serves on fd 3 when started with `LISTEN_FDS`, otherwise on `--socket`.
//! The inherited listener shares its file status flags with the proxy, so
//! it is left in blocking mode and accepted from on a dedicated thread.
//!
//! Environment:
//! - `MOCK_STARTUP_DELAY_MS`: wait this long before accepting connections
//! - `MOCK_FAIL_HEALTH_FILE`: while this file exists, the health endpoint
//!   answers 503

use std::io;
use std::os::fd::FromRawFd;
use std::os::unix::net::{UnixListener as StdUnixListener, UnixStream as StdUnixStream};
use std::path::PathBuf;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::Request,
    http::{HeaderMap, StatusCode},
    routing::get,
    serve::Listener,
    Json, Router,
};
use clap::Parser;
use serde_json::{json, Value};
use tokio::net::UnixStream;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "mock-backend")]
struct Cli {
    /// Socket to bind when not socket-activated.
    #[arg(long)]
    socket: Option<PathBuf>,
}

/// Connections accepted by a blocking accept loop on its own thread.
/// Accepted sockets are fresh descriptions and may go nonblocking.
struct ThreadAccept {
    connections: mpsc::Receiver<StdUnixStream>,
}

impl ThreadAccept {
    fn spawn(listener: StdUnixListener) -> Self {
        let (tx, rx) = mpsc::channel(64);
        std::thread::spawn(move || loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    if tx.blocking_send(stream).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    eprintln!("mock-backend: accept failed: {e}");
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        });
        Self { connections: rx }
    }
}

impl Listener for ThreadAccept {
    type Io = UnixStream;
    type Addr = ();

    async fn accept(&mut self) -> (UnixStream, ()) {
        loop {
            let Some(stream) = self.connections.recv().await else {
                return std::future::pending().await;
            };
            let converted = stream.set_nonblocking(true).and_then(|()| UnixStream::from_std(stream));
            match converted {
                Ok(stream) => return (stream, ()),
                Err(e) => eprintln!("mock-backend: dropping connection: {e}"),
            }
        }
    }

    fn local_addr(&self) -> io::Result<()> {
        Ok(())
    }
}

fn activated_listener() -> io::Result<Option<StdUnixListener>> {
    let fds: u32 = match std::env::var("LISTEN_FDS").ok().and_then(|v| v.parse().ok()) {
        Some(n) if n >= 1 => n,
        _ => return Ok(None),
    };
    let for_us = std::env::var("LISTEN_PID")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .map_or(true, |pid| pid == std::process::id());
    if !for_us {
        return Ok(None);
    }
    eprintln!("mock-backend: using {fds} activated socket(s), serving fd 3");

    // SAFETY: the socket-activation protocol hands us fd 3 as a listening
    // unix socket, and nothing else in this process owns it.
    Ok(Some(unsafe { StdUnixListener::from_raw_fd(3) }))
}

async fn health() -> (StatusCode, &'static str) {
    let failing = std::env::var_os("MOCK_FAIL_HEALTH_FILE")
        .map(PathBuf::from)
        .is_some_and(|path| path.exists());
    if failing {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    } else {
        (StatusCode::OK, "ok")
    }
}

async fn echo(request: Request) -> Json<Value> {
    let (parts, body) = request.into_parts();
    let body: Bytes = axum::body::to_bytes(body, 16 * 1024 * 1024)
        .await
        .unwrap_or_default();
    Json(json!({
        "pid": std::process::id(),
        "method": parts.method.as_str(),
        "uri": parts.uri.to_string(),
        "headers": header_map(&parts.headers),
        "body_len": body.len(),
    }))
}

fn header_map(headers: &HeaderMap) -> Value {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                Value::String(value.to_str().unwrap_or_default().to_string()),
            )
        })
        .collect::<serde_json::Map<_, _>>()
        .into()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Some(ms) = std::env::var("MOCK_STARTUP_DELAY_MS").ok().and_then(|v| v.parse().ok()) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    let listener = match activated_listener()? {
        Some(listener) => listener,
        None => {
            let path = cli.socket.ok_or("no activated socket and no --socket given")?;
            let _ = std::fs::remove_file(&path);
            StdUnixListener::bind(&path)?
        }
    };
    let listener = ThreadAccept::spawn(listener);

    let app = Router::new()
        .route("/api/health/", get(health))
        .fallback(echo);

    let mut sigterm = signal(SignalKind::terminate())?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            sigterm.recv().await;
        })
        .await?;
    Ok(())
}
