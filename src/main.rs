//! Edge proxy binary.
//!
//! Loads and validates the configuration, starts the gateway, and runs
//! until SIGTERM or SIGINT. SIGHUP reloads the configuration file.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use edge_proxy::config::{load_config, ProxyConfig};
use edge_proxy::lifecycle::signals::handle_signals;
use edge_proxy::net::tls::build_server_config;
use edge_proxy::observability::{init_logging, metrics};
use edge_proxy::Gateway;

#[derive(Parser)]
#[command(name = "edge-proxy", version)]
#[command(about = "Rate-limiting reverse proxy for a socket-activated backend", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration, load any TLS material, and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path),
        None => Ok(ProxyConfig::default()),
    };

    if cli.check {
        // Certificates and keys must parse, not just be named.
        let checked = config.and_then(|config| match &config.listener.tls {
            Some(tls) => build_server_config(tls).map(|_| ()),
            None => Ok(()),
        });
        return match checked {
            Ok(()) => {
                println!("configuration ok");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("configuration invalid: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("edge-proxy: refusing to start: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&config.observability) {
        eprintln!("edge-proxy: logging already initialized: {e}");
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = ?cli.config, "edge-proxy starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let gateway = match Gateway::start(config, cli.config.clone()).await {
        Ok(gateway) => gateway,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            return ExitCode::FAILURE;
        }
    };

    let mut signals = tokio::spawn(handle_signals(gateway.shutdown_trigger(), gateway.reloader()));
    let run = gateway.run();
    tokio::pin!(run);

    tokio::select! {
        () = &mut run => return ExitCode::SUCCESS,
        result = &mut signals => match result {
            Ok(Ok(())) => {
                tracing::error!("Forced exit before shutdown completed");
                return ExitCode::FAILURE;
            }
            Ok(Err(e)) => tracing::error!(error = %e, "Signal handlers unavailable"),
            Err(e) => tracing::error!(error = %e, "Signal task failed"),
        },
    }

    run.await;
    ExitCode::SUCCESS
}
