//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the proxy handler
//! - Configure HTTP/1.1 and HTTP/2 support
//! - Wire up middleware (tracing, limits, request ID, security headers)
//! - Bind server to listener, with or without TLS

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use axum::{middleware, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use hyper_util::rt::TokioTimer;
use tokio::sync::Notify;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::backend::BackendClient;
use crate::config::{ProxyConfig, TimeoutConfig};
use crate::http::proxy::proxy_handler;
use crate::http::request::{RequestIdExt, UuidRequestId, X_REQUEST_ID};
use crate::security::admission::AdmissionControl;
use crate::security::headers::security_headers;
use crate::security::limits::enforce_limits;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub admission: Arc<AdmissionControl>,
    pub client: BackendClient,
    /// Wakes the health monitor when a request finds the backend unreachable.
    pub probe_now: Arc<Notify>,
    pub timeouts: TimeoutConfig,
    /// Value for `X-Forwarded-Proto`.
    pub scheme: &'static str,
}

impl AppState {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            admission: Arc::new(AdmissionControl::new(config)),
            client: BackendClient::new(
                &config.backend.socket_path,
                config.backend.connect_timeout(),
                config.buffers.max_buf_size,
            ),
            probe_now: Arc::new(Notify::new()),
            timeouts: config.timeouts.clone(),
            scheme: if config.listener.tls.is_some() { "https" } else { "http" },
        }
    }
}

/// HTTP server for the reverse proxy.
pub struct HttpServer {
    router: Router,
    config: ProxyConfig,
}

impl HttpServer {
    pub fn new(config: &ProxyConfig, state: AppState) -> Self {
        Self {
            router: Self::build_router(config, state),
            config: config.clone(),
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &ProxyConfig, state: AppState) -> Router {
        let mut router = Router::new()
            .fallback(proxy_handler)
            .with_state(state)
            .layer(RequestBodyLimitLayer::new(config.buffers.max_body_size))
            .layer(middleware::from_fn_with_state(
                Arc::new(config.limits.clone()),
                enforce_limits,
            ));

        if config.security.enable_headers {
            for (name, value) in security_headers(&config.security.headers) {
                router = router.layer(SetResponseHeaderLayer::overriding(name, value));
            }
        }

        router
            .layer(TimeoutLayer::new(config.timeouts.request()))
            .layer(PropagateRequestIdLayer::new(X_REQUEST_ID))
            .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                tracing::info_span!(
                    "request",
                    method = %request.method(),
                    path = %request.uri().path(),
                    request_id = %request.request_id(),
                )
            }))
            .layer(SetRequestIdLayer::new(X_REQUEST_ID, UuidRequestId))
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve until `handle` is told to shut down.
    pub async fn serve(self, handle: Handle, tls: Option<RustlsConfig>) -> io::Result<()> {
        let addr: SocketAddr = self
            .config
            .listener
            .bind_address
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        let timeouts = &self.config.timeouts;
        let max_buf_size = self.config.buffers.max_buf_size.max(8192);

        tracing::info!(address = %addr, tls = tls.is_some(), "HTTP server starting");

        match tls {
            Some(tls) => {
                let mut server = axum_server::bind_rustls(addr, tls).handle(handle);
                server
                    .http_builder()
                    .http1()
                    .timer(TokioTimer::new())
                    .header_read_timeout(timeouts.header_read())
                    .max_buf_size(max_buf_size);
                server.http_builder().http2().timer(TokioTimer::new());
                server.serve(app).await?;
            }
            None => {
                let mut server = axum_server::bind(addr).handle(handle);
                server
                    .http_builder()
                    .http1()
                    .timer(TokioTimer::new())
                    .header_read_timeout(timeouts.header_read())
                    .max_buf_size(max_buf_size);
                server.serve(app).await?;
            }
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }
}
