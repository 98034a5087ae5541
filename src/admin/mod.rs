//! Admin API, served on its own listener behind a bearer token.

pub mod auth;
pub mod handlers;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::sync::watch;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::health::HealthStatus;
use crate::lifecycle::reload::Reloader;
use crate::security::admission::AdmissionControl;
use crate::supervisor::SupervisorHandle;

#[derive(Clone)]
pub struct AdminState {
    pub supervisor: SupervisorHandle,
    pub health: watch::Receiver<HealthStatus>,
    pub admission: Arc<AdmissionControl>,
    pub reloader: Arc<Reloader>,
    pub started_at: Instant,
}

pub fn setup_admin_router(state: AdminState, api_key: &str) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/backend", get(get_backend))
        .route("/zones", get(get_zones))
        .route("/reload", post(post_reload))
        .route("/backend/restart", post(post_restart))
        .layer(middleware::from_fn_with_state(
            Arc::<str>::from(api_key),
            admin_auth_middleware,
        ))
        .with_state(state)
}
