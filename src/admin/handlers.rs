use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::admin::AdminState;
use crate::health::HealthStatus;
use crate::security::zones::ZoneSummary;
use crate::supervisor::{BackendSnapshot, BackendState};

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub backend_state: BackendState,
    pub zones: usize,
}

#[derive(Serialize)]
pub struct BackendStatus {
    pub supervisor: BackendSnapshot,
    pub health: HealthStatus,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let backend_state = state.supervisor.state();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: if backend_state == BackendState::Healthy {
            "operational"
        } else {
            "degraded"
        },
        uptime_secs: state.started_at.elapsed().as_secs(),
        backend_state,
        zones: state.admission.policy().zones.len(),
    })
}

pub async fn get_backend(State(state): State<AdminState>) -> Json<BackendStatus> {
    Json(BackendStatus {
        supervisor: state.supervisor.snapshot(),
        health: state.health.borrow().clone(),
    })
}

pub async fn get_zones(State(state): State<AdminState>) -> Json<Vec<ZoneSummary>> {
    Json(state.admission.zone_summaries())
}

pub async fn post_reload(State(state): State<AdminState>) -> Response {
    match state.reloader.reload_from_disk().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Admin reload rejected");
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ErrorBody { error: e.to_string() }),
            )
                .into_response()
        }
    }
}

pub async fn post_restart(State(state): State<AdminState>) -> Response {
    match state.supervisor.restart().await {
        Ok(()) => {
            tracing::info!("Backend restart requested via admin API");
            StatusCode::ACCEPTED.into_response()
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorBody { error: e.to_string() }),
        )
            .into_response(),
    }
}
