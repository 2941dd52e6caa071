use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};

use crate::api::state::AppState;
use crate::services::{HealthResponse, HealthStatus};

/// GET /health
pub async fn health_handler(
    State(state): State<AppState>,
) -> std::result::Result<Json<HealthResponse>, (StatusCode, Json<HealthResponse>)> {
    let health = state.ctx.health();
    if health.status == HealthStatus::Unhealthy {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(health)))
    } else {
        Ok(Json(health))
    }
}

/// GET /metrics -- Prometheus text exposition
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.ctx.prometheus(),
    )
}
