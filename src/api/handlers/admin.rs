use axum::{extract::State, http::HeaderMap, http::StatusCode, Json};
use tracing::warn;

use crate::api::{auth::ensure_admin_authorized, state::AppState, types::*};
use crate::coordination::Clock;

const DEFAULT_OPERATOR: &str = "admin-api";

fn snapshot(state: &AppState) -> KillSwitchResponse {
    KillSwitchResponse {
        state: state.ctx.kill_switch.state(),
        checked_at: state.ctx.clock.utc_now(),
    }
}

/// GET /admin/kill-switch
pub async fn get_kill_switch(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Json<KillSwitchResponse>, (StatusCode, String)> {
    ensure_admin_authorized(&headers, state.admin_token())?;
    Ok(Json(snapshot(&state)))
}

/// POST /admin/kill-switch
pub async fn engage_kill_switch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<KillSwitchRequest>,
) -> std::result::Result<Json<KillSwitchResponse>, (StatusCode, String)> {
    ensure_admin_authorized(&headers, state.admin_token())?;

    let reason = req.reason.trim();
    if reason.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "reason must not be empty".to_string()));
    }
    let set_by = req.set_by.as_deref().unwrap_or(DEFAULT_OPERATOR);
    warn!(reason, set_by, "Kill switch engaged via admin API");
    state.ctx.kill_switch.engage(reason, set_by);
    Ok(Json(snapshot(&state)))
}

/// DELETE /admin/kill-switch
pub async fn release_kill_switch(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Option<Json<KillSwitchReleaseRequest>>,
) -> std::result::Result<Json<KillSwitchResponse>, (StatusCode, String)> {
    ensure_admin_authorized(&headers, state.admin_token())?;

    let set_by = req
        .and_then(|Json(r)| r.set_by)
        .unwrap_or_else(|| DEFAULT_OPERATOR.to_string());
    state.ctx.kill_switch.release(&set_by);
    Ok(Json(snapshot(&state)))
}
