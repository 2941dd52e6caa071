use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::{handlers, state::AppState, websocket::stream_handler};

pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Order endpoints
        .route("/orders", post(handlers::submit_order))
        // Market data endpoints
        .route("/quotes/:symbol", get(handlers::get_quote))
        .route("/stream", get(stream_handler))
        // Admin endpoints
        .route(
            "/admin/kill-switch",
            get(handlers::get_kill_switch)
                .post(handlers::engage_kill_switch)
                .delete(handlers::release_kill_switch),
        )
        // System endpoints
        .route("/health", get(handlers::health_handler))
        .route("/metrics", get(handlers::metrics_handler))
        // Add state, tracing and CORS
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
