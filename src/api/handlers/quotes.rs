use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::api::{state::AppState, types::*};
use crate::coordination::Clock;

/// GET /quotes/:symbol
pub async fn get_quote(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> std::result::Result<Json<QuoteResponse>, (StatusCode, Json<ErrorBody>)> {
    let symbol = symbol.trim().to_ascii_uppercase();
    match state.ctx.quotes.get(&symbol).await {
        Some((quote, stale)) => {
            let age_ms = quote.age_ms(state.ctx.clock.utc_now());
            Ok(Json(QuoteResponse { quote, stale, age_ms }))
        }
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorBody::new(
                "not_found",
                format!("no quote cached for {}", symbol),
            )),
        )),
    }
}
