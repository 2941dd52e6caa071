use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};

use crate::api::{state::AppState, types::*};
use crate::domain::{OrderRequest, OrderStatus};
use crate::execution::Disposition;

/// POST /orders
pub async fn submit_order(
    State(state): State<AppState>,
    payload: std::result::Result<Json<OrderRequest>, JsonRejection>,
) -> (StatusCode, Json<OrderResponse>) {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => {
            let body = OrderResponse {
                order_id: None,
                idempotency_key: String::new(),
                status: OrderStatus::Rejected,
                filled_qty: None,
                avg_fill_price: None,
                attempt_count: 0,
                duplicate: false,
                error: Some(ErrorBody::new("validation_error", rejection.body_text())),
            };
            return (StatusCode::UNPROCESSABLE_ENTITY, Json(body));
        }
    };

    let (result, disposition) = state.ctx.orders.submit_tracked(req).await;
    let code = order_status_code(result.status, result.error_kind());
    (
        code,
        Json(OrderResponse::from_result(
            result,
            disposition == Disposition::Replayed,
        )),
    )
}
