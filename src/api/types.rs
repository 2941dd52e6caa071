use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::coordination::KillSwitchState;
use crate::domain::{OrderErrorKind, OrderResult, OrderStatus, Quote};

// ============================================================================
// Order Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResponse {
    pub order_id: Option<String>,
    pub idempotency_key: String,
    pub status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filled_qty: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_fill_price: Option<Decimal>,
    pub attempt_count: u32,
    /// True when the result was recorded by an earlier request with the same key
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl OrderResponse {
    pub fn from_result(result: OrderResult, duplicate: bool) -> Self {
        let error = result.error.map(|e| {
            let code = serde_json::to_value(e.kind)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "failed".to_string());
            ErrorBody { code, message: e.message }
        });
        Self {
            order_id: result.order_id,
            idempotency_key: result.idempotency_key,
            status: result.status,
            filled_qty: result.filled_qty,
            avg_fill_price: result.avg_fill_price,
            attempt_count: result.attempt_count,
            duplicate,
            error,
        }
    }
}

/// HTTP status for an order outcome
pub fn order_status_code(status: OrderStatus, error: Option<OrderErrorKind>) -> StatusCode {
    match error {
        None if status == OrderStatus::Pending => StatusCode::ACCEPTED,
        None => StatusCode::OK,
        Some(OrderErrorKind::KillSwitchEngaged) => StatusCode::FORBIDDEN,
        Some(OrderErrorKind::ValidationError) => StatusCode::UNPROCESSABLE_ENTITY,
        Some(OrderErrorKind::CircuitOpen) | Some(OrderErrorKind::Unavailable) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        Some(OrderErrorKind::Failed) => StatusCode::BAD_GATEWAY,
    }
}

// ============================================================================
// Market Data Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub symbols: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteResponse {
    pub quote: Quote,
    pub stale: bool,
    pub age_ms: u64,
}

// ============================================================================
// Admin Types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct KillSwitchRequest {
    pub reason: String,
    #[serde(default)]
    pub set_by: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KillSwitchReleaseRequest {
    #[serde(default)]
    pub set_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchResponse {
    #[serde(flatten)]
    pub state: KillSwitchState,
    pub checked_at: DateTime<Utc>,
}
