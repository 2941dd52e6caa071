use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Longest idempotency key accepted from callers
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    #[default]
    Market,
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Market => write!(f, "market"),
            OrderType::Limit => write!(f, "limit"),
        }
    }
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Accepted locally, broker call still in flight
    Pending,
    /// Acknowledged by the broker, not yet filled
    Submitted,
    Filled,
    /// Refused by policy, validation or the broker
    Rejected,
    /// Gave up after retries or an unrecoverable broker failure
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

/// Order submission as received from callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub qty: u64,
    #[serde(rename = "type", default)]
    pub order_type: OrderType,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    pub idempotency_key: String,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: OrderSide, qty: u64, idempotency_key: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            qty,
            order_type: OrderType::Market,
            limit_price: None,
            idempotency_key: idempotency_key.to_string(),
        }
    }

    pub fn limit(
        symbol: &str,
        side: OrderSide,
        qty: u64,
        price: Decimal,
        idempotency_key: &str,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            qty,
            order_type: OrderType::Limit,
            limit_price: Some(price),
            idempotency_key: idempotency_key.to_string(),
        }
    }

    /// Check the request for problems that no retry can fix
    pub fn validate(&self) -> Result<(), String> {
        if self.idempotency_key.trim().is_empty() {
            return Err("idempotency_key must not be empty".to_string());
        }
        if self.idempotency_key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(format!(
                "idempotency_key exceeds {} characters",
                MAX_IDEMPOTENCY_KEY_LEN
            ));
        }
        if self.symbol.is_empty() {
            return Err("symbol must not be empty".to_string());
        }
        if !self
            .symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        {
            return Err(format!("invalid symbol '{}'", self.symbol));
        }
        if self.qty == 0 {
            return Err("qty must be positive".to_string());
        }

        match (self.order_type, self.limit_price) {
            (OrderType::Limit, None) => Err("limit orders require limit_price".to_string()),
            (OrderType::Limit, Some(price)) if price <= Decimal::ZERO => {
                Err("limit_price must be positive".to_string())
            }
            (OrderType::Market, Some(_)) => {
                Err("limit_price is only valid for limit orders".to_string())
            }
            _ => Ok(()),
        }
    }

    /// SHA-256 over the economic fields of the request (the key itself is excluded)
    pub fn fingerprint(&self) -> String {
        let canonical = format!(
            "{}|{}|{}|{}|{}",
            self.symbol,
            self.side,
            self.qty,
            self.order_type,
            self.limit_price
                .map(|p| p.normalize().to_string())
                .unwrap_or_default()
        );
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }
}

/// Error category surfaced to order callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderErrorKind {
    KillSwitchEngaged,
    CircuitOpen,
    ValidationError,
    /// Idempotency backend down under fail-closed policy
    Unavailable,
    Failed,
}

impl OrderErrorKind {
    /// Refusals that release the key when no broker attempt was made
    pub fn releases_key(&self) -> bool {
        matches!(
            self,
            OrderErrorKind::KillSwitchEngaged
                | OrderErrorKind::CircuitOpen
                | OrderErrorKind::Unavailable
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFailure {
    pub kind: OrderErrorKind,
    pub message: String,
}

/// Outcome of an order submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    /// Broker-assigned order id, absent if the broker never accepted the order
    pub order_id: Option<String>,
    pub idempotency_key: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: u64,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub filled_qty: Option<u64>,
    pub avg_fill_price: Option<Decimal>,
    pub attempt_count: u32,
    pub error: Option<OrderFailure>,
    pub completed_at: DateTime<Utc>,
}

impl OrderResult {
    fn base(req: &OrderRequest, status: OrderStatus, now: DateTime<Utc>) -> Self {
        Self {
            order_id: None,
            idempotency_key: req.idempotency_key.clone(),
            symbol: req.symbol.clone(),
            side: req.side,
            qty: req.qty,
            order_type: req.order_type,
            status,
            filled_qty: None,
            avg_fill_price: None,
            attempt_count: 0,
            error: None,
            completed_at: now,
        }
    }

    /// Placeholder returned while another request holds the key
    pub fn pending(req: &OrderRequest, now: DateTime<Utc>) -> Self {
        Self::base(req, OrderStatus::Pending, now)
    }

    pub fn failure(
        req: &OrderRequest,
        kind: OrderErrorKind,
        message: impl Into<String>,
        attempt_count: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let status = match kind {
            OrderErrorKind::KillSwitchEngaged | OrderErrorKind::ValidationError => {
                OrderStatus::Rejected
            }
            OrderErrorKind::CircuitOpen | OrderErrorKind::Unavailable | OrderErrorKind::Failed => {
                OrderStatus::Failed
            }
        };
        let mut result = Self::base(req, status, now);
        result.attempt_count = attempt_count;
        result.error = Some(OrderFailure {
            kind,
            message: message.into(),
        });
        result
    }

    pub fn error_kind(&self) -> Option<OrderErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && matches!(self.status, OrderStatus::Submitted | OrderStatus::Filled)
    }
}

/// Broker acknowledgement for a submitted order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerAck {
    pub broker_order_id: String,
    pub status: OrderStatus,
    pub filled_qty: u64,
    pub avg_fill_price: Option<Decimal>,
}

impl BrokerAck {
    pub fn into_result(self, req: &OrderRequest, attempt_count: u32, now: DateTime<Utc>) -> OrderResult {
        let mut result = OrderResult::base(req, self.status, now);
        result.order_id = Some(self.broker_order_id);
        result.filled_qty = Some(self.filled_qty);
        result.avg_fill_price = self.avg_fill_price;
        result.attempt_count = attempt_count;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_request_deserializes_wire_shape() {
        let req: OrderRequest = serde_json::from_str(
            r#"{"symbol":"AAPL","side":"buy","qty":10,"type":"limit","limit_price":"150.00","idempotency_key":"abc123"}"#,
        )
        .unwrap();
        assert_eq!(req.order_type, OrderType::Limit);
        assert_eq!(req.limit_price, Some(dec!(150.00)));

        let req: OrderRequest = serde_json::from_str(
            r#"{"symbol":"AAPL","side":"sell","qty":5,"idempotency_key":"k"}"#,
        )
        .unwrap();
        assert_eq!(req.order_type, OrderType::Market);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let mut req = OrderRequest::market("AAPL", OrderSide::Buy, 0, "abc123");
        assert!(req.validate().unwrap_err().contains("qty"));

        req.qty = 10;
        req.idempotency_key = " ".into();
        assert!(req.validate().is_err());

        let req = OrderRequest {
            order_type: OrderType::Limit,
            ..OrderRequest::market("AAPL", OrderSide::Buy, 10, "abc123")
        };
        assert!(req.validate().unwrap_err().contains("limit_price"));

        let req = OrderRequest::limit("AAPL", OrderSide::Buy, 10, dec!(-1), "abc123");
        assert!(req.validate().is_err());

        let req = OrderRequest::market("AA PL", OrderSide::Buy, 10, "abc123");
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_fingerprint_ignores_key_and_price_scale() {
        let a = OrderRequest::limit("AAPL", OrderSide::Buy, 10, dec!(150.0), "k1");
        let b = OrderRequest::limit("AAPL", OrderSide::Buy, 10, dec!(150.00), "k2");
        let c = OrderRequest::limit("AAPL", OrderSide::Sell, 10, dec!(150.00), "k1");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_failure_status_mapping() {
        let req = OrderRequest::market("AAPL", OrderSide::Buy, 10, "abc123");
        let now = Utc::now();
        let r = OrderResult::failure(&req, OrderErrorKind::KillSwitchEngaged, "halt", 0, now);
        assert_eq!(r.status, OrderStatus::Rejected);
        assert!(r.error_kind().unwrap().releases_key());

        let r = OrderResult::failure(&req, OrderErrorKind::Failed, "gave up", 4, now);
        assert_eq!(r.status, OrderStatus::Failed);
        assert!(!r.error_kind().unwrap().releases_key());
        assert!(!r.is_success());
    }

    #[test]
    fn test_ack_into_result() {
        let req = OrderRequest::market("AAPL", OrderSide::Buy, 10, "abc123");
        let ack = BrokerAck {
            broker_order_id: "ord-1".into(),
            status: OrderStatus::Filled,
            filled_qty: 10,
            avg_fill_price: Some(dec!(150.05)),
        };
        let result = ack.into_result(&req, 1, Utc::now());
        assert_eq!(result.order_id.as_deref(), Some("ord-1"));
        assert_eq!(result.filled_qty, Some(10));
        assert!(result.is_success());
    }
}
