//! Broker API clients
//!
//! [`PaperBroker`] fills against the quote cache and never leaves the process.
//! [`HttpBroker`] posts to a paper-trading REST endpoint; the idempotency key is
//! sent as the client order id so the broker can deduplicate too.

use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::QuoteCache;
use crate::config::TradingConfig;
use crate::domain::{BrokerAck, OrderRequest, OrderSide, OrderStatus, OrderType};
use crate::error::{BrokerError, QuoteflowError, Result};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerClient: Send + Sync {
    fn name(&self) -> &'static str;

    async fn submit_order(&self, req: &OrderRequest) -> std::result::Result<BrokerAck, BrokerError>;
}

/// Simulated broker filling market orders at the cached top of book
pub struct PaperBroker {
    quotes: Arc<QuoteCache>,
}

impl PaperBroker {
    pub fn new(quotes: Arc<QuoteCache>) -> Self {
        Self { quotes }
    }
}

#[async_trait]
impl BrokerClient for PaperBroker {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn submit_order(&self, req: &OrderRequest) -> std::result::Result<BrokerAck, BrokerError> {
        let order_id = format!("paper-{}", Uuid::new_v4());

        if req.order_type == OrderType::Limit {
            debug!(order_id = %order_id, symbol = %req.symbol, "Paper limit order accepted");
            return Ok(BrokerAck {
                broker_order_id: order_id,
                status: OrderStatus::Submitted,
                filled_qty: 0,
                avg_fill_price: None,
            });
        }

        let Some((quote, _)) = self.quotes.get(&req.symbol).await else {
            return Err(BrokerError::Rejected(format!(
                "no market data for {}",
                req.symbol
            )));
        };
        let touch = match req.side {
            OrderSide::Buy => quote.ask,
            OrderSide::Sell => quote.bid,
        };
        let Some(price) = touch.or(quote.last) else {
            return Err(BrokerError::Rejected(format!(
                "no price available for {}",
                req.symbol
            )));
        };

        info!(
            order_id = %order_id,
            symbol = %req.symbol,
            side = %req.side,
            qty = req.qty,
            price = %price,
            "Paper order filled"
        );
        Ok(BrokerAck {
            broker_order_id: order_id,
            status: OrderStatus::Filled,
            filled_qty: req.qty,
            avg_fill_price: Some(price),
        })
    }
}

#[derive(Debug, Serialize)]
struct HttpOrderBody<'a> {
    symbol: &'a str,
    qty: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    time_in_force: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<String>,
    client_order_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct HttpOrderResponse {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    filled_qty: Option<String>,
    #[serde(default)]
    filled_avg_price: Option<String>,
}

impl HttpOrderResponse {
    fn into_ack(self) -> BrokerAck {
        let status = match self.status.as_str() {
            "filled" => OrderStatus::Filled,
            "rejected" | "canceled" | "expired" => OrderStatus::Rejected,
            _ => OrderStatus::Submitted,
        };
        BrokerAck {
            broker_order_id: self.id,
            status,
            filled_qty: self
                .filled_qty
                .and_then(|q| q.parse::<Decimal>().ok())
                .and_then(|q| q.trunc().to_string().parse::<u64>().ok())
                .unwrap_or(0),
            avg_fill_price: self.filled_avg_price.and_then(|p| p.parse().ok()),
        }
    }
}

/// REST broker client for a paper-trading account
pub struct HttpBroker {
    http: reqwest::Client,
    base_url: String,
    key_id: Option<String>,
    secret: Option<String>,
}

impl HttpBroker {
    pub fn new(config: &TradingConfig, timeout: Duration) -> Result<Self> {
        let base_url = config
            .broker_url
            .as_deref()
            .ok_or_else(|| QuoteflowError::InvalidConfig("trading.broker_url is not set".into()))?
            .trim_end_matches('/')
            .to_string();
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            base_url,
            key_id: config.broker_key_id.clone(),
            secret: config.broker_secret.clone(),
        })
    }
}

fn classify_status(status: StatusCode, body: String) -> BrokerError {
    match status.as_u16() {
        400 | 403 | 404 | 422 => BrokerError::Rejected(body),
        429 => BrokerError::RateLimited {
            retry_after_ms: None,
        },
        code => BrokerError::Server {
            status: code,
            message: body,
        },
    }
}

#[async_trait]
impl BrokerClient for HttpBroker {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn submit_order(&self, req: &OrderRequest) -> std::result::Result<BrokerAck, BrokerError> {
        let body = HttpOrderBody {
            symbol: &req.symbol,
            qty: req.qty.to_string(),
            side: req.side.to_string(),
            order_type: req.order_type.to_string(),
            time_in_force: "day",
            limit_price: req.limit_price.map(|p| p.to_string()),
            client_order_id: &req.idempotency_key,
        };

        let mut request = self
            .http
            .post(format!("{}/v2/orders", self.base_url))
            .json(&body);
        if let (Some(key_id), Some(secret)) = (&self.key_id, &self.secret) {
            request = request
                .header("APCA-API-KEY-ID", key_id)
                .header("APCA-API-SECRET-KEY", secret);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                BrokerError::Timeout { elapsed_ms: 0 }
            } else {
                BrokerError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, text.chars().take(200).collect()));
        }

        let parsed: HttpOrderResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::Transport(format!("unreadable order response: {}", e)))?;
        Ok(parsed.into_ack())
    }
}
