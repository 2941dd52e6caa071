use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::SessionState;

/// Normalized top-of-book quote for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub last: Option<Decimal>,
    pub volume: u64,
    /// Timestamp assigned by the upstream provider
    pub source_timestamp: DateTime<Utc>,
    /// Local receive time, drives staleness
    pub received_at: DateTime<Utc>,
}

impl Quote {
    /// Calculate spread in basis points
    pub fn spread_bps(&self) -> Option<u32> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) if bid > Decimal::ZERO => {
                let spread = (ask - bid) / bid * Decimal::from(10000);
                spread.round().to_string().parse::<u32>().ok()
            }
            _ => None,
        }
    }

    /// Get mid price
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::from(2)),
            (Some(bid), None) => Some(bid),
            (None, Some(ask)) => Some(ask),
            (None, None) => self.last,
        }
    }

    /// Age relative to `now`, in milliseconds (never negative)
    pub fn age_ms(&self, now: DateTime<Utc>) -> u64 {
        (now - self.received_at).num_milliseconds().max(0) as u64
    }

    /// A quote is stale once `now - received_at` exceeds the TTL
    pub fn is_stale(&self, now: DateTime<Utc>, ttl_ms: u64) -> bool {
        self.age_ms(now) > ttl_ms
    }

    /// Fold a trade print into the quote
    pub fn apply_trade(&mut self, trade: &TradeTick, received_at: DateTime<Utc>) {
        self.last = Some(trade.price);
        self.volume = self.volume.saturating_add(trade.size);
        self.source_timestamp = trade.timestamp;
        self.received_at = received_at;
    }

    /// Fold a session summary into the quote; the summary carries cumulative volume
    pub fn apply_summary(&mut self, summary: &SessionSummary, received_at: DateTime<Utc>) {
        if let Some(close) = summary.close {
            self.last = Some(close);
        }
        self.volume = summary.volume;
        self.source_timestamp = summary.timestamp;
        self.received_at = received_at;
    }

    /// Empty quote used when a trade or summary arrives before any quote
    pub fn empty(symbol: &str, source_timestamp: DateTime<Utc>, received_at: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            bid: None,
            ask: None,
            last: None,
            volume: 0,
            source_timestamp,
            received_at,
        }
    }
}

/// Individual trade print from the upstream feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeTick {
    pub symbol: String,
    pub price: Decimal,
    pub size: u64,
    pub timestamp: DateTime<Utc>,
}

/// Rolling daily summary from the upstream feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub symbol: String,
    pub open: Option<Decimal>,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    pub close: Option<Decimal>,
    pub volume: u64,
    pub timestamp: DateTime<Utc>,
}

/// Liveness marker sent to every consumer of a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub symbol: String,
    pub at: DateTime<Utc>,
    /// Upstream session state at the time of the heartbeat
    pub upstream: SessionState,
    /// True when the cached quote is older than the TTL or missing
    pub stale: bool,
    pub last_quote_at: Option<DateTime<Utc>>,
}

/// Event delivered to downstream consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Quote(Quote),
    Heartbeat(Heartbeat),
}

impl StreamEvent {
    pub fn symbol(&self) -> &str {
        match self {
            StreamEvent::Quote(q) => &q.symbol,
            StreamEvent::Heartbeat(h) => &h.symbol,
        }
    }
}
