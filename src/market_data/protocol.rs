//! Upstream wire protocol
//!
//! Client → server control frames: `{"action":"subscribe","symbols":[..]}`,
//! `{"action":"unsubscribe","symbols":[..]}` and `{"action":"auth","token":".."}`.
//! Server → client data frames are tagged by `type` (`quote`, `trade`,
//! `summary`, `error`) and may arrive alone or batched in a JSON array.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{Quote, SessionSummary, TradeTick};
use crate::error::{QuoteflowError, Result};

const PREVIEW_CHARS: usize = 200;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ControlFrame {
    Subscribe { symbols: Vec<String> },
    Unsubscribe { symbols: Vec<String> },
    Auth { token: String },
}

impl ControlFrame {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl std::fmt::Debug for ControlFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlFrame::Subscribe { symbols } => write!(f, "Subscribe({:?})", symbols),
            ControlFrame::Unsubscribe { symbols } => write!(f, "Unsubscribe({:?})", symbols),
            ControlFrame::Auth { .. } => write!(f, "Auth(<redacted>)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QuoteFrame {
    pub symbol: String,
    #[serde(default)]
    pub bid: Option<Decimal>,
    #[serde(default)]
    pub ask: Option<Decimal>,
    #[serde(default)]
    pub last: Option<Decimal>,
    #[serde(default)]
    pub volume: Option<u64>,
    #[serde(default, alias = "ts")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TradeFrame {
    pub symbol: String,
    pub price: Decimal,
    #[serde(default)]
    pub size: u64,
    #[serde(default, alias = "ts")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SummaryFrame {
    pub symbol: String,
    #[serde(default)]
    pub open: Option<Decimal>,
    #[serde(default)]
    pub high: Option<Decimal>,
    #[serde(default)]
    pub low: Option<Decimal>,
    #[serde(default)]
    pub close: Option<Decimal>,
    #[serde(default)]
    pub volume: u64,
    #[serde(default, alias = "ts")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Provider-reported error, e.g. an expired token or a session limit
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorFrame {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl ErrorFrame {
    /// Errors that require a fresh session rather than a plain retry
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self.code.as_deref(),
            Some("unauthorized") | Some("auth_failed") | Some("session_expired") | Some("session_limit")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UpstreamFrame {
    Quote(QuoteFrame),
    Trade(TradeFrame),
    Summary(SummaryFrame),
    Error(ErrorFrame),
}

impl UpstreamFrame {
    pub fn symbol(&self) -> Option<&str> {
        match self {
            UpstreamFrame::Quote(q) => Some(&q.symbol),
            UpstreamFrame::Trade(t) => Some(&t.symbol),
            UpstreamFrame::Summary(s) => Some(&s.symbol),
            UpstreamFrame::Error(_) => None,
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        let negative = |p: &Option<Decimal>| p.map(|v| v < Decimal::ZERO).unwrap_or(false);
        match self {
            UpstreamFrame::Quote(q) => {
                if q.symbol.is_empty() {
                    return Err("quote without symbol".into());
                }
                if negative(&q.bid) || negative(&q.ask) || negative(&q.last) {
                    return Err(format!("negative price in quote for {}", q.symbol));
                }
            }
            UpstreamFrame::Trade(t) => {
                if t.symbol.is_empty() {
                    return Err("trade without symbol".into());
                }
                if t.price < Decimal::ZERO {
                    return Err(format!("negative trade price for {}", t.symbol));
                }
            }
            UpstreamFrame::Summary(s) => {
                if s.symbol.is_empty() {
                    return Err("summary without symbol".into());
                }
            }
            UpstreamFrame::Error(_) => {}
        }
        Ok(())
    }

    /// Fold a data frame into the latest quote for its symbol.
    ///
    /// Fields absent from a quote frame keep their previous values. Returns `None`
    /// for error frames.
    pub fn merge_into(&self, previous: Option<&Quote>, received_at: DateTime<Utc>) -> Option<Quote> {
        match self {
            UpstreamFrame::Quote(f) => {
                let source_timestamp = f.timestamp.unwrap_or(received_at);
                let mut quote = previous
                    .cloned()
                    .unwrap_or_else(|| Quote::empty(&f.symbol, source_timestamp, received_at));
                quote.bid = f.bid.or(quote.bid);
                quote.ask = f.ask.or(quote.ask);
                quote.last = f.last.or(quote.last);
                if let Some(volume) = f.volume {
                    quote.volume = volume;
                }
                quote.source_timestamp = source_timestamp;
                quote.received_at = received_at;
                Some(quote)
            }
            UpstreamFrame::Trade(f) => {
                let tick = TradeTick {
                    symbol: f.symbol.clone(),
                    price: f.price,
                    size: f.size,
                    timestamp: f.timestamp.unwrap_or(received_at),
                };
                let mut quote = previous
                    .cloned()
                    .unwrap_or_else(|| Quote::empty(&f.symbol, tick.timestamp, received_at));
                quote.apply_trade(&tick, received_at);
                Some(quote)
            }
            UpstreamFrame::Summary(f) => {
                let summary = SessionSummary {
                    symbol: f.symbol.clone(),
                    open: f.open,
                    high: f.high,
                    low: f.low,
                    close: f.close,
                    volume: f.volume,
                    timestamp: f.timestamp.unwrap_or(received_at),
                };
                let mut quote = previous
                    .cloned()
                    .unwrap_or_else(|| Quote::empty(&f.symbol, summary.timestamp, received_at));
                quote.apply_summary(&summary, received_at);
                Some(quote)
            }
            UpstreamFrame::Error(_) => None,
        }
    }
}

/// First characters of a frame, for log lines
pub fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

/// Decode one text message into frames. A message is either a single frame or an array.
///
/// Array elements are decoded independently: malformed elements are returned as
/// errors alongside the good frames so one bad element does not drop the batch.
pub fn decode(text: &str) -> Vec<Result<UpstreamFrame>> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            return vec![Err(QuoteflowError::ProtocolParse(format!(
                "invalid JSON ({}): {}",
                e,
                preview(text)
            )))]
        }
    };

    match value {
        serde_json::Value::Array(items) => items.into_iter().map(decode_value).collect(),
        other => vec![decode_value(other)],
    }
}

fn decode_value(value: serde_json::Value) -> Result<UpstreamFrame> {
    let frame: UpstreamFrame = serde_json::from_value(value.clone()).map_err(|e| {
        QuoteflowError::ProtocolParse(format!("{}: {}", e, preview(&value.to_string())))
    })?;
    frame.validate().map_err(QuoteflowError::ProtocolParse)?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_control_frames_encode() {
        let sub = ControlFrame::Subscribe {
            symbols: vec!["AAPL".into(), "MSFT".into()],
        };
        assert_eq!(
            sub.encode().unwrap(),
            r#"{"action":"subscribe","symbols":["AAPL","MSFT"]}"#
        );

        let auth = ControlFrame::Auth {
            token: "tok-123".into(),
        };
        assert_eq!(auth.encode().unwrap(), r#"{"action":"auth","token":"tok-123"}"#);
        assert!(!format!("{:?}", auth).contains("tok-123"));
    }

    #[test]
    fn test_decode_quote_frame() {
        let frames = decode(r#"{"type":"quote","symbol":"AAPL","bid":150.00,"ask":"150.05"}"#);
        assert_eq!(frames.len(), 1);
        match frames.into_iter().next().unwrap().unwrap() {
            UpstreamFrame::Quote(q) => {
                assert_eq!(q.symbol, "AAPL");
                assert_eq!(q.bid, Some(dec!(150.00)));
                assert_eq!(q.ask, Some(dec!(150.05)));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_decode_batch_keeps_good_frames() {
        let frames = decode(
            r#"[{"type":"trade","symbol":"AAPL","price":"150.02","size":100},
                {"type":"bogus"},
                {"type":"summary","symbol":"AAPL","close":"150.10","volume":5000}]"#,
        );
        assert_eq!(frames.len(), 3);
        assert!(frames[0].is_ok());
        assert!(matches!(frames[1], Err(QuoteflowError::ProtocolParse(_))));
        assert!(frames[2].is_ok());
    }

    #[test]
    fn test_malformed_frames_are_parse_errors() {
        for text in [
            "not json",
            r#"{"symbol":"AAPL"}"#,
            r#"{"type":"quote","bid":"1"}"#,
            r#"{"type":"quote","symbol":"AAPL","bid":"-1"}"#,
            r#"{"type":"trade","symbol":"AAPL"}"#,
        ] {
            let frames = decode(text);
            assert_eq!(frames.len(), 1, "{}", text);
            assert!(
                matches!(frames[0], Err(QuoteflowError::ProtocolParse(_))),
                "{}",
                text
            );
        }
    }

    #[test]
    fn test_merge_keeps_previous_fields() {
        let now = Utc::now();
        let first = decode(r#"{"type":"quote","symbol":"AAPL","bid":"150.00","ask":"150.05"}"#)
            .remove(0)
            .unwrap()
            .merge_into(None, now)
            .unwrap();

        let trade = decode(r#"{"type":"trade","symbol":"AAPL","price":"150.03","size":200}"#)
            .remove(0)
            .unwrap();
        let merged = trade.merge_into(Some(&first), now).unwrap();
        assert_eq!(merged.bid, Some(dec!(150.00)));
        assert_eq!(merged.last, Some(dec!(150.03)));
        assert_eq!(merged.volume, 200);

        let update = decode(r#"{"type":"quote","symbol":"AAPL","ask":"150.06"}"#)
            .remove(0)
            .unwrap();
        let merged = update.merge_into(Some(&merged), now).unwrap();
        assert_eq!(merged.bid, Some(dec!(150.00)));
        assert_eq!(merged.ask, Some(dec!(150.06)));
    }

    #[test]
    fn test_error_frame_classification() {
        let frame = decode(r#"{"type":"error","code":"session_expired","message":"token expired"}"#)
            .remove(0)
            .unwrap();
        match frame {
            UpstreamFrame::Error(e) => assert!(e.is_auth_error()),
            other => panic!("unexpected frame {:?}", other),
        }
    }
}
