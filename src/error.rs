use std::time::Duration;
use thiserror::Error;

/// Main error type for the market-data and order service
#[derive(Error, Debug)]
pub enum QuoteflowError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Transient upstream error: {0}")]
    TransientUpstream(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol parse error: {0}")]
    ProtocolParse(String),

    // Resilience / policy errors
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error(transparent)]
    KillSwitchEngaged(#[from] KillSwitchEngagedError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    // Session state machine
    #[error("Invalid state transition: from {from} on {event}")]
    InvalidStateTransition { from: String, event: String },

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl QuoteflowError {
    /// Whether retrying the same operation later can succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QuoteflowError::Http(_)
                | QuoteflowError::WebSocket(_)
                | QuoteflowError::TransientUpstream(_)
                | QuoteflowError::RateLimited(_)
                | QuoteflowError::Io(_)
                | QuoteflowError::Cache(_)
        )
    }
}

/// Result type alias for QuoteflowError
pub type Result<T> = std::result::Result<T, QuoteflowError>;

/// Returned by a circuit breaker that refuses to invoke its dependency
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("circuit '{breaker}' is open, retry in {}ms", retry_after.as_millis())]
pub struct CircuitOpenError {
    pub breaker: String,
    pub retry_after: Duration,
}

/// Returned for every order submission while the kill switch is engaged
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("kill switch engaged: {reason}")]
pub struct KillSwitchEngagedError {
    pub reason: String,
}

/// Errors raised by cache backends
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache backend timed out after {0}ms")]
    Timeout(u64),

    #[error("cache value could not be decoded: {0}")]
    Decode(String),
}

/// Errors returned by a broker API call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker request timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("broker server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("broker rate limited the request")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("broker transport error: {0}")]
    Transport(String),

    #[error("order rejected: {0}")]
    Rejected(String),
}

impl BrokerError {
    /// Timeouts, 5xx, rate limits and transport errors may succeed on retry
    pub fn is_transient(&self) -> bool {
        !matches!(self, BrokerError::Rejected(_))
    }

    /// Failures that count against the broker circuit breaker
    pub fn trips_breaker(&self) -> bool {
        self.is_transient()
    }
}

impl From<BrokerError> for QuoteflowError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Rejected(msg) => QuoteflowError::Validation(msg),
            BrokerError::RateLimited { .. } => QuoteflowError::RateLimited(err.to_string()),
            other => QuoteflowError::TransientUpstream(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_classification() {
        assert!(BrokerError::Timeout { elapsed_ms: 10 }.is_transient());
        assert!(BrokerError::RateLimited { retry_after_ms: None }.trips_breaker());
        assert!(BrokerError::Server {
            status: 502,
            message: "bad gateway".into()
        }
        .is_transient());
        assert!(!BrokerError::Rejected("qty must be positive".into()).is_transient());
        assert!(!BrokerError::Rejected("qty must be positive".into()).trips_breaker());
    }

    #[test]
    fn test_broker_error_conversion() {
        let err: QuoteflowError = BrokerError::Rejected("bad symbol".into()).into();
        assert!(matches!(err, QuoteflowError::Validation(_)));
        assert!(!err.is_transient());

        let err: QuoteflowError = BrokerError::RateLimited { retry_after_ms: Some(5) }.into();
        assert!(err.is_transient());
    }

    #[test]
    fn test_upstream_error_classification() {
        assert!(QuoteflowError::TransientUpstream("stream closed".into()).is_transient());
        assert!(QuoteflowError::Cache(CacheError::Timeout(250)).is_transient());
        assert!(!QuoteflowError::Authentication("token expired".into()).is_transient());
        assert!(!QuoteflowError::InvalidConfig("empty url".into()).is_transient());
    }

    #[test]
    fn test_circuit_open_display() {
        let err = CircuitOpenError {
            breaker: "broker".into(),
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "circuit 'broker' is open, retry in 1500ms");
    }
}
