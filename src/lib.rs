pub mod api;
pub mod cache;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod execution;
pub mod market_data;
pub mod safety;
pub mod services;

pub use cache::{CacheBackend, InMemoryBackend, QuoteCache};
pub use config::AppConfig;
pub use coordination::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, Clock, KillSwitch, ManualClock,
    SharedClock, ShutdownSignal, SystemClock,
};
pub use domain::{OrderRequest, OrderResult, OrderStatus, Quote, SessionState, StreamEvent};
pub use error::{QuoteflowError, Result};
pub use execution::{BrokerClient, IdempotencyStore, OrderPipeline};
pub use market_data::{
    FanoutDistributor, MarketDataProvider, SessionManager, SubscriptionRegistry, UpstreamStream,
};
pub use services::{Metrics, ServiceContext};
