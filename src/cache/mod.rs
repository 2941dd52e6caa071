//! Quote cache and its pluggable backends

pub mod backend;
pub mod postgres;
pub mod quote_cache;

pub use backend::{CacheBackend, InMemoryBackend};
pub use postgres::PostgresBackend;
pub use quote_cache::QuoteCache;
