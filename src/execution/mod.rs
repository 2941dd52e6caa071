//! Order execution: broker clients, idempotency store and the submission pipeline

pub mod broker;
pub mod idempotency;
pub mod pipeline;

pub use broker::{BrokerClient, HttpBroker, PaperBroker};
pub use idempotency::{Claim, IdempotencyStore};
pub use pipeline::{Disposition, OrderPipeline, RetryPolicy};
