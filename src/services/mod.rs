pub mod context;
pub mod health;
pub mod metrics;

pub use context::ServiceContext;
pub use health::{ComponentHealth, HealthResponse, HealthStatus};
pub use metrics::Metrics;
