//! Upstream market data: provider protocol, session management, subscription
//! tracking and fan-out to downstream consumers.

pub mod fanout;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod session;

pub use fanout::{ConsumerReceiver, FanoutDistributor, StreamSubscription};
pub use protocol::{ControlFrame, UpstreamFrame};
pub use provider::{MarketDataProvider, UpstreamStream, WsProvider};
pub use registry::{ConsumerId, SubscriptionRegistry, UpstreamControl};
pub use session::{SessionControl, SessionManager, SessionSettings};
