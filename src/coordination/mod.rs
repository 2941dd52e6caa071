//! Coordination primitives shared by the streaming and order paths:
//! injectable clock, retry backoff, circuit breaker, kill switch and shutdown.

pub mod backoff;
pub mod circuit_breaker;
pub mod clock;
pub mod kill_switch;
pub mod shutdown;

pub use backoff::backoff_delay;
pub use circuit_breaker::{
    BreakerCallError, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState, Permit,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use kill_switch::{KillSwitch, KillSwitchState};
pub use shutdown::{wait_for_os_signal, ShutdownSignal, ShutdownToken};
