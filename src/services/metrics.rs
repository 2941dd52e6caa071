use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use tracing::info;

use crate::coordination::{BreakerSnapshot, CircuitState};
use crate::domain::{OrderErrorKind, SessionState};

/// Metrics collector for observability
#[derive(Default)]
pub struct Metrics {
    // Market data
    pub quotes_received: AtomicU64,
    pub trades_received: AtomicU64,
    pub summaries_received: AtomicU64,
    pub malformed_frames: AtomicU64,
    pub upstream_connects: AtomicU64,
    pub upstream_connect_failures: AtomicU64,
    pub session_renewals: AtomicU64,
    pub stale_stream_disconnects: AtomicU64,

    // Fan-out
    pub events_delivered: AtomicU64,
    pub events_dropped: AtomicU64,
    pub consumers_evicted: AtomicU64,
    pub heartbeats_sent: AtomicU64,
    pub active_consumers: AtomicI64,
    pub upstream_subscribes: AtomicU64,
    pub upstream_unsubscribes: AtomicU64,

    // Cache
    pub cache_degraded: AtomicBool,
    pub cache_degraded_entries: AtomicU64,
    pub cache_backend_errors: AtomicU64,

    // Orders
    pub orders_received: AtomicU64,
    pub orders_succeeded: AtomicU64,
    pub orders_duplicate: AtomicU64,
    pub orders_kill_switch: AtomicU64,
    pub orders_circuit_open: AtomicU64,
    pub orders_validation: AtomicU64,
    pub orders_unavailable: AtomicU64,
    pub orders_failed: AtomicU64,
    pub broker_calls: AtomicU64,
    pub broker_retries: AtomicU64,
    pub idempotency_fail_open: AtomicU64,
}

fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_quotes(&self) {
        inc(&self.quotes_received);
    }

    pub fn inc_malformed(&self) {
        inc(&self.malformed_frames);
    }

    pub fn inc_delivered(&self) {
        inc(&self.events_delivered);
    }

    pub fn inc_dropped(&self) {
        inc(&self.events_dropped);
    }

    pub fn inc_evicted(&self) {
        inc(&self.consumers_evicted);
    }

    pub fn consumer_added(&self) {
        self.active_consumers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn consumer_removed(&self) {
        self.active_consumers.fetch_sub(1, Ordering::Relaxed);
    }

    /// Flip the degraded gauge; counts entries into degraded mode
    pub fn set_cache_degraded(&self, degraded: bool) {
        let was = self.cache_degraded.swap(degraded, Ordering::SeqCst);
        if degraded && !was {
            inc(&self.cache_degraded_entries);
        }
    }

    pub fn is_cache_degraded(&self) -> bool {
        self.cache_degraded.load(Ordering::SeqCst)
    }

    /// Count a finished order by outcome
    pub fn record_order(&self, error: Option<OrderErrorKind>, duplicate: bool) {
        if duplicate {
            inc(&self.orders_duplicate);
            return;
        }
        match error {
            None => inc(&self.orders_succeeded),
            Some(OrderErrorKind::KillSwitchEngaged) => inc(&self.orders_kill_switch),
            Some(OrderErrorKind::CircuitOpen) => inc(&self.orders_circuit_open),
            Some(OrderErrorKind::ValidationError) => inc(&self.orders_validation),
            Some(OrderErrorKind::Unavailable) => inc(&self.orders_unavailable),
            Some(OrderErrorKind::Failed) => inc(&self.orders_failed),
        }
    }

    /// Export metrics in Prometheus text format
    pub fn prometheus(
        &self,
        session_state: SessionState,
        breakers: &[BreakerSnapshot],
        kill_switch_engaged: bool,
    ) -> String {
        let mut out = String::new();
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        let counters: [(&str, &str, u64); 22] = [
            ("quoteflow_quotes_received_total", "Upstream quote frames processed", load(&self.quotes_received)),
            ("quoteflow_trades_received_total", "Upstream trade frames processed", load(&self.trades_received)),
            ("quoteflow_summaries_received_total", "Upstream summary frames processed", load(&self.summaries_received)),
            ("quoteflow_malformed_frames_total", "Upstream frames dropped as malformed", load(&self.malformed_frames)),
            ("quoteflow_upstream_connects_total", "Successful upstream connections", load(&self.upstream_connects)),
            ("quoteflow_upstream_connect_failures_total", "Failed upstream connection attempts", load(&self.upstream_connect_failures)),
            ("quoteflow_session_renewals_total", "Proactive session renewals", load(&self.session_renewals)),
            ("quoteflow_stale_stream_disconnects_total", "Connections dropped by the stale-stream watchdog", load(&self.stale_stream_disconnects)),
            ("quoteflow_events_delivered_total", "Events queued to consumers", load(&self.events_delivered)),
            ("quoteflow_events_dropped_total", "Events dropped by drop-oldest overflow", load(&self.events_dropped)),
            ("quoteflow_consumers_evicted_total", "Consumers evicted as slow or disconnected", load(&self.consumers_evicted)),
            ("quoteflow_heartbeats_sent_total", "Heartbeat events published", load(&self.heartbeats_sent)),
            ("quoteflow_upstream_subscribes_total", "Upstream subscribe requests", load(&self.upstream_subscribes)),
            ("quoteflow_upstream_unsubscribes_total", "Upstream unsubscribe requests", load(&self.upstream_unsubscribes)),
            ("quoteflow_cache_degraded_entries_total", "Times the quote cache entered degraded mode", load(&self.cache_degraded_entries)),
            ("quoteflow_cache_backend_errors_total", "Cache backend errors", load(&self.cache_backend_errors)),
            ("quoteflow_orders_received_total", "Order submissions received", load(&self.orders_received)),
            ("quoteflow_orders_duplicate_total", "Submissions answered from the idempotency store", load(&self.orders_duplicate)),
            ("quoteflow_broker_calls_total", "Broker API calls", load(&self.broker_calls)),
            ("quoteflow_broker_retries_total", "Broker call retries", load(&self.broker_retries)),
            ("quoteflow_idempotency_fail_open_total", "Orders admitted with the idempotency backend down", load(&self.idempotency_fail_open)),
            ("quoteflow_orders_succeeded_total", "Orders submitted or filled", load(&self.orders_succeeded)),
        ];

        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {} {}\n# TYPE {} counter\n{} {}\n", name, help, name, name, value);
        }

        let _ = writeln!(
            out,
            "# HELP quoteflow_orders_rejected_total Orders not executed, by reason\n# TYPE quoteflow_orders_rejected_total counter"
        );
        for (reason, counter) in [
            ("kill_switch_engaged", &self.orders_kill_switch),
            ("circuit_open", &self.orders_circuit_open),
            ("validation_error", &self.orders_validation),
            ("unavailable", &self.orders_unavailable),
            ("failed", &self.orders_failed),
        ] {
            let _ = writeln!(out, "quoteflow_orders_rejected_total{{reason=\"{}\"}} {}", reason, load(counter));
        }
        out.push('\n');

        let _ = writeln!(
            out,
            "# HELP quoteflow_active_consumers Connected stream consumers\n# TYPE quoteflow_active_consumers gauge\nquoteflow_active_consumers {}\n",
            self.active_consumers.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "# HELP quoteflow_cache_degraded Quote cache serving from the in-process map only\n# TYPE quoteflow_cache_degraded gauge\nquoteflow_cache_degraded {}\n",
            u8::from(self.is_cache_degraded())
        );
        let _ = writeln!(
            out,
            "# HELP quoteflow_kill_switch_engaged Kill switch state\n# TYPE quoteflow_kill_switch_engaged gauge\nquoteflow_kill_switch_engaged {}\n",
            u8::from(kill_switch_engaged)
        );
        let _ = writeln!(
            out,
            "# HELP quoteflow_session_connected Upstream session is live\n# TYPE quoteflow_session_connected gauge\nquoteflow_session_connected {}\n",
            u8::from(session_state.is_live())
        );

        let _ = writeln!(
            out,
            "# HELP quoteflow_breaker_state Circuit breaker state (0 closed, 1 half-open, 2 open)\n# TYPE quoteflow_breaker_state gauge"
        );
        for b in breakers {
            let value = match b.state {
                CircuitState::Closed => 0,
                CircuitState::HalfOpen => 1,
                CircuitState::Open => 2,
            };
            let _ = writeln!(out, "quoteflow_breaker_state{{breaker=\"{}\"}} {}", b.name, value);
        }
        let _ = writeln!(out, "# HELP quoteflow_breaker_trips_total Circuit breaker trips\n# TYPE quoteflow_breaker_trips_total counter");
        for b in breakers {
            let _ = writeln!(out, "quoteflow_breaker_trips_total{{breaker=\"{}\"}} {}", b.name, b.total_trips);
        }

        out
    }

    /// Log periodic status
    pub fn log_status(&self) {
        info!(
            quotes = self.quotes_received.load(Ordering::Relaxed),
            delivered = self.events_delivered.load(Ordering::Relaxed),
            dropped = self.events_dropped.load(Ordering::Relaxed),
            consumers = self.active_consumers.load(Ordering::Relaxed),
            orders = self.orders_received.load(Ordering::Relaxed),
            cache_degraded = self.is_cache_degraded(),
            "Service status"
        );
    }
}
