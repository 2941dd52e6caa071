//! Health aggregation for the `/health` endpoint

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coordination::{BreakerSnapshot, CircuitState, KillSwitchState};
use crate::domain::SessionState;

/// Health status for a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// Worst of two statuses
    pub fn combine(self, other: HealthStatus) -> HealthStatus {
        use HealthStatus::*;
        match (self, other) {
            (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
            (Degraded, _) | (_, Degraded) => Degraded,
            _ => Healthy,
        }
    }
}

/// Component health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentHealth {
    fn new(name: &str, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message,
        }
    }
}

/// Overall service health
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub upstream: SessionState,
    pub cache_degraded: bool,
    pub kill_switch: KillSwitchState,
    pub breakers: Vec<BreakerSnapshot>,
    pub components: Vec<ComponentHealth>,
    pub active_symbols: usize,
}

/// Inputs gathered from the running services
pub struct HealthInputs {
    pub now: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub upstream: SessionState,
    pub cache_degraded: bool,
    pub cache_backend: &'static str,
    pub kill_switch: KillSwitchState,
    pub breakers: Vec<BreakerSnapshot>,
    pub active_symbols: usize,
}

/// Unhealthy only when market data is down with its breaker open; everything
/// short of that that still serves requests is degraded
pub fn evaluate(inputs: HealthInputs) -> HealthResponse {
    let mut components = Vec::new();

    let upstream_breaker_open = inputs
        .breakers
        .iter()
        .any(|b| b.name == "upstream" && b.state == CircuitState::Open);
    let upstream_status = if inputs.upstream.is_live() {
        HealthStatus::Healthy
    } else if upstream_breaker_open {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Degraded
    };
    components.push(ComponentHealth::new(
        "upstream",
        upstream_status,
        Some(format!("session {}", inputs.upstream)),
    ));

    components.push(ComponentHealth::new(
        "quote_cache",
        if inputs.cache_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        },
        inputs
            .cache_degraded
            .then(|| format!("{} backend unreachable, serving from memory", inputs.cache_backend)),
    ));

    for breaker in inputs.breakers.iter().filter(|b| b.name != "upstream") {
        let status = match breaker.state {
            CircuitState::Closed => HealthStatus::Healthy,
            CircuitState::HalfOpen | CircuitState::Open => HealthStatus::Degraded,
        };
        components.push(ComponentHealth::new(
            &format!("breaker:{}", breaker.name),
            status,
            Some(breaker.state.to_string()),
        ));
    }

    components.push(ComponentHealth::new(
        "kill_switch",
        if inputs.kill_switch.engaged {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        },
        inputs.kill_switch.reason.clone(),
    ));

    let status = components
        .iter()
        .fold(HealthStatus::Healthy, |acc, c| acc.combine(c.status));

    HealthResponse {
        status,
        timestamp: inputs.now,
        uptime_seconds: (inputs.now - inputs.started_at).num_seconds().max(0) as u64,
        upstream: inputs.upstream,
        cache_degraded: inputs.cache_degraded,
        kill_switch: inputs.kill_switch,
        breakers: inputs.breakers,
        components,
        active_symbols: inputs.active_symbols,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(name: &str, state: CircuitState) -> BreakerSnapshot {
        BreakerSnapshot {
            name: name.to_string(),
            state,
            failure_count: 0,
            last_failure_at: None,
            cooldown_remaining_ms: 0,
            total_trips: 0,
            rejected_calls: 0,
        }
    }

    fn inputs(upstream: SessionState, breakers: Vec<BreakerSnapshot>) -> HealthInputs {
        let now = Utc::now();
        HealthInputs {
            now,
            started_at: now - chrono::Duration::seconds(90),
            upstream,
            cache_degraded: false,
            cache_backend: "memory",
            kill_switch: KillSwitchState::default(),
            breakers,
            active_symbols: 2,
        }
    }

    #[test]
    fn test_connected_is_healthy() {
        let health = evaluate(inputs(
            SessionState::Connected,
            vec![breaker("upstream", CircuitState::Closed), breaker("broker", CircuitState::Closed)],
        ));
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.uptime_seconds, 90);
    }

    #[test]
    fn test_reconnecting_or_degraded_cache_is_degraded() {
        let health = evaluate(inputs(SessionState::Backoff, vec![breaker("upstream", CircuitState::Closed)]));
        assert_eq!(health.status, HealthStatus::Degraded);

        let mut degraded = inputs(SessionState::Connected, vec![]);
        degraded.cache_degraded = true;
        assert_eq!(evaluate(degraded).status, HealthStatus::Degraded);
    }

    #[test]
    fn test_open_upstream_breaker_is_unhealthy() {
        let health = evaluate(inputs(SessionState::Backoff, vec![breaker("upstream", CircuitState::Open)]));
        assert_eq!(health.status, HealthStatus::Unhealthy);
    }
}
