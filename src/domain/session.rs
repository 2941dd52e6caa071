use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QuoteflowError, Result};

/// Credentials handed out by the provider's create-session call
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct SessionGrant {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for SessionGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGrant")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Authenticated, time-bounded handle to the upstream stream
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub renewal_due_at: DateTime<Utc>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("renewal_due_at", &self.renewal_due_at)
            .finish()
    }
}

impl Session {
    /// Build a session from a grant, scheduling renewal `renew_before` ahead of expiry.
    ///
    /// Grants shorter than `renew_before` renew at the midpoint of their lifetime.
    pub fn from_grant(grant: SessionGrant, now: DateTime<Utc>, renew_before: Duration) -> Self {
        let lifetime = grant.expires_at - now;
        let renewal_due_at = if lifetime > renew_before {
            grant.expires_at - renew_before
        } else {
            now + lifetime / 2
        };

        Self {
            token: grant.token,
            created_at: now,
            expires_at: grant.expires_at,
            renewal_due_at: renewal_due_at.max(now),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left until the renewal timer should fire
    pub fn until_renewal(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.renewal_due_at - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}

/// Upstream connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Renewing,
    Backoff,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Connected => "connected",
            SessionState::Renewing => "renewing",
            SessionState::Backoff => "backoff",
        }
    }

    /// Quotes are flowing in these states
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Renewing)
    }

    /// Transition table for the session state machine.
    ///
    /// ```text
    /// Disconnected --Connect--> Connecting --SessionCreated--> Authenticating
    /// Authenticating --Authenticated--> Connected --RenewalDue--> Renewing --Renewed--> Connected
    /// Connecting|Authenticating|Connected|Renewing --ConnectionFailed--> Backoff
    /// Backoff --Retry--> Connecting
    /// any --Shutdown--> Disconnected
    /// ```
    pub fn on(self, event: SessionEvent) -> Result<SessionState> {
        use SessionEvent as E;
        use SessionState as S;

        let next = match (self, event) {
            (_, E::Shutdown) => S::Disconnected,
            (S::Disconnected, E::Connect) => S::Connecting,
            (S::Connecting, E::SessionCreated) => S::Authenticating,
            (S::Authenticating, E::Authenticated) => S::Connected,
            (S::Connected, E::RenewalDue) => S::Renewing,
            (S::Renewing, E::Renewed) => S::Connected,
            (S::Connecting | S::Authenticating | S::Connected | S::Renewing, E::ConnectionFailed) => {
                S::Backoff
            }
            (S::Backoff, E::Retry) => S::Connecting,
            (from, event) => {
                return Err(QuoteflowError::InvalidStateTransition {
                    from: from.to_string(),
                    event: format!("{:?}", event),
                })
            }
        };

        Ok(next)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Inputs to the session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connect,
    SessionCreated,
    Authenticated,
    RenewalDue,
    Renewed,
    ConnectionFailed,
    Retry,
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(expires_in_secs: i64, now: DateTime<Utc>) -> SessionGrant {
        SessionGrant {
            token: "secret-token".to_string(),
            expires_at: now + Duration::seconds(expires_in_secs),
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        let s = SessionState::Disconnected;
        let s = s.on(SessionEvent::Connect).unwrap();
        assert_eq!(s, SessionState::Connecting);
        let s = s.on(SessionEvent::SessionCreated).unwrap();
        assert_eq!(s, SessionState::Authenticating);
        let s = s.on(SessionEvent::Authenticated).unwrap();
        assert_eq!(s, SessionState::Connected);
        let s = s.on(SessionEvent::RenewalDue).unwrap();
        assert_eq!(s, SessionState::Renewing);
        let s = s.on(SessionEvent::Renewed).unwrap();
        assert_eq!(s, SessionState::Connected);
    }

    #[test]
    fn test_failure_path_transitions() {
        for from in [
            SessionState::Connecting,
            SessionState::Authenticating,
            SessionState::Connected,
            SessionState::Renewing,
        ] {
            assert_eq!(
                from.on(SessionEvent::ConnectionFailed).unwrap(),
                SessionState::Backoff
            );
        }
        assert_eq!(
            SessionState::Backoff.on(SessionEvent::Retry).unwrap(),
            SessionState::Connecting
        );
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        assert!(SessionState::Disconnected
            .on(SessionEvent::Authenticated)
            .is_err());
        assert!(SessionState::Connected.on(SessionEvent::Connect).is_err());
        assert!(SessionState::Backoff.on(SessionEvent::RenewalDue).is_err());
        assert!(SessionState::Disconnected
            .on(SessionEvent::ConnectionFailed)
            .is_err());
    }

    #[test]
    fn test_shutdown_from_any_state() {
        for from in [
            SessionState::Disconnected,
            SessionState::Connecting,
            SessionState::Authenticating,
            SessionState::Connected,
            SessionState::Renewing,
            SessionState::Backoff,
        ] {
            assert_eq!(
                from.on(SessionEvent::Shutdown).unwrap(),
                SessionState::Disconnected
            );
        }
    }

    #[test]
    fn test_renewal_scheduled_before_expiry() {
        let now = Utc::now();
        let session = Session::from_grant(grant(3600, now), now, Duration::seconds(60));
        assert_eq!(session.renewal_due_at, session.expires_at - Duration::seconds(60));
        assert!(!session.is_expired(now));
        assert_eq!(session.until_renewal(now).as_secs(), 3540);
    }

    #[test]
    fn test_short_grant_renews_at_midpoint() {
        let now = Utc::now();
        let session = Session::from_grant(grant(40, now), now, Duration::seconds(60));
        assert_eq!(session.renewal_due_at, now + Duration::seconds(20));
    }

    #[test]
    fn test_debug_redacts_token() {
        let now = Utc::now();
        let session = Session::from_grant(grant(40, now), now, Duration::seconds(60));
        let rendered = format!("{:?}", session);
        assert!(!rendered.contains("secret-token"));
    }
}
