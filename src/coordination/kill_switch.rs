//! Process-wide kill switch
//!
//! Blocks every new order submission while engaged. Reads go through an atomic
//! flag; the reason and audit fields sit behind a lock and are only touched by
//! administrative actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tracing::{error, info};

use super::clock::{Clock, SharedClock};
use crate::error::KillSwitchEngagedError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillSwitchState {
    pub engaged: bool,
    pub reason: Option<String>,
    pub set_by: Option<String>,
    pub set_at: Option<DateTime<Utc>>,
}

pub struct KillSwitch {
    engaged: AtomicBool,
    state: RwLock<KillSwitchState>,
    clock: SharedClock,
}

impl KillSwitch {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            engaged: AtomicBool::new(false),
            state: RwLock::new(KillSwitchState::default()),
            clock,
        }
    }

    /// Fast check used on the order path
    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }

    /// `Err` with the recorded reason while engaged
    pub fn check(&self) -> Result<(), KillSwitchEngagedError> {
        if !self.is_engaged() {
            return Ok(());
        }
        let reason = self
            .state()
            .reason
            .unwrap_or_else(|| "kill switch engaged".to_string());
        Err(KillSwitchEngagedError { reason })
    }

    pub fn state(&self) -> KillSwitchState {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn engage(&self, reason: &str, set_by: &str) -> KillSwitchState {
        let snapshot = {
            let mut state = self
                .state
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *state = KillSwitchState {
                engaged: true,
                reason: Some(reason.to_string()),
                set_by: Some(set_by.to_string()),
                set_at: Some(self.clock.utc_now()),
            };
            // Flag flips while the audit fields are already in place
            self.engaged.store(true, Ordering::SeqCst);
            state.clone()
        };

        error!(reason = %reason, set_by = %set_by, "KILL SWITCH ENGAGED, order submission halted");
        snapshot
    }

    pub fn release(&self, set_by: &str) -> KillSwitchState {
        let snapshot = {
            let mut state = self
                .state
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            self.engaged.store(false, Ordering::SeqCst);
            *state = KillSwitchState {
                engaged: false,
                reason: None,
                set_by: Some(set_by.to_string()),
                set_at: Some(self.clock.utc_now()),
            };
            state.clone()
        };

        info!(set_by = %set_by, "Kill switch released, order submission resumed");
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::clock::ManualClock;
    use std::sync::Arc;

    #[test]
    fn test_engage_and_release() {
        let ks = KillSwitch::new(Arc::new(ManualClock::new()));
        assert!(ks.check().is_ok());

        let state = ks.engage("broker incident", "ops");
        assert!(state.engaged);
        assert!(ks.is_engaged());
        assert_eq!(state.set_by.as_deref(), Some("ops"));
        assert!(state.set_at.is_some());

        let err = ks.check().unwrap_err();
        assert_eq!(err.reason, "broker incident");

        let state = ks.release("ops-lead");
        assert!(!state.engaged);
        assert!(state.reason.is_none());
        assert!(ks.check().is_ok());
    }
}
