//! Replicates the controller's relay state onto a remote HTTP relay.

use crate::clock::Cadence;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const MIN_PERIOD: Duration = Duration::from_secs(15);
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(20);
/// Consecutive failures before the mirror is reported degraded.
pub const DEGRADED_AFTER: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MirrorError {
    #[error("remote relay unreachable: {0}")]
    Unreachable(String),
    #[error("remote relay answered HTTP {0}")]
    Status(u16),
}

/// Remote relay that can be switched on or off.
pub trait RelayEndpoint: Send {
    fn command(&mut self, on: bool) -> Result<(), MirrorError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MirrorState {
    pub last_commanded: Option<bool>,
    pub last_success: Option<NaiveDateTime>,
    pub consecutive_failures: u32,
    pub degraded: bool,
    pub total_requests: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOutcome {
    NotDue,
    InSync,
    Mirrored(bool),
    Failed { failures: u32 },
}

pub struct RemoteRelayMirror {
    endpoint: Box<dyn RelayEndpoint>,
    cadence: Cadence,
    state: MirrorState,
}

impl RemoteRelayMirror {
    /// Periods below 15 s are raised to 15 s.
    pub fn new(endpoint: Box<dyn RelayEndpoint>, period: Duration) -> Self {
        Self {
            endpoint,
            cadence: Cadence::new(period.max(MIN_PERIOD)),
            state: MirrorState::default(),
        }
    }

    pub fn period(&self) -> Duration {
        self.cadence.period()
    }

    pub fn state(&self) -> MirrorState {
        self.state
    }

    pub fn tick(&mut self, now_ms: u64, wall: NaiveDateTime, relay_on: bool) -> MirrorOutcome {
        if !self.cadence.due(now_ms) {
            return MirrorOutcome::NotDue;
        }
        if self.state.last_commanded == Some(relay_on) && self.state.consecutive_failures == 0 {
            return MirrorOutcome::InSync;
        }

        self.state.total_requests += 1;
        match self.endpoint.command(relay_on) {
            Ok(()) => {
                debug!(relay_on, "remote relay updated");
                self.state.last_commanded = Some(relay_on);
                self.state.last_success = Some(wall);
                self.state.consecutive_failures = 0;
                if self.state.degraded {
                    self.state.degraded = false;
                    info!("remote relay mirror restored");
                }
                MirrorOutcome::Mirrored(relay_on)
            }
            Err(e) => {
                self.state.consecutive_failures += 1;
                if self.state.consecutive_failures >= DEGRADED_AFTER && !self.state.degraded {
                    self.state.degraded = true;
                    warn!(failures = self.state.consecutive_failures, error = %e, "remote relay mirror degraded");
                } else {
                    debug!(error = %e, "remote relay update failed");
                }
                MirrorOutcome::Failed {
                    failures: self.state.consecutive_failures,
                }
            }
        }
    }
}

impl core::fmt::Debug for RemoteRelayMirror {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RemoteRelayMirror")
            .field("period", &self.cadence.period())
            .field("state", &self.state)
            .finish()
    }
}
