//! Escalation for outages that outlast the cycle-local error handling.
//!
//! Serial and network failures are normally just skipped cycles. When the
//! controller has not answered a poll for `link_restart`, or the telemetry
//! transport has been disconnected for `network_timeout`, the watchdog asks
//! the owner to rebuild that subsystem. The timer re-arms after firing, so a
//! long outage yields one restart per window.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogSettings {
    /// Zero disables serial restarts.
    pub link_restart: Duration,
    /// Zero disables network restarts.
    pub network_timeout: Duration,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            link_restart: Duration::from_secs(60),
            network_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WatchdogState {
    pub serial_restarts: u32,
    pub network_restarts: u32,
    pub link_silent_ms: u64,
    pub network_silent_ms: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogActions {
    pub restart_serial: bool,
    pub restart_network: bool,
}

impl WatchdogActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_actions(&self) -> bool {
        self.restart_serial || self.restart_network
    }
}

#[derive(Debug)]
pub struct Watchdog {
    settings: WatchdogSettings,
    state: WatchdogState,
    link_fed_ms: u64,
    network_fed_ms: u64,
}

impl Watchdog {
    pub fn new(settings: WatchdogSettings, now_ms: u64) -> Self {
        Self {
            settings,
            state: WatchdogState::default(),
            link_fed_ms: now_ms,
            network_fed_ms: now_ms,
        }
    }

    /// A statistics poll succeeded.
    pub fn feed_link(&mut self, now_ms: u64) {
        self.link_fed_ms = now_ms;
    }

    /// The telemetry transport reported itself connected.
    pub fn feed_network(&mut self, now_ms: u64) {
        self.network_fed_ms = now_ms;
    }

    /// `watch_network` is false when no transport is configured.
    pub fn check(&mut self, now_ms: u64, watch_network: bool) -> WatchdogActions {
        let mut actions = WatchdogActions::new();

        self.state.link_silent_ms = now_ms.saturating_sub(self.link_fed_ms);
        let link_limit = self.settings.link_restart.as_millis() as u64;
        if link_limit > 0 && self.state.link_silent_ms >= link_limit {
            warn!(silent_ms = self.state.link_silent_ms, "controller silent, restarting serial session");
            actions.restart_serial = true;
            self.state.serial_restarts += 1;
            self.link_fed_ms = now_ms;
        }

        if watch_network {
            self.state.network_silent_ms = now_ms.saturating_sub(self.network_fed_ms);
            let network_limit = self.settings.network_timeout.as_millis() as u64;
            if network_limit > 0 && self.state.network_silent_ms >= network_limit {
                warn!(silent_ms = self.state.network_silent_ms, "network unreachable, restarting transport");
                actions.restart_network = true;
                self.state.network_restarts += 1;
                self.network_fed_ms = now_ms;
            }
        } else {
            self.network_fed_ms = now_ms;
            self.state.network_silent_ms = 0;
        }

        actions
    }

    pub fn state(&self) -> WatchdogState {
        self.state
    }
}
