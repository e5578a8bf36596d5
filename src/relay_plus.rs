//! RelayPlus: daily run-time bounds for the controller's relay output.
//!
//! A cycle starts at the reference hour and lasts 24 h. While the relay is
//! seen on, its on-time accumulates; once the maximum is reached the relay is
//! forced off for the rest of the cycle. In forced mode the relay is held on
//! until the minimum has been reached.

use crate::clock::DailyTime;
use chrono::{NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const MINUTES_PER_DAY: u32 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayPlusSettings {
    pub min_minutes: u32,
    pub max_minutes: u32,
    pub reference: DailyTime,
    pub forced: bool,
}

impl Default for RelayPlusSettings {
    fn default() -> Self {
        Self {
            min_minutes: 60,
            max_minutes: 480,
            reference: DailyTime::new(21, 0).unwrap_or(DailyTime::MIDNIGHT),
            forced: false,
        }
    }
}

impl RelayPlusSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.min_minutes > self.max_minutes {
            return Err(format!(
                "minimum run time {} min exceeds maximum {} min",
                self.min_minutes, self.max_minutes
            ));
        }
        if self.max_minutes > MINUTES_PER_DAY {
            return Err(format!("maximum run time {} min exceeds one day", self.max_minutes));
        }
        Ok(())
    }
}

/// Relay override requested by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPlusAction {
    /// Maximum reached: hold the relay off until the next cycle.
    ForceOff,
    /// Forced mode below the minimum: hold the relay on.
    KeepOn,
    /// End the override and restore the mode the relay had before it.
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RelayPlusSummary {
    pub cycle_start: Option<NaiveDateTime>,
    pub on_minutes: f64,
    pub min_minutes: u32,
    pub max_minutes: u32,
    pub forced: bool,
    pub forced_off: bool,
    pub keeping_on: bool,
}

#[derive(Debug, Clone)]
pub struct RelayPlusScheduler {
    settings: RelayPlusSettings,
    cycle_start: Option<NaiveDateTime>,
    accumulated: TimeDelta,
    last_seen_on: Option<NaiveDateTime>,
    forced_off: bool,
    keeping_on: bool,
}

impl RelayPlusScheduler {
    pub fn new(settings: RelayPlusSettings) -> Self {
        Self {
            settings,
            cycle_start: None,
            accumulated: TimeDelta::zero(),
            last_seen_on: None,
            forced_off: false,
            keeping_on: false,
        }
    }

    pub fn settings(&self) -> RelayPlusSettings {
        self.settings
    }

    pub fn set_settings(&mut self, settings: RelayPlusSettings) {
        self.settings = settings;
    }

    pub fn accumulated(&self) -> TimeDelta {
        self.accumulated
    }

    pub fn is_forced_off(&self) -> bool {
        self.forced_off
    }

    /// Advances the cycle with the relay state observed at `now`.
    pub fn tick(&mut self, now: NaiveDateTime, relay_on: bool) -> Option<RelayPlusAction> {
        let cycle_start = self.settings.reference.last_at_or_before(now);
        if self.cycle_start != Some(cycle_start) {
            let was_overriding = self.forced_off || self.keeping_on;
            if self.cycle_start.is_some() {
                info!(
                    on_minutes = self.accumulated.num_minutes(),
                    "relay cycle closed"
                );
            }
            self.cycle_start = Some(cycle_start);
            self.accumulated = TimeDelta::zero();
            self.last_seen_on = relay_on.then_some(now);
            self.forced_off = false;
            self.keeping_on = false;
            if was_overriding {
                return Some(RelayPlusAction::Release);
            }
        } else {
            if let Some(since) = self.last_seen_on {
                if now > since {
                    self.accumulated += now - since;
                }
            }
            self.last_seen_on = relay_on.then_some(now);
        }

        let max = TimeDelta::minutes(i64::from(self.settings.max_minutes));
        let min = TimeDelta::minutes(i64::from(self.settings.min_minutes));

        if self.forced_off {
            // Switched back on by someone else while the maximum holds.
            if relay_on {
                info!("relay on past its maximum run time, forcing off again");
                self.last_seen_on = None;
                return Some(RelayPlusAction::ForceOff);
            }
            return None;
        }
        if self.accumulated >= max {
            info!(max_minutes = self.settings.max_minutes, "relay maximum run time reached");
            self.forced_off = true;
            self.keeping_on = false;
            self.last_seen_on = None;
            return Some(RelayPlusAction::ForceOff);
        }
        if self.settings.forced {
            if self.accumulated < min && !self.keeping_on {
                self.keeping_on = true;
                return Some(RelayPlusAction::KeepOn);
            }
            if self.accumulated >= min && self.keeping_on {
                self.keeping_on = false;
                return Some(RelayPlusAction::Release);
            }
        } else if self.keeping_on {
            self.keeping_on = false;
            return Some(RelayPlusAction::Release);
        }
        None
    }

    pub fn summary(&self) -> RelayPlusSummary {
        RelayPlusSummary {
            cycle_start: self.cycle_start,
            on_minutes: self.accumulated.num_seconds() as f64 / 60.0,
            min_minutes: self.settings.min_minutes,
            max_minutes: self.settings.max_minutes,
            forced: self.settings.forced,
            forced_off: self.forced_off,
            keeping_on: self.keeping_on,
        }
    }
}
