//! Timed high-priority routing ("boost").
//!
//! A boost forces the triac to an elevated routing ratio for a fixed number
//! of minutes, either on request or once a day at a configured trigger time.

use crate::clock::DailyTime;
use chrono::{NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const MAX_RATIO: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoostSettings {
    pub ratio: u8,
    pub duration_min: u32,
    /// Daily start time; `None` disables the schedule.
    pub trigger: Option<DailyTime>,
}

impl Default for BoostSettings {
    fn default() -> Self {
        Self {
            ratio: MAX_RATIO,
            duration_min: 120,
            trigger: None,
        }
    }
}

impl BoostSettings {
    fn duration(&self) -> TimeDelta {
        TimeDelta::minutes(i64::from(self.duration_min))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BoostState {
    Idle,
    ScheduledPending {
        at: NaiveDateTime,
    },
    Active {
        since: NaiveDateTime,
        until: NaiveDateTime,
        manual: bool,
    },
}

impl BoostState {
    pub fn name(&self) -> &'static str {
        match self {
            BoostState::Idle => "idle",
            BoostState::ScheduledPending { .. } => "scheduled",
            BoostState::Active { .. } => "active",
        }
    }
}

/// What the controller has to be told after a scheduler step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoostAction {
    Start { ratio: u8 },
    Stop,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BoostSummary {
    pub state: &'static str,
    pub active: bool,
    pub ratio: u8,
    pub duration_min: u32,
    pub trigger: Option<(u8, u8)>,
    pub next_start: Option<NaiveDateTime>,
    pub ends_at: Option<NaiveDateTime>,
    pub activations: u32,
    pub skipped: u32,
}

#[derive(Debug, Clone)]
pub struct BoostScheduler {
    settings: BoostSettings,
    state: BoostState,
    /// Trigger occurrences at or before this instant are not armed again.
    skip_until: Option<NaiveDateTime>,
    activations: u32,
    skipped: u32,
}

impl BoostScheduler {
    pub fn new(settings: BoostSettings) -> Self {
        Self {
            settings,
            state: BoostState::Idle,
            skip_until: None,
            activations: 0,
            skipped: 0,
        }
    }

    pub fn settings(&self) -> BoostSettings {
        self.settings
    }

    pub fn state(&self) -> BoostState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, BoostState::Active { .. })
    }

    /// Replaces the settings. A running boost keeps its end time; a pending
    /// one is re-armed against the new trigger.
    pub fn set_settings(&mut self, settings: BoostSettings, now: NaiveDateTime) {
        self.settings = settings;
        if let BoostState::ScheduledPending { .. } = self.state {
            self.state = BoostState::Idle;
            self.arm(now);
        }
    }

    pub fn tick(&mut self, now: NaiveDateTime) -> Option<BoostAction> {
        match self.state {
            BoostState::Idle => {
                self.arm(now);
                None
            }
            BoostState::ScheduledPending { at } => {
                if now < at {
                    return None;
                }
                let until = at + self.settings.duration();
                if now >= until {
                    // The whole window passed while the loop was not running.
                    warn!(%at, "scheduled boost window missed");
                    self.skipped += 1;
                    self.state = BoostState::Idle;
                    self.arm(now);
                    return None;
                }
                self.start(at, until, false)
            }
            BoostState::Active { until, .. } => {
                if now < until {
                    return None;
                }
                info!("boost finished");
                self.state = BoostState::Idle;
                self.arm(now);
                Some(BoostAction::Stop)
            }
        }
    }

    /// Manual start. Overrides a pending scheduled start for that day.
    pub fn activate(&mut self, now: NaiveDateTime) -> Option<BoostAction> {
        match self.state {
            BoostState::Active { .. } => None,
            BoostState::ScheduledPending { at } => {
                self.skip_until = Some(at);
                self.start(now, now + self.settings.duration(), true)
            }
            BoostState::Idle => self.start(now, now + self.settings.duration(), true),
        }
    }

    /// Manual stop. Cancelling a pending schedule skips that day's start.
    pub fn cancel(&mut self, now: NaiveDateTime) -> Option<BoostAction> {
        match self.state {
            BoostState::Active { .. } => {
                info!("boost cancelled");
                self.state = BoostState::Idle;
                self.arm(now);
                Some(BoostAction::Stop)
            }
            BoostState::ScheduledPending { at } => {
                info!(%at, "scheduled boost skipped");
                self.skip_until = Some(at);
                self.skipped += 1;
                self.state = BoostState::Idle;
                self.arm(now);
                None
            }
            BoostState::Idle => None,
        }
    }

    pub fn summary(&self) -> BoostSummary {
        let (next_start, ends_at) = match self.state {
            BoostState::Idle => (None, None),
            BoostState::ScheduledPending { at } => (Some(at), None),
            BoostState::Active { until, .. } => (None, Some(until)),
        };
        BoostSummary {
            state: self.state.name(),
            active: self.is_active(),
            ratio: self.settings.ratio,
            duration_min: self.settings.duration_min,
            trigger: self.settings.trigger.map(Into::into),
            next_start,
            ends_at,
            activations: self.activations,
            skipped: self.skipped,
        }
    }

    fn start(
        &mut self,
        since: NaiveDateTime,
        until: NaiveDateTime,
        manual: bool,
    ) -> Option<BoostAction> {
        info!(ratio = self.settings.ratio, %until, manual, "boost started");
        self.state = BoostState::Active { since, until, manual };
        self.activations += 1;
        Some(BoostAction::Start {
            ratio: self.settings.ratio,
        })
    }

    fn arm(&mut self, now: NaiveDateTime) {
        let Some(trigger) = self.settings.trigger else {
            return;
        };
        let from = match self.skip_until {
            Some(skip) if skip > now => skip,
            _ => now,
        };
        self.state = BoostState::ScheduledPending {
            at: trigger.next_after(from),
        };
    }
}
