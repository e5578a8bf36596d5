//! Time sources shared by every step of the control loop.
//!
//! The loop needs two views of time: a monotonic millisecond counter for
//! cadences and serial timeouts, and a local wall clock for day rollovers and
//! the daily boost / RelayPlus windows. Both come from one [`Clock`] so tests
//! can drive the whole gateway with a [`ManualClock`].

use chrono::{Days, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary origin. Never goes backwards.
    fn monotonic_ms(&self) -> u64;

    /// Local wall-clock time.
    fn local_now(&self) -> NaiveDateTime;
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall time is UTC shifted by a fixed offset, like the controller board's
/// NTP setup (offset 0 = solar time).
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
    utc_offset: TimeDelta,
}

impl SystemClock {
    pub fn new(utc_offset_minutes: i32) -> Self {
        Self {
            origin: Instant::now(),
            utc_offset: TimeDelta::minutes(i64::from(utc_offset_minutes)),
        }
    }
}

impl Clock for SystemClock {
    fn monotonic_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn local_now(&self) -> NaiveDateTime {
        Utc::now().naive_utc() + self.utc_offset
    }
}

#[derive(Debug)]
struct ManualTime {
    monotonic_ms: u64,
    wall: NaiveDateTime,
}

/// Test clock. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualTime>>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualTime {
                monotonic_ms: 0,
                wall: start,
            })),
        }
    }

    pub fn at(date: NaiveDate, hour: u32, minute: u32, second: u32) -> Self {
        let time = NaiveTime::from_hms_opt(hour, minute, second).unwrap_or_default();
        Self::new(date.and_time(time))
    }

    /// Advances both the monotonic counter and the wall clock.
    pub fn advance(&self, by: Duration) {
        let mut time = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        time.monotonic_ms += by.as_millis() as u64;
        time.wall += TimeDelta::from_std(by).unwrap_or(TimeDelta::zero());
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }

    /// Moves only the wall clock, as an NTP correction would.
    pub fn set_local(&self, wall: NaiveDateTime) {
        let mut time = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        time.wall = wall;
    }

    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Clock for ManualClock {
    fn monotonic_ms(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).monotonic_ms
    }

    fn local_now(&self) -> NaiveDateTime {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).wall
    }
}

/// A validated hour:minute of the day, used by both timed-mode schedulers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "(u8, u8)", into = "(u8, u8)")]
pub struct DailyTime {
    hour: u8,
    minute: u8,
}

impl DailyTime {
    pub const MIDNIGHT: DailyTime = DailyTime { hour: 0, minute: 0 };

    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    pub fn hour(self) -> u8 {
        self.hour
    }

    pub fn minute(self) -> u8 {
        self.minute
    }

    fn time(self) -> NaiveTime {
        NaiveTime::from_hms_opt(u32::from(self.hour), u32::from(self.minute), 0)
            .unwrap_or_default()
    }

    pub fn on(self, date: NaiveDate) -> NaiveDateTime {
        date.and_time(self.time())
    }

    /// Most recent occurrence at or before `now`.
    pub fn last_at_or_before(self, now: NaiveDateTime) -> NaiveDateTime {
        let today = self.on(now.date());
        if today <= now {
            today
        } else {
            today - Days::new(1)
        }
    }

    /// First occurrence strictly after `now`.
    pub fn next_after(self, now: NaiveDateTime) -> NaiveDateTime {
        let today = self.on(now.date());
        if today > now {
            today
        } else {
            today + Days::new(1)
        }
    }
}

impl TryFrom<(u8, u8)> for DailyTime {
    type Error = String;

    fn try_from((hour, minute): (u8, u8)) -> Result<Self, Self::Error> {
        Self::new(hour, minute).ok_or_else(|| format!("invalid time of day {hour:02}:{minute:02}"))
    }
}

impl From<DailyTime> for (u8, u8) {
    fn from(t: DailyTime) -> Self {
        (t.hour, t.minute)
    }
}

impl core::fmt::Display for DailyTime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Per-step elapsed-time check. The first call is always due.
#[derive(Debug, Clone)]
pub struct Cadence {
    period_ms: u64,
    last_ms: Option<u64>,
}

impl Cadence {
    pub fn new(period: Duration) -> Self {
        Self {
            period_ms: period.as_millis() as u64,
            last_ms: None,
        }
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn due(&mut self, now_ms: u64) -> bool {
        let due = match self.last_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.period_ms,
        };
        if due {
            self.last_ms = Some(now_ms);
        }
        due
    }

    /// Makes the next `due` call fire regardless of elapsed time.
    pub fn expedite(&mut self) {
        self.last_ms = None;
    }
}
