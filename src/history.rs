//! Bounded log of the cumulative energy indices.
//!
//! Storage is a fixed `heapless::HistoryBuffer`, so a full log silently drops
//! its oldest point on every new sample and never reallocates.

use crate::stats::EnergyIndices;
use chrono::{NaiveDateTime, TimeDelta};
use heapless::HistoryBuffer;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

pub const HISTORY_CAPACITY: usize = 193;

pub const ALLOWED_INTERVALS_MIN: [u16; 16] =
    [1, 2, 3, 4, 5, 6, 10, 12, 15, 20, 30, 60, 120, 180, 240, 480];

pub const CSV_HEADER: &str = "time,routed,import,export,impulsion,relay";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct HistoryInterval(u16);

impl HistoryInterval {
    pub const DEFAULT: HistoryInterval = HistoryInterval(30);

    pub fn from_minutes(minutes: u16) -> Option<Self> {
        ALLOWED_INTERVALS_MIN
            .contains(&minutes)
            .then_some(HistoryInterval(minutes))
    }

    pub fn minutes(self) -> u16 {
        self.0
    }

    pub fn as_delta(self) -> TimeDelta {
        TimeDelta::minutes(i64::from(self.0))
    }
}

impl Default for HistoryInterval {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u16> for HistoryInterval {
    type Error = String;

    fn try_from(minutes: u16) -> Result<Self, Self::Error> {
        Self::from_minutes(minutes).ok_or_else(|| {
            format!("history interval {minutes} min is not one of {ALLOWED_INTERVALS_MIN:?}")
        })
    }
}

impl From<HistoryInterval> for u16 {
    fn from(interval: HistoryInterval) -> Self {
        interval.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub time: NaiveDateTime,
    pub indices: EnergyIndices,
}

pub struct HistoryRingBuffer {
    points: HistoryBuffer<HistoryPoint, HISTORY_CAPACITY>,
    interval: HistoryInterval,
}

impl HistoryRingBuffer {
    pub fn new(interval: HistoryInterval) -> Self {
        Self {
            points: HistoryBuffer::new(),
            interval,
        }
    }

    pub fn interval(&self) -> HistoryInterval {
        self.interval
    }

    /// Takes effect from the next sample; existing points are kept.
    pub fn set_interval(&mut self, interval: HistoryInterval) {
        self.interval = interval;
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.len() == 0
    }

    pub fn capacity(&self) -> usize {
        HISTORY_CAPACITY
    }

    pub fn latest(&self) -> Option<&HistoryPoint> {
        self.points.recent()
    }

    /// Records `indices` if at least one interval has passed since the last
    /// point. Returns whether a point was written.
    pub fn sample(&mut self, now: NaiveDateTime, indices: EnergyIndices) -> bool {
        if let Some(last) = self.points.recent() {
            if now < last.time + self.interval.as_delta() {
                return false;
            }
        }
        self.points.write(HistoryPoint { time: now, indices });
        true
    }

    /// Oldest-first view of the log. Each call starts a fresh pass.
    pub fn export(&self) -> HistoryExport<'_> {
        HistoryExport {
            points: &self.points,
        }
    }

    pub fn clear(&mut self) {
        self.points = HistoryBuffer::new();
    }

    pub fn to_csv(&self) -> String {
        points_to_csv(self.export())
    }
}

/// Renders points as CSV with a [`CSV_HEADER`] line, in the given order.
pub fn points_to_csv<I>(points: I) -> String
where
    I: IntoIterator<Item = HistoryPoint>,
{
    let points = points.into_iter();
    let mut out = String::with_capacity(64 * (points.size_hint().0 + 1));
    out.push_str(CSV_HEADER);
    out.push('\n');
    for point in points {
        let i = &point.indices;
        // Writing to a String cannot fail.
        let _ = writeln!(
            out,
            "{},{},{},{},{},{}",
            point.time.format("%Y-%m-%d %H:%M:%S"),
            i.routed,
            i.import,
            i.export,
            i.impulsion,
            i.relay
        );
    }
    out
}

impl Default for HistoryRingBuffer {
    fn default() -> Self {
        Self::new(HistoryInterval::DEFAULT)
    }
}

impl core::fmt::Debug for HistoryRingBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HistoryRingBuffer")
            .field("len", &self.len())
            .field("interval_min", &self.interval.minutes())
            .finish()
    }
}

/// Borrowed, read-only pass over the history in chronological order.
#[derive(Clone, Copy)]
pub struct HistoryExport<'a> {
    points: &'a HistoryBuffer<HistoryPoint, HISTORY_CAPACITY>,
}

impl<'a> HistoryExport<'a> {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = HistoryPoint> + 'a {
        self.points.oldest_ordered().copied()
    }
}

impl<'a> IntoIterator for HistoryExport<'a> {
    type Item = HistoryPoint;
    type IntoIter = core::iter::Copied<heapless::OldestOrdered<'a, HistoryPoint, HISTORY_CAPACITY>>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.oldest_ordered().copied()
    }
}
