//! Live statistics reported by the routing controller on every poll.
//!
//! The wire record carries 24 values (slot 0 = version). The gateway appends
//! five start-of-day copies of the cumulative energy indices so that consumers
//! can compute daily figures from a single snapshot.

use chrono::NaiveDate;
use serde::ser::{Serialize, SerializeMap, Serializer};
use static_assertions::const_assert_eq;

pub const STATS_WIRE_COUNT: usize = 24;
pub const STATS_DAY_COUNT: usize = 5;
pub const STATS_COUNT: usize = STATS_WIRE_COUNT + STATS_DAY_COUNT;

/// STATUS_BYTE bit set by the controller while its relay output is energised.
pub const STATUS_RELAY_ON: u8 = 0b0000_0010;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatField {
    Version = 0,
    VRms,
    IRms,
    PAct,
    PApp,
    PRouted,
    PImp,
    PExp,
    CosPhi,
    IndexRouted,
    IndexImport,
    IndexExport,
    IndexImpulsion,
    PImpulsion,
    TriacMode,
    RelayMode,
    DelayMin,
    DelayAvg,
    DelayMax,
    BiasOffset,
    StatusByte,
    OnTime,
    Samples,
    IndexRelay,
    // Appended by the gateway, never sent by the controller.
    IndexRoutedDay,
    IndexImportDay,
    IndexExportDay,
    IndexImpulsionDay,
    IndexRelayDay,
}

impl StatField {
    pub const ALL: [StatField; STATS_COUNT] = [
        StatField::Version,
        StatField::VRms,
        StatField::IRms,
        StatField::PAct,
        StatField::PApp,
        StatField::PRouted,
        StatField::PImp,
        StatField::PExp,
        StatField::CosPhi,
        StatField::IndexRouted,
        StatField::IndexImport,
        StatField::IndexExport,
        StatField::IndexImpulsion,
        StatField::PImpulsion,
        StatField::TriacMode,
        StatField::RelayMode,
        StatField::DelayMin,
        StatField::DelayAvg,
        StatField::DelayMax,
        StatField::BiasOffset,
        StatField::StatusByte,
        StatField::OnTime,
        StatField::Samples,
        StatField::IndexRelay,
        StatField::IndexRoutedDay,
        StatField::IndexImportDay,
        StatField::IndexExportDay,
        StatField::IndexImpulsionDay,
        StatField::IndexRelayDay,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            StatField::Version => "VERSION",
            StatField::VRms => "V_RMS",
            StatField::IRms => "I_RMS",
            StatField::PAct => "P_ACT",
            StatField::PApp => "P_APP",
            StatField::PRouted => "P_ROUTED",
            StatField::PImp => "P_IMP",
            StatField::PExp => "P_EXP",
            StatField::CosPhi => "COS_PHI",
            StatField::IndexRouted => "INDEX_ROUTED",
            StatField::IndexImport => "INDEX_IMPORT",
            StatField::IndexExport => "INDEX_EXPORT",
            StatField::IndexImpulsion => "INDEX_IMPULSION",
            StatField::PImpulsion => "P_IMPULSION",
            StatField::TriacMode => "TRIAC_MODE",
            StatField::RelayMode => "RELAY_MODE",
            StatField::DelayMin => "DELAY_MIN",
            StatField::DelayAvg => "DELAY_AVG",
            StatField::DelayMax => "DELAY_MAX",
            StatField::BiasOffset => "BIAS_OFFSET",
            StatField::StatusByte => "STATUS_BYTE",
            StatField::OnTime => "ONTIME",
            StatField::Samples => "SAMPLES",
            StatField::IndexRelay => "INDEX_RELAY",
            StatField::IndexRoutedDay => "INDEX_ROUTED_J",
            StatField::IndexImportDay => "INDEX_IMPORT_J",
            StatField::IndexExportDay => "INDEX_EXPORT_J",
            StatField::IndexImpulsionDay => "INDEX_IMPULSION_J",
            StatField::IndexRelayDay => "INDEX_RELAY_J",
        }
    }
}

const_assert_eq!(StatField::ALL.len(), STATS_COUNT);
const_assert_eq!(StatField::IndexRelay as usize, STATS_WIRE_COUNT - 1);
const_assert_eq!(StatField::IndexRelayDay as usize, STATS_COUNT - 1);

/// Triac and relay operating modes, as encoded on the serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RoutingMode {
    Stop,
    Forced,
    Auto,
}

impl RoutingMode {
    pub const fn code(self) -> u8 {
        match self {
            RoutingMode::Stop => 0,
            RoutingMode::Forced => 1,
            RoutingMode::Auto => 9,
        }
    }

    pub fn from_code(value: f64) -> Option<Self> {
        match value.round() as i64 {
            0 => Some(RoutingMode::Stop),
            1 => Some(RoutingMode::Forced),
            9 => Some(RoutingMode::Auto),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            RoutingMode::Stop => "STOP",
            RoutingMode::Forced => "FORCE",
            RoutingMode::Auto => "AUTO",
        }
    }

    /// Accepts `stop`/`force`/`forced`/`on`/`auto` in any case, or the wire code.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "stop" | "off" => Some(RoutingMode::Stop),
            "force" | "forced" | "on" => Some(RoutingMode::Forced),
            "auto" => Some(RoutingMode::Auto),
            other => other.parse::<f64>().ok().and_then(Self::from_code),
        }
    }
}

/// One of the cumulative energy counters kept by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnergyIndex {
    Routed,
    Import,
    Export,
    Impulsion,
    Relay,
}

impl EnergyIndex {
    pub const ALL: [EnergyIndex; STATS_DAY_COUNT] = [
        EnergyIndex::Routed,
        EnergyIndex::Import,
        EnergyIndex::Export,
        EnergyIndex::Impulsion,
        EnergyIndex::Relay,
    ];

    pub const fn field(self) -> StatField {
        match self {
            EnergyIndex::Routed => StatField::IndexRouted,
            EnergyIndex::Import => StatField::IndexImport,
            EnergyIndex::Export => StatField::IndexExport,
            EnergyIndex::Impulsion => StatField::IndexImpulsion,
            EnergyIndex::Relay => StatField::IndexRelay,
        }
    }

    pub const fn day_field(self) -> StatField {
        match self {
            EnergyIndex::Routed => StatField::IndexRoutedDay,
            EnergyIndex::Import => StatField::IndexImportDay,
            EnergyIndex::Export => StatField::IndexExportDay,
            EnergyIndex::Impulsion => StatField::IndexImpulsionDay,
            EnergyIndex::Relay => StatField::IndexRelayDay,
        }
    }
}

/// The five cumulative counters at one instant, in Wh.
#[derive(Debug, Clone, Copy, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct EnergyIndices {
    pub routed: f64,
    pub import: f64,
    pub export: f64,
    pub impulsion: f64,
    pub relay: f64,
}

impl EnergyIndices {
    pub fn get(&self, index: EnergyIndex) -> f64 {
        match index {
            EnergyIndex::Routed => self.routed,
            EnergyIndex::Import => self.import,
            EnergyIndex::Export => self.export,
            EnergyIndex::Impulsion => self.impulsion,
            EnergyIndex::Relay => self.relay,
        }
    }

    pub fn delta_since(&self, start: &EnergyIndices) -> EnergyIndices {
        EnergyIndices {
            routed: self.routed - start.routed,
            import: self.import - start.import,
            export: self.export - start.export,
            impulsion: self.impulsion - start.impulsion,
            relay: self.relay - start.relay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatisticsVector {
    values: [f64; STATS_COUNT],
}

impl StatisticsVector {
    /// Builds a vector from a wire record; start-of-day slots are zero until
    /// a [`DailyIndexTracker`] fills them.
    pub fn from_wire(wire: [f64; STATS_WIRE_COUNT]) -> Self {
        let mut values = [0.0; STATS_COUNT];
        values[..STATS_WIRE_COUNT].copy_from_slice(&wire);
        Self { values }
    }

    pub fn get(&self, field: StatField) -> f64 {
        self.values[field.index()]
    }

    pub fn version(&self) -> f64 {
        self.get(StatField::Version)
    }

    pub fn v_rms(&self) -> f64 {
        self.get(StatField::VRms)
    }

    pub fn i_rms(&self) -> f64 {
        self.get(StatField::IRms)
    }

    pub fn p_act(&self) -> f64 {
        self.get(StatField::PAct)
    }

    pub fn p_app(&self) -> f64 {
        self.get(StatField::PApp)
    }

    pub fn p_routed(&self) -> f64 {
        self.get(StatField::PRouted)
    }

    pub fn p_impulsion(&self) -> f64 {
        self.get(StatField::PImpulsion)
    }

    pub fn cos_phi(&self) -> f64 {
        self.get(StatField::CosPhi)
    }

    pub fn triac_mode(&self) -> Option<RoutingMode> {
        RoutingMode::from_code(self.get(StatField::TriacMode))
    }

    pub fn relay_mode(&self) -> Option<RoutingMode> {
        RoutingMode::from_code(self.get(StatField::RelayMode))
    }

    pub fn status_byte(&self) -> u8 {
        self.get(StatField::StatusByte).clamp(0.0, 255.0) as u8
    }

    /// Relay is on when forced, or in auto with the controller reporting it
    /// energised.
    pub fn relay_on(&self) -> bool {
        match self.relay_mode() {
            Some(RoutingMode::Forced) => true,
            Some(RoutingMode::Auto) => self.status_byte() & STATUS_RELAY_ON != 0,
            _ => false,
        }
    }

    pub fn indices(&self) -> EnergyIndices {
        EnergyIndices {
            routed: self.get(StatField::IndexRouted),
            import: self.get(StatField::IndexImport),
            export: self.get(StatField::IndexExport),
            impulsion: self.get(StatField::IndexImpulsion),
            relay: self.get(StatField::IndexRelay),
        }
    }

    pub fn day_start(&self) -> EnergyIndices {
        EnergyIndices {
            routed: self.get(StatField::IndexRoutedDay),
            import: self.get(StatField::IndexImportDay),
            export: self.get(StatField::IndexExportDay),
            impulsion: self.get(StatField::IndexImpulsionDay),
            relay: self.get(StatField::IndexRelayDay),
        }
    }

    pub fn set_day_start(&mut self, start: &EnergyIndices) {
        for index in EnergyIndex::ALL {
            self.values[index.day_field().index()] = start.get(index);
        }
    }

    /// Energy counted by `index` since the last local midnight.
    pub fn daily_delta(&self, index: EnergyIndex) -> f64 {
        self.get(index.field()) - self.get(index.day_field())
    }

    pub fn daily_deltas(&self) -> EnergyIndices {
        self.indices().delta_since(&self.day_start())
    }
}

impl Serialize for StatisticsVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(STATS_COUNT))?;
        for field in StatField::ALL {
            map.serialize_entry(field.name(), &self.get(field))?;
        }
        map.end()
    }
}

/// Captures the start-of-day snapshot once per local calendar day.
#[derive(Debug, Clone, Default)]
pub struct DailyIndexTracker {
    day: Option<NaiveDate>,
    start: EnergyIndices,
    rollovers: u32,
}

impl DailyIndexTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamps `stats` with the current start-of-day indices. Returns `true`
    /// when `date` is a new day and a fresh snapshot was taken. A date older
    /// than the tracked day (wall clock stepped back) is ignored.
    pub fn observe(&mut self, date: NaiveDate, stats: &mut StatisticsVector) -> bool {
        let rolled = match self.day {
            None => {
                self.start = stats.indices();
                self.day = Some(date);
                false
            }
            Some(day) if date > day => {
                self.start = stats.indices();
                self.day = Some(date);
                self.rollovers += 1;
                true
            }
            Some(_) => false,
        };
        stats.set_day_start(&self.start);
        rolled
    }

    /// Forgets the snapshot; the next observation re-captures it without
    /// counting a rollover. Used after the controller's indices are reset.
    pub fn reset(&mut self) {
        self.day = None;
    }

    pub fn rollovers(&self) -> u32 {
        self.rollovers
    }

    pub fn start(&self) -> Option<EnergyIndices> {
        self.day.map(|_| self.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_with(routed: f64, relay_mode: f64, status: f64) -> [f64; STATS_WIRE_COUNT] {
        let mut wire = [0.0; STATS_WIRE_COUNT];
        wire[StatField::IndexRouted.index()] = routed;
        wire[StatField::RelayMode.index()] = relay_mode;
        wire[StatField::StatusByte.index()] = status;
        wire
    }

    #[test]
    fn test_relay_on_detection() {
        assert!(StatisticsVector::from_wire(wire_with(0.0, 1.0, 0.0)).relay_on());
        assert!(!StatisticsVector::from_wire(wire_with(0.0, 0.0, 2.0)).relay_on());
        assert!(StatisticsVector::from_wire(wire_with(0.0, 9.0, 2.0)).relay_on());
        assert!(!StatisticsVector::from_wire(wire_with(0.0, 9.0, 1.0)).relay_on());
    }

    #[test]
    fn test_routing_mode_parse() {
        assert_eq!(RoutingMode::parse("AUTO"), Some(RoutingMode::Auto));
        assert_eq!(RoutingMode::parse("force"), Some(RoutingMode::Forced));
        assert_eq!(RoutingMode::parse("0"), Some(RoutingMode::Stop));
        assert_eq!(RoutingMode::parse("9"), Some(RoutingMode::Auto));
        assert_eq!(RoutingMode::parse("5"), None);
    }

    #[test]
    fn test_daily_delta_after_rollover() {
        let day1 = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let day2 = day1.succ_opt().unwrap();
        let mut tracker = DailyIndexTracker::new();

        let mut stats = StatisticsVector::from_wire(wire_with(1000.0, 9.0, 0.0));
        assert!(!tracker.observe(day1, &mut stats));
        assert_eq!(stats.daily_delta(EnergyIndex::Routed), 0.0);

        let mut stats = StatisticsVector::from_wire(wire_with(1250.0, 9.0, 0.0));
        assert!(!tracker.observe(day1, &mut stats));
        assert_eq!(stats.daily_delta(EnergyIndex::Routed), 250.0);

        let mut stats = StatisticsVector::from_wire(wire_with(1300.0, 9.0, 0.0));
        assert!(tracker.observe(day2, &mut stats));
        assert_eq!(stats.daily_delta(EnergyIndex::Routed), 0.0);
        assert_eq!(stats.get(StatField::IndexRoutedDay), 1300.0);
        assert_eq!(tracker.rollovers(), 1);
    }

    #[test]
    fn test_clock_step_back_does_not_resnapshot() {
        let day1 = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let day2 = day1.succ_opt().unwrap();
        let mut tracker = DailyIndexTracker::new();
        let mut stats = StatisticsVector::from_wire(wire_with(10.0, 9.0, 0.0));
        tracker.observe(day2, &mut stats);
        let mut stats = StatisticsVector::from_wire(wire_with(20.0, 9.0, 0.0));
        assert!(!tracker.observe(day1, &mut stats));
        let mut stats = StatisticsVector::from_wire(wire_with(30.0, 9.0, 0.0));
        assert!(!tracker.observe(day2, &mut stats));
        assert_eq!(stats.daily_delta(EnergyIndex::Routed), 20.0);
        assert_eq!(tracker.rollovers(), 0);
    }
}
