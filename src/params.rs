//! The routing controller's configuration record.
//!
//! The controller owns the authoritative copy; the gateway only caches what
//! the last `PARAM` exchange returned. Slot 0 always holds the controller's
//! firmware version.

use serde::ser::{Serialize, SerializeMap, Serializer};
use static_assertions::const_assert_eq;

pub const PARAM_COUNT: usize = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum ParamField {
    Version = 0,
    VCalib,
    PCalib,
    PhaseCalib,
    POffset,
    PResistance,
    PMargin,
    GainP,
    GainI,
    EReserve,
    PDiv2Active,
    PDiv2Idle,
    TDiv2On,
    TDiv2Off,
    TDiv2Tc,
    CntCalib,
    PInstallPv,
}

impl ParamField {
    pub const ALL: [ParamField; PARAM_COUNT] = [
        ParamField::Version,
        ParamField::VCalib,
        ParamField::PCalib,
        ParamField::PhaseCalib,
        ParamField::POffset,
        ParamField::PResistance,
        ParamField::PMargin,
        ParamField::GainP,
        ParamField::GainI,
        ParamField::EReserve,
        ParamField::PDiv2Active,
        ParamField::PDiv2Idle,
        ParamField::TDiv2On,
        ParamField::TDiv2Off,
        ParamField::TDiv2Tc,
        ParamField::CntCalib,
        ParamField::PInstallPv,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub const fn name(self) -> &'static str {
        match self {
            ParamField::Version => "VERSION",
            ParamField::VCalib => "V_CALIB",
            ParamField::PCalib => "P_CALIB",
            ParamField::PhaseCalib => "PHASE_CALIB",
            ParamField::POffset => "P_OFFSET",
            ParamField::PResistance => "P_RESISTANCE",
            ParamField::PMargin => "P_MARGIN",
            ParamField::GainP => "GAIN_P",
            ParamField::GainI => "GAIN_I",
            ParamField::EReserve => "E_RESERVE",
            ParamField::PDiv2Active => "P_DIV2_ACTIVE",
            ParamField::PDiv2Idle => "P_DIV2_IDLE",
            ParamField::TDiv2On => "T_DIV2_ON",
            ParamField::TDiv2Off => "T_DIV2_OFF",
            ParamField::TDiv2Tc => "T_DIV2_TC",
            ParamField::CntCalib => "CNT_CALIB",
            ParamField::PInstallPv => "P_INSTALLPV",
        }
    }

    /// Accepts the field name in any case, or its numeric index.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Ok(index) = s.parse::<usize>() {
            return Self::from_index(index);
        }
        Self::ALL
            .iter()
            .copied()
            .find(|field| field.name().eq_ignore_ascii_case(s))
    }

    /// The version slot is reported by the controller and cannot be written.
    pub fn is_writable(self) -> bool {
        self != ParamField::Version
    }
}

const_assert_eq!(ParamField::ALL.len(), PARAM_COUNT);
const_assert_eq!(ParamField::PInstallPv as usize, PARAM_COUNT - 1);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterVector {
    values: [f64; PARAM_COUNT],
}

impl ParameterVector {
    pub fn from_values(values: [f64; PARAM_COUNT]) -> Self {
        Self { values }
    }

    pub fn get(&self, field: ParamField) -> f64 {
        self.values[field.index()]
    }

    pub fn set(&mut self, field: ParamField, value: f64) {
        self.values[field.index()] = value;
    }

    pub fn version(&self) -> f64 {
        self.get(ParamField::Version)
    }

    pub fn values(&self) -> &[f64; PARAM_COUNT] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamField, f64)> + '_ {
        ParamField::ALL.iter().map(move |&field| (field, self.get(field)))
    }
}

/// Serialized as a `NAME -> value` map for API consumers.
impl Serialize for ParameterVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(PARAM_COUNT))?;
        for (field, value) in self.iter() {
            map.serialize_entry(field.name(), &value)?;
        }
        map.end()
    }
}
