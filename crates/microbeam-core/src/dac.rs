//! DAC coordinates and unit conversion.
//!
//! The beam deflection DAC takes signed 16-bit codes per axis. Every value
//! that reaches the hardware passes through one of the clamping helpers in
//! this module, so out-of-range requests saturate at the device limits
//! instead of wrapping.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::calibration::Calibration;
use crate::error::{DomainError, DomainResult};

/// Lowest DAC code.
pub const DAC_MIN: i16 = i16::MIN;

/// Highest DAC code.
pub const DAC_MAX: i16 = i16::MAX;

/// Output voltage at full scale (bipolar ±10 V).
pub const FULL_SCALE_VOLTS: f64 = 10.0;

/// Codes per full-scale swing on one polarity.
const CODES_PER_FULL_SCALE: f64 = 32768.0;

/// One deflection axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
}

/// A beam position in DAC codes (LSB).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DacPoint {
    pub x: i16,
    pub y: i16,
}

impl DacPoint {
    /// The undeflected beam position.
    pub const ORIGIN: DacPoint = DacPoint { x: 0, y: 0 };

    pub const fn new(x: i16, y: i16) -> Self {
        Self { x, y }
    }

    /// Builds a point from wide integers, saturating each axis to the DAC range.
    pub fn clamped(x: i64, y: i64) -> Self {
        Self {
            x: clamp_lsb(x),
            y: clamp_lsb(y),
        }
    }
}

impl fmt::Display for DacPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}|{})", self.x, self.y)
    }
}

/// Saturates an integer to the DAC range.
pub fn clamp_lsb(value: i64) -> i16 {
    value.clamp(i64::from(DAC_MIN), i64::from(DAC_MAX)) as i16
}

/// Rounds to the nearest code and saturates. NaN maps to 0.
pub fn round_to_lsb(value: f64) -> i16 {
    if value.is_nan() {
        return 0;
    }
    // `as` saturates for out-of-range floats
    clamp_lsb(value.round() as i64)
}

/// Truncates toward zero and saturates. Used for values already given in LSB.
pub fn truncate_to_lsb(value: f64) -> i16 {
    if value.is_nan() {
        return 0;
    }
    clamp_lsb(value.trunc() as i64)
}

/// Converts an output voltage to a DAC code.
///
/// `+10 V` saturates at 32767, `-10 V` maps to -32768.
pub fn voltage_to_lsb(volts: f64) -> i16 {
    round_to_lsb(volts / FULL_SCALE_VOLTS * CODES_PER_FULL_SCALE)
}

/// Converts a DAC code back to its nominal output voltage.
pub fn lsb_to_voltage(lsb: i16) -> f64 {
    f64::from(lsb) / CODES_PER_FULL_SCALE * FULL_SCALE_VOLTS
}

// ============================================================================
// Coordinate Units
// ============================================================================

/// Unit in which scan and positioning coordinates are given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanUnit {
    /// Raw DAC codes
    #[serde(rename = "lsb")]
    Lsb,
    /// Micrometers on target, requires calibration
    #[serde(rename = "um")]
    Micrometer,
    /// DAC output voltage
    #[serde(rename = "volt")]
    Volt,
}

impl ScanUnit {
    /// Wire name of the unit.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lsb => "lsb",
            Self::Micrometer => "um",
            Self::Volt => "volt",
        }
    }

    /// Converts a coordinate on `axis` to a DAC code.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Uncalibrated` for micrometer values when the
    /// calibration is the zero sentinel.
    pub fn to_lsb(&self, value: f64, axis: Axis, calibration: &Calibration) -> DomainResult<i16> {
        match self {
            Self::Lsb => Ok(truncate_to_lsb(value)),
            Self::Volt => Ok(voltage_to_lsb(value)),
            Self::Micrometer => {
                if !calibration.is_calibrated() {
                    return Err(DomainError::Uncalibrated);
                }
                Ok(round_to_lsb(value * calibration.lsb_per_um(axis)))
            }
        }
    }

    /// Converts an (x, y) pair to a DAC point.
    pub fn point_to_lsb(&self, x: f64, y: f64, calibration: &Calibration) -> DomainResult<DacPoint> {
        Ok(DacPoint {
            x: self.to_lsb(x, Axis::X, calibration)?,
            y: self.to_lsb(y, Axis::Y, calibration)?,
        })
    }
}

impl fmt::Display for ScanUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanUnit {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "lsb" => Ok(Self::Lsb),
            "um" => Ok(Self::Micrometer),
            "volt" => Ok(Self::Volt),
            other => Err(DomainError::InvalidUnit(other.to_string())),
        }
    }
}
