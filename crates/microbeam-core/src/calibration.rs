//! Micrometer to DAC code scale factors.
//!
//! Calibration lives in `cal.json` next to the run directories. A missing
//! file, or zero factors, means the system is uncalibrated: raw LSB and
//! voltage coordinates keep working, micrometer coordinates are refused.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::dac::Axis;
use crate::error::{DomainError, DomainResult};

/// File name of the calibration record inside the run directory.
pub const CALIBRATION_FILE: &str = "cal.json";

/// Scale factors for both deflection axes.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Calibration {
    pub lsb_per_um_x: f64,
    pub lsb_per_um_y: f64,
}

impl Calibration {
    pub fn new(lsb_per_um_x: f64, lsb_per_um_y: f64) -> Self {
        Self {
            lsb_per_um_x,
            lsb_per_um_y,
        }
    }

    /// True when both axes carry a non-zero factor.
    pub fn is_calibrated(&self) -> bool {
        self.lsb_per_um_x != 0.0 && self.lsb_per_um_y != 0.0
    }

    /// Factor for one axis.
    pub fn lsb_per_um(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.lsb_per_um_x,
            Axis::Y => self.lsb_per_um_y,
        }
    }

    /// Loads `cal.json` from `dir`.
    ///
    /// A missing file yields the uncalibrated default. A file that exists but
    /// lacks either factor is an error.
    pub fn load(dir: &Path) -> DomainResult<Self> {
        let path = dir.join(CALIBRATION_FILE);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "System micrometer scale is not calibrated");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(DomainError::InvalidCalibration {
                    reason: format!("{}: {e}", path.display()),
                })
            }
        };

        let calibration = Self::parse(&contents)?;
        info!(
            lsb_per_um_x = calibration.lsb_per_um_x,
            lsb_per_um_y = calibration.lsb_per_um_y,
            "Calibration data loaded"
        );
        Ok(calibration)
    }

    /// Parses the JSON calibration record.
    pub fn parse(contents: &str) -> DomainResult<Self> {
        let value: serde_json::Value =
            serde_json::from_str(contents).map_err(|e| DomainError::InvalidCalibration {
                reason: e.to_string(),
            })?;

        let factor = |key: &str| {
            value
                .get(key)
                .and_then(serde_json::Value::as_f64)
                .ok_or_else(|| DomainError::InvalidCalibration {
                    reason: format!("{key} missing or not a number"),
                })
        };

        Ok(Self {
            lsb_per_um_x: factor("lsb_per_um_x")?,
            lsb_per_um_y: factor("lsb_per_um_y")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_uncalibrated() {
        assert!(!Calibration::default().is_calibrated());
        assert!(!Calibration::new(3.0, 0.0).is_calibrated());
        assert!(!Calibration::new(0.0, 3.0).is_calibrated());
        assert!(Calibration::new(3.0, 4.0).is_calibrated());
    }

    #[test]
    fn test_parse_valid() {
        let cal = Calibration::parse(r#"{"lsb_per_um_x": 12.5, "lsb_per_um_y": 9}"#).unwrap();
        assert_eq!(cal, Calibration::new(12.5, 9.0));
    }

    #[test]
    fn test_parse_missing_key() {
        let err = Calibration::parse(r#"{"lsb_per_um_x": 12.5}"#).unwrap_err();
        assert!(err.to_string().contains("lsb_per_um_y"));
    }

    #[test]
    fn test_load_missing_file_is_uncalibrated() {
        let dir = tempfile::tempdir().unwrap();
        let cal = Calibration::load(dir.path()).unwrap();
        assert!(!cal.is_calibrated());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CALIBRATION_FILE),
            r#"{"lsb_per_um_x": 2.0, "lsb_per_um_y": 3.0}"#,
        )
        .unwrap();
        let cal = Calibration::load(dir.path()).unwrap();
        assert_eq!(cal.lsb_per_um(Axis::X), 2.0);
        assert_eq!(cal.lsb_per_um(Axis::Y), 3.0);
    }
}
