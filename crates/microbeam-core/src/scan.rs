//! Scan parameters and the grid traversal they describe.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::calibration::Calibration;
use crate::dac::{Axis, DacPoint, ScanUnit};
use crate::error::{DomainError, DomainResult};

// ============================================================================
// Parameters
// ============================================================================

/// Parameters of one raster scan, as submitted by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanParameters {
    pub start_x: f64,
    pub start_y: f64,
    pub stop_x: f64,
    pub stop_y: f64,
    pub points_x: u32,
    pub points_y: u32,
    pub hits_per_step: u32,
    /// Seconds to wait for `hits_per_step` at one point; 0 waits forever.
    #[serde(default)]
    pub step_timeout: f64,
    pub repeat_count: u32,
    #[serde(rename = "scan_units")]
    pub unit: ScanUnit,
}

impl ScanParameters {
    /// Checks counts and numeric ranges. Does not look at calibration.
    pub fn validate(&self) -> DomainResult<()> {
        for (field, value) in [
            ("start_x", self.start_x),
            ("start_y", self.start_y),
            ("stop_x", self.stop_x),
            ("stop_y", self.stop_y),
        ] {
            if !value.is_finite() {
                return Err(DomainError::invalid(field, value, "a finite number"));
            }
        }
        for (field, value) in [
            ("points_x", self.points_x),
            ("points_y", self.points_y),
            ("hits_per_step", self.hits_per_step),
            ("repeat_count", self.repeat_count),
        ] {
            if value == 0 {
                return Err(DomainError::invalid(field, value, ">= 1"));
            }
        }
        if !self.step_timeout.is_finite() || self.step_timeout < 0.0 {
            return Err(DomainError::invalid(
                "step_timeout",
                self.step_timeout,
                "seconds >= 0",
            ));
        }
        Ok(())
    }

    /// Validates and converts the grid to DAC codes.
    pub fn plan(&self, calibration: &Calibration) -> DomainResult<ScanPlan> {
        self.validate()?;

        let axis_values = |start: f64, stop: f64, points: u32, axis: Axis| {
            linspace(start, stop, points)
                .into_iter()
                .map(|v| self.unit.to_lsb(v, axis, calibration))
                .collect::<DomainResult<Vec<i16>>>()
        };

        Ok(ScanPlan {
            x_values: axis_values(self.start_x, self.stop_x, self.points_x, Axis::X)?,
            y_values: axis_values(self.start_y, self.stop_y, self.points_y, Axis::Y)?,
            hits_per_step: self.hits_per_step,
            step_timeout: Duration::from_secs_f64(self.step_timeout),
            repeat_count: self.repeat_count,
        })
    }
}

/// `n` evenly spaced values from `start` to `stop`, both ends included.
///
/// `n == 1` yields `[start]`, `n == 0` yields nothing.
pub fn linspace(start: f64, stop: f64, n: u32) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let last = n - 1;
            let step = (stop - start) / f64::from(last);
            (0..n)
                .map(|i| {
                    if i == last {
                        stop
                    } else {
                        start + step * f64::from(i)
                    }
                })
                .collect()
        }
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Loop nesting of one repetition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    /// y outer, x inner (row by row)
    RowMajor,
    /// x outer, y inner (column by column)
    ColumnMajor,
}

impl ScanOrder {
    /// Order for a repetition. With swapping enabled every odd repetition is
    /// column-major.
    pub fn for_repetition(repetition: u32, swap_every_second: bool) -> Self {
        if swap_every_second && repetition % 2 == 1 {
            Self::ColumnMajor
        } else {
            Self::RowMajor
        }
    }
}

/// A validated scan in DAC codes.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPlan {
    pub x_values: Vec<i16>,
    pub y_values: Vec<i16>,
    pub hits_per_step: u32,
    pub step_timeout: Duration,
    pub repeat_count: u32,
}

impl ScanPlan {
    /// Number of points over all repetitions.
    pub fn total_points(&self) -> u64 {
        self.x_values.len() as u64 * self.y_values.len() as u64 * u64::from(self.repeat_count)
    }

    /// Points of one repetition in visiting order.
    pub fn points(&self, order: ScanOrder) -> Vec<DacPoint> {
        let mut points = Vec::with_capacity(self.x_values.len() * self.y_values.len());
        match order {
            ScanOrder::RowMajor => {
                for &y in &self.y_values {
                    points.extend(self.x_values.iter().map(|&x| DacPoint::new(x, y)));
                }
            }
            ScanOrder::ColumnMajor => {
                for &x in &self.x_values {
                    points.extend(self.y_values.iter().map(|&y| DacPoint::new(x, y)));
                }
            }
        }
        points
    }

    /// Poll ticks allowed per step at the given cadence.
    ///
    /// A zero timeout is unbounded.
    pub fn step_tick_budget(&self, tick: Duration) -> u64 {
        if self.step_timeout.is_zero() {
            return u64::MAX;
        }
        if tick.is_zero() {
            return u64::MAX;
        }
        let ticks = self.step_timeout.as_nanos() / tick.as_nanos();
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(unit: ScanUnit) -> ScanParameters {
        ScanParameters {
            start_x: -100.0,
            start_y: 0.0,
            stop_x: 100.0,
            stop_y: 0.0,
            points_x: 5,
            points_y: 1,
            hits_per_step: 1,
            step_timeout: 0.0,
            repeat_count: 1,
            unit,
        }
    }

    #[test]
    fn test_linspace_inclusive() {
        assert_eq!(linspace(-100.0, 100.0, 5), vec![-100.0, -50.0, 0.0, 50.0, 100.0]);
        assert_eq!(linspace(3.0, 9.0, 1), vec![3.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
        assert_eq!(linspace(5.0, -5.0, 3), vec![5.0, 0.0, -5.0]);
    }

    #[test]
    fn test_five_point_lsb_scan_ascends() {
        let plan = params(ScanUnit::Lsb).plan(&Calibration::default()).unwrap();
        assert_eq!(plan.total_points(), 5);
        let xs: Vec<i16> = plan
            .points(ScanOrder::RowMajor)
            .iter()
            .map(|p| p.x)
            .collect();
        assert_eq!(xs, vec![-100, -50, 0, 50, 100]);
    }

    #[test]
    fn test_lsb_values_truncate() {
        let mut p = params(ScanUnit::Lsb);
        p.start_x = 0.0;
        p.stop_x = 10.0;
        p.points_x = 4;
        let plan = p.plan(&Calibration::default()).unwrap();
        // 0, 3.33, 6.67, 10
        assert_eq!(plan.x_values, vec![0, 3, 6, 10]);
    }

    #[test]
    fn test_volt_values_clip() {
        let mut p = params(ScanUnit::Volt);
        p.start_x = -20.0;
        p.stop_x = 20.0;
        p.points_x = 3;
        let plan = p.plan(&Calibration::default()).unwrap();
        assert_eq!(plan.x_values, vec![-32768, 0, 32767]);
    }

    #[test]
    fn test_micrometer_scan_refused_without_calibration() {
        let result = params(ScanUnit::Micrometer).plan(&Calibration::default());
        assert_eq!(result, Err(DomainError::Uncalibrated));
    }

    #[test]
    fn test_validate_rejects_zero_counts() {
        let mut p = params(ScanUnit::Lsb);
        p.points_y = 0;
        assert!(p.validate().is_err());

        let mut p = params(ScanUnit::Lsb);
        p.step_timeout = -1.0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_order_swaps_on_odd_repetitions() {
        let plan = ScanPlan {
            x_values: vec![1, 2],
            y_values: vec![10, 20],
            hits_per_step: 1,
            step_timeout: Duration::ZERO,
            repeat_count: 2,
        };

        let even = plan.points(ScanOrder::for_repetition(0, true));
        assert_eq!(
            even,
            vec![
                DacPoint::new(1, 10),
                DacPoint::new(2, 10),
                DacPoint::new(1, 20),
                DacPoint::new(2, 20)
            ]
        );

        let odd = plan.points(ScanOrder::for_repetition(1, true));
        assert_eq!(
            odd,
            vec![
                DacPoint::new(1, 10),
                DacPoint::new(1, 20),
                DacPoint::new(2, 10),
                DacPoint::new(2, 20)
            ]
        );

        assert_eq!(ScanOrder::for_repetition(1, false), ScanOrder::RowMajor);
    }

    #[test]
    fn test_tick_budget() {
        let mut plan = params(ScanUnit::Lsb).plan(&Calibration::default()).unwrap();
        assert_eq!(plan.step_tick_budget(Duration::from_millis(1)), u64::MAX);

        plan.step_timeout = Duration::from_millis(250);
        assert_eq!(plan.step_tick_budget(Duration::from_millis(1)), 250);
        assert_eq!(plan.step_tick_budget(Duration::from_millis(100)), 2);
    }

    #[test]
    fn test_step_timeout_defaults_to_zero() {
        let json = r#"{"start_x":0,"start_y":0,"stop_x":1,"stop_y":1,"points_x":2,
            "points_y":2,"hits_per_step":3,"repeat_count":1,"scan_units":"lsb"}"#;
        let p: ScanParameters = serde_json::from_str(json).unwrap();
        assert_eq!(p.step_timeout, 0.0);
        assert_eq!(p.unit, ScanUnit::Lsb);
    }
}
