//! Microbeam Core - Shared domain types for the scan controller
//!
//! This crate provides the types shared between the hardware layer
//! (microbeam-hw), the daemon (microbeamd) and the control client (mbctl):
//! DAC coordinates and their units, calibration, scan plans, run identity
//! and hit records.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod calibration;
pub mod dac;
pub mod error;
pub mod run;
pub mod scan;

// Re-exports for convenience
pub use calibration::{Calibration, CALIBRATION_FILE};
pub use dac::{
    clamp_lsb, lsb_to_voltage, round_to_lsb, truncate_to_lsb, voltage_to_lsb, Axis, DacPoint,
    ScanUnit, DAC_MAX, DAC_MIN,
};
pub use error::{DomainError, DomainResult};
pub use run::{HitBatch, PollCursor, RunId, RunState, RunStatus};
pub use scan::{linspace, ScanOrder, ScanParameters, ScanPlan};
