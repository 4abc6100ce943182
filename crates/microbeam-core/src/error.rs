//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// Coordinate unit string is not one of `lsb`, `um`, `volt`
    #[error("Invalid unit: {0} (expected one of lsb, um, volt)")]
    InvalidUnit(String),

    /// Micrometer coordinates requested without a usable calibration
    #[error("Micrometer unit selected, but system calibration is missing or zero")]
    Uncalibrated,

    /// Invalid parameter value
    #[error("Invalid {field}: {value} (expected {expected})")]
    InvalidParameter {
        field: String,
        value: String,
        expected: String,
    },

    /// Calibration file present but unusable
    #[error("Invalid calibration data: {reason}")]
    InvalidCalibration { reason: String },
}

impl DomainError {
    /// Builds an `InvalidParameter` error.
    pub fn invalid(field: &str, value: impl ToString, expected: &str) -> Self {
        Self::InvalidParameter {
            field: field.to_string(),
            value: value.to_string(),
            expected: expected.to_string(),
        }
    }
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
