//! Unified error handling for the cdr-staypoints library.
//!
//! Per-record kinds (`UnresolvableGeometry`, `TimestampParseFailure`,
//! `UnknownCell`) are collected into a run report instead of aborting a batch.
//! Recovered kinds (`MalformedAzimuth`, `SamplingExhausted`) are reported as
//! warnings. Run-level kinds (`OracleContractViolation`, `InvalidConfig`)
//! abort the pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unified error type for pipeline operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MobilityError {
    /// Coverage polygon is empty after clipping; the tower cannot place points
    UnresolvableGeometry { cell_id: String },
    /// Bearing value was present but not numeric; defaulted to 0
    MalformedAzimuth { cell_id: String, raw: String },
    /// Rejection sampling never hit the polygon; centroid used instead
    SamplingExhausted {
        unique_id: String,
        cell_id: String,
        attempts: u32,
    },
    /// Oracle returned a label list that does not line up with its input
    OracleContractViolation {
        user_id: Option<String>,
        expected: usize,
        actual: usize,
    },
    /// Timestamp could not be normalized to an epoch
    TimestampParseFailure { raw: String, message: String },
    /// Event references a cell with no tower metadata
    UnknownCell { cell_id: String },
    /// Configuration error
    InvalidConfig { message: String },
    /// Generic internal error
    Internal { message: String },
}

impl MobilityError {
    /// Whether this error aborts the whole run rather than a single record.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MobilityError::OracleContractViolation { .. }
                | MobilityError::InvalidConfig { .. }
                | MobilityError::Internal { .. }
        )
    }
}

impl fmt::Display for MobilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MobilityError::UnresolvableGeometry { cell_id } => {
                write!(f, "Cell '{}' has no coverage left after clipping", cell_id)
            }
            MobilityError::MalformedAzimuth { cell_id, raw } => {
                write!(
                    f,
                    "Cell '{}' has non-numeric azimuth '{}', using 0",
                    cell_id, raw
                )
            }
            MobilityError::SamplingExhausted {
                unique_id,
                cell_id,
                attempts,
            } => {
                write!(
                    f,
                    "No sample inside cell '{}' for '{}' after {} attempts, using centroid",
                    cell_id, unique_id, attempts
                )
            }
            MobilityError::OracleContractViolation {
                user_id,
                expected,
                actual,
            } => {
                if let Some(user) = user_id {
                    write!(
                        f,
                        "Oracle returned {} labels for user '{}', expected {}",
                        actual, user, expected
                    )
                } else {
                    write!(
                        f,
                        "Oracle returned {} labels, expected {}",
                        actual, expected
                    )
                }
            }
            MobilityError::TimestampParseFailure { raw, message } => {
                write!(f, "Cannot parse timestamp '{}': {}", raw, message)
            }
            MobilityError::UnknownCell { cell_id } => {
                write!(f, "No tower metadata for cell '{}'", cell_id)
            }
            MobilityError::InvalidConfig { message } => {
                write!(f, "Configuration error: {}", message)
            }
            MobilityError::Internal { message } => {
                write!(f, "Internal error: {}", message)
            }
        }
    }
}

impl std::error::Error for MobilityError {}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, MobilityError>;

/// Extension trait for converting Option to MobilityError.
pub trait OptionExt<T> {
    /// Convert Option to Result with an unresolvable-geometry error.
    fn ok_or_unresolvable(self, cell_id: &str) -> Result<T>;

    /// Convert Option to Result with an unknown-cell error.
    fn ok_or_unknown_cell(self, cell_id: &str) -> Result<T>;

    /// Convert Option to Result with generic internal error.
    fn ok_or_internal(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_unresolvable(self, cell_id: &str) -> Result<T> {
        self.ok_or_else(|| MobilityError::UnresolvableGeometry {
            cell_id: cell_id.to_string(),
        })
    }

    fn ok_or_unknown_cell(self, cell_id: &str) -> Result<T> {
        self.ok_or_else(|| MobilityError::UnknownCell {
            cell_id: cell_id.to_string(),
        })
    }

    fn ok_or_internal(self, message: &str) -> Result<T> {
        self.ok_or_else(|| MobilityError::Internal {
            message: message.to_string(),
        })
    }
}
