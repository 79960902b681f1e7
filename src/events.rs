//! Core measurement and alert types for the ANUBIS voltage monitor
//!
//! Readings are produced by the acquisition process as wall-clock tuples without a
//! timezone, so timestamps are kept naive and displayed exactly as recorded.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp type for readings as written by the acquisition clock
pub type Timestamp = NaiveDateTime;

/// Position of a line within the active log file, counted from zero
pub type LineIndex = u64;

/// A single voltage reading taken from the active log
///
/// Created transiently on every poll; only `source_line_index` outlives the cycle,
/// and only once the reading has been alerted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeasurementRecord {
    /// Measured voltage in volts
    pub voltage: f64,
    /// When the acquisition process took the reading
    pub timestamp: Timestamp,
    /// Line position in the log file at read time, used as the dedup key
    pub source_line_index: LineIndex,
}

/// Which side of the safe band a reading crossed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Bound {
    /// Reading was above the upper threshold
    Upper,
    /// Reading was below the lower threshold
    Lower,
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bound::Upper => write!(f, "upper"),
            Bound::Lower => write!(f, "lower"),
        }
    }
}

/// A newly detected threshold violation, handed straight to the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertEvent {
    /// The offending reading
    pub record: MeasurementRecord,
    /// Which bound was crossed
    pub threshold_exceeded: Bound,
    /// Value of the crossed bound at detection time
    pub limit_value: f64,
}
