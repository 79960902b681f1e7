//! Threshold evaluation for voltage readings
//!
//! Decides, record by record, whether a reading leaves the safe band of the current
//! run and whether it has already been alerted. Detection marks the record in the
//! run's alert ledger immediately, before any delivery is attempted, so a failing
//! mail collaborator never causes repeated alerts for the same reading.

use crate::events::{AlertEvent, Bound, MeasurementRecord};
use crate::state::RunState;
use log::{debug, warn};

/// Stateless evaluator applying the run's thresholds to readings
#[derive(Debug, Default, Clone, Copy)]
pub struct ThresholdEvaluator;

impl ThresholdEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate one reading against the run state
    ///
    /// With monitoring disabled nothing is evaluated and the state is not touched.
    /// The upper bound is checked before the lower bound.
    ///
    /// # Returns
    ///
    /// An `AlertEvent` if the reading is a new violation, `None` otherwise
    pub fn evaluate(
        &self,
        record: &MeasurementRecord,
        state: &mut RunState,
    ) -> Option<AlertEvent> {
        if !state.monitoring_enabled() {
            return None;
        }

        if state.is_alerted(record.source_line_index) {
            debug!(
                "Line {} already alerted, skipping",
                record.source_line_index
            );
            return None;
        }

        let thresholds = state.thresholds();
        let (bound, limit) = if record.voltage > thresholds.upper() {
            (Bound::Upper, thresholds.upper())
        } else if record.voltage < thresholds.lower() {
            (Bound::Lower, thresholds.lower())
        } else {
            return None;
        };

        state.mark_alerted(record.source_line_index);
        warn!(
            "Voltage {} V at {} (line {}) crossed the {} threshold of {} V",
            record.voltage, record.timestamp, record.source_line_index, bound, limit
        );

        Some(AlertEvent {
            record: record.clone(),
            threshold_exceeded: bound,
            limit_value: limit,
        })
    }

    /// Evaluate readings in order, returning new violations in the same order
    pub fn evaluate_all<'a>(
        &self,
        records: impl IntoIterator<Item = &'a MeasurementRecord>,
        state: &mut RunState,
    ) -> Vec<AlertEvent> {
        records
            .into_iter()
            .filter_map(|record| self.evaluate(record, state))
            .collect()
    }
}
