//! Self-monitoring for the poll loop
//!
//! Tracks what the monitor itself is doing: how many cycles ran, how often the
//! active log was unavailable, how many lines were rejected, and how alert delivery
//! is going. A periodic summary makes a silent monitor distinguishable from a quiet
//! power supply.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

/// Maximum number of delivery results kept for the success rate
const MAX_DELIVERY_SAMPLES: usize = 1000;

/// Counters since the monitor started
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorStats {
    /// Poll cycles started
    pub cycles: u64,
    /// Cycles skipped because the log could not be read
    pub unavailable_reads: u64,
    /// Readings successfully parsed
    pub records_parsed: u64,
    /// Lines rejected by the parser
    pub malformed_lines: u64,
    /// Violations detected
    pub alerts_detected: u64,
    /// Alerts accepted by the mail collaborator
    pub alerts_delivered: u64,
    /// Alerts the mail collaborator failed to deliver
    pub alerts_failed: u64,
    /// Delivery success rate over recent attempts, as a percentage (0-100)
    pub delivery_success_rate: f64,
    /// When the last cycle started
    pub last_cycle: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    stats: MonitorStats,
    recent_deliveries: VecDeque<bool>,
}

/// Thread-safe collector of poll loop statistics
#[derive(Debug, Default)]
pub struct SelfMonitoringCollector {
    inner: Mutex<Inner>,
}

impl SelfMonitoringCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        f(&mut self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn record_cycle(&self) {
        self.with_inner(|inner| {
            inner.stats.cycles += 1;
            inner.stats.last_cycle = Some(Utc::now());
        });
    }

    pub fn record_unavailable(&self) {
        self.with_inner(|inner| inner.stats.unavailable_reads += 1);
    }

    /// Record the outcome of parsing one tailed batch
    pub fn record_lines(&self, parsed: u64, malformed: u64) {
        self.with_inner(|inner| {
            inner.stats.records_parsed += parsed;
            inner.stats.malformed_lines += malformed;
        });
    }

    pub fn record_detected(&self, count: u64) {
        self.with_inner(|inner| inner.stats.alerts_detected += count);
    }

    /// Record the result of one delivery attempt
    pub fn record_delivery(&self, success: bool) {
        debug!("Recording delivery result: success={}", success);
        self.with_inner(|inner| {
            if success {
                inner.stats.alerts_delivered += 1;
            } else {
                inner.stats.alerts_failed += 1;
            }
            inner.recent_deliveries.push_back(success);
            while inner.recent_deliveries.len() > MAX_DELIVERY_SAMPLES {
                inner.recent_deliveries.pop_front();
            }
        });
    }

    /// Current counters, with the delivery rate computed over recent attempts
    pub fn collect_metrics(&self) -> MonitorStats {
        self.with_inner(|inner| {
            let mut stats = inner.stats.clone();
            stats.delivery_success_rate = if inner.recent_deliveries.is_empty() {
                100.0
            } else {
                let delivered = inner.recent_deliveries.iter().filter(|ok| **ok).count();
                delivered as f64 / inner.recent_deliveries.len() as f64 * 100.0
            };
            stats
        })
    }

    /// Log a one-line summary, warning when delivery is unreliable
    pub fn log_summary(&self) -> MonitorStats {
        let stats = self.collect_metrics();

        info!(
            "Monitor stats: cycles={}, unavailable={}, records={}, malformed={}, alerts={} (delivered={}, failed={}), delivery_success={:.1}%",
            stats.cycles,
            stats.unavailable_reads,
            stats.records_parsed,
            stats.malformed_lines,
            stats.alerts_detected,
            stats.alerts_delivered,
            stats.alerts_failed,
            stats.delivery_success_rate
        );

        if stats.delivery_success_rate < 90.0 && stats.alerts_delivered + stats.alerts_failed > 0 {
            warn!(
                "Low alert delivery success rate: {:.1}%",
                stats.delivery_success_rate
            );
        }

        stats
    }
}
