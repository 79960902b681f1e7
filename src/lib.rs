/// Error types for the voltage monitor
pub mod error;

/// Core data types shared between components
pub mod events;

/// Log tailing and record parsing
pub mod collectors;

/// Active run, thresholds and alert ledger
pub mod state;

/// Threshold evaluation
pub mod triggers;

/// Alert formatting and mail delivery
pub mod alerts;

/// Configuration management
pub mod config;

/// Self-monitoring counters
pub mod monitoring;

/// Periodic tail, evaluate and dispatch cycle
pub mod poll_loop;

// Re-export commonly used types
pub use error::{ConfigError, DispatchError, ParseError, PollLoopError, RunStateError, TailError};
pub use events::{AlertEvent, Bound, MeasurementRecord};
