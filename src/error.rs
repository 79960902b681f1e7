use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that make the active log unavailable for one tail read
///
/// Every variant is transient from the poll loop's point of view: the cycle is
/// skipped and the next tick tries again.
#[derive(Error, Debug)]
pub enum TailError {
    #[error("No active run log")]
    NoActiveLog,

    #[error("Log file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Tail read timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a single log line is rejected by the record parser
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Expected exactly 2 comma-separated fields, found {0}")]
    FieldCount(usize),

    #[error("Invalid voltage: {0}")]
    InvalidVoltage(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Errors that can occur when sending an alert
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("No recipients configured")]
    NoRecipients,

    #[error("Invalid email address: {0}")]
    InvalidAddress(String),

    #[error("Failed to build message: {0}")]
    Build(String),

    #[error("Mail transport failed: {0}")]
    Transport(String),

    #[error("Dispatch timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors raised by run lifecycle operations
#[derive(Error, Debug)]
pub enum RunStateError {
    #[error("Upper threshold {upper} must be greater than lower threshold {lower}")]
    InvalidThresholds { upper: f64, lower: f64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from starting or stopping the poll loop
#[derive(Error, Debug)]
pub enum PollLoopError {
    #[error("Failed to build async runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("Poll loop thread panicked")]
    ThreadPanicked,
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<RunStateError> for ConfigError {
    fn from(err: RunStateError) -> Self {
        ConfigError::ValidationError(err.to_string())
    }
}
