use crate::error::RunStateError;
use crate::events::LineIndex;
use crate::state::PointerFile;
use chrono::{Local, NaiveDate};
use log::{info, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Run number used until an operator names the run
pub const DEFAULT_RUN_NUMBER: &str = "notrun";

/// Today's date in the format used for run file names
pub fn current_run_date() -> String {
    Local::now().format("%d-%m-%Y").to_string()
}

/// Name of the log file the acquisition process appends to for a run
pub fn run_log_file_name(run_number: &str, date: &str) -> String {
    let safe_run: String = run_number
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    format!("anubis_low-voltage_{}_{}.db", safe_run, date)
}

/// Recover the run number and date from a run log file name
///
/// # Returns
///
/// `None` unless the name has the shape produced by `run_log_file_name` with a
/// valid `dd-mm-YYYY` date
pub fn parse_run_log_file_name(file_name: &str) -> Option<(String, String)> {
    let stem = file_name
        .strip_prefix("anubis_low-voltage_")?
        .strip_suffix(".db")?;
    let (run_number, date) = stem.rsplit_once('_')?;
    if run_number.is_empty() || NaiveDate::parse_from_str(date, "%d-%m-%Y").is_err() {
        return None;
    }
    Some((run_number.to_string(), date.to_string()))
}

/// The safe voltage band
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    upper: f64,
    lower: f64,
}

impl Thresholds {
    /// Create a band, rejecting non-finite bounds and `upper <= lower`
    pub fn new(upper: f64, lower: f64) -> Result<Self, RunStateError> {
        if !upper.is_finite() || !lower.is_finite() || upper <= lower {
            return Err(RunStateError::InvalidThresholds { upper, lower });
        }
        Ok(Self { upper, lower })
    }

    /// Create a band whose lower bound is half the upper bound
    pub fn from_upper(upper: f64) -> Result<Self, RunStateError> {
        Self::new(upper, upper / 2.0)
    }

    pub fn upper(&self) -> f64 {
        self.upper
    }

    pub fn lower(&self) -> f64 {
        self.lower
    }
}

/// Record indices that have already produced an alert in the current run
///
/// Keys are line positions in the active log. Entries are only ever added while a
/// run lasts; the whole ledger is dropped when a new run starts.
#[derive(Debug, Clone, Default)]
pub struct AlertLedger {
    indices: HashSet<LineIndex>,
}

impl AlertLedger {
    pub fn contains(&self, index: LineIndex) -> bool {
        self.indices.contains(&index)
    }

    /// Returns `false` if the index was already present
    pub fn insert(&mut self, index: LineIndex) -> bool {
        self.indices.insert(index)
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Point-in-time view of the run for operators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSnapshot {
    pub run_number: String,
    pub created_date: String,
    pub active_log_path: Option<PathBuf>,
    pub upper_threshold: f64,
    pub lower_threshold: f64,
    pub monitoring_enabled: bool,
    pub alerts_sent: usize,
}

impl fmt::Display for RunSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let log = self
            .active_log_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        write!(
            f,
            "run {} ({}), log {}, band [{} V, {} V], monitoring {}, {} alerts",
            self.run_number,
            if self.created_date.is_empty() {
                "unknown date"
            } else {
                self.created_date.as_str()
            },
            log,
            self.lower_threshold,
            self.upper_threshold,
            if self.monitoring_enabled { "on" } else { "off" },
            self.alerts_sent
        )
    }
}

/// Mutable state of the current monitoring run
#[derive(Debug)]
pub struct RunState {
    run_number: String,
    created_date: String,
    active_log_path: Option<PathBuf>,
    thresholds: Thresholds,
    monitoring_enabled: bool,
    alerted: AlertLedger,
    /// Bumped whenever the active log changes, so in-flight reads can be discarded
    generation: u64,
    data_dir: PathBuf,
    pointer: PointerFile,
}

impl RunState {
    /// Create a state with no active log yet
    ///
    /// # Arguments
    ///
    /// * `data_dir` - Directory where run log files are created
    /// * `pointer` - Sidecar file naming the active log
    /// * `thresholds` - Initial safe band
    /// * `monitoring_enabled` - Whether violations are evaluated at all
    pub fn new(
        data_dir: impl Into<PathBuf>,
        pointer: PointerFile,
        thresholds: Thresholds,
        monitoring_enabled: bool,
    ) -> Self {
        Self {
            run_number: DEFAULT_RUN_NUMBER.to_string(),
            created_date: String::new(),
            active_log_path: None,
            thresholds,
            monitoring_enabled,
            alerted: AlertLedger::default(),
            generation: 0,
            data_dir: data_dir.into(),
            pointer,
        }
    }

    /// Start a new run with a fresh, empty log file
    ///
    /// Creates `anubis_low-voltage_<run>_<date>.db` in the data directory and points
    /// the sidecar file at it. A file of the same name that already holds readings is
    /// moved aside to `<name>.bak` first. Nothing in the state changes unless every
    /// file operation succeeds; on success the log path, thresholds and alert ledger
    /// are replaced together.
    ///
    /// # Returns
    ///
    /// The path of the new active log
    ///
    /// # Errors
    ///
    /// Returns `RunStateError::InvalidThresholds` for an unordered band and
    /// `RunStateError::Io` if the log or pointer cannot be written.
    pub fn start_new_run(
        &mut self,
        run_number: &str,
        date: &str,
        upper: f64,
        lower: f64,
    ) -> Result<PathBuf, RunStateError> {
        let thresholds = Thresholds::new(upper, lower)?;

        fs::create_dir_all(&self.data_dir)?;
        let log_path = self.data_dir.join(run_log_file_name(run_number, date));

        if fs::metadata(&log_path).map(|m| m.len() > 0).unwrap_or(false) {
            let mut backup = log_path.as_os_str().to_owned();
            backup.push(".bak");
            warn!(
                "{} already holds readings, moving it to {}",
                log_path.display(),
                PathBuf::from(&backup).display()
            );
            fs::rename(&log_path, &backup)?;
        }

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        self.pointer.write(&log_path)?;

        self.run_number = run_number.to_string();
        self.created_date = date.to_string();
        self.thresholds = thresholds;
        self.switch_log(log_path.clone());

        info!(
            "Started run {} on {} writing to {}",
            self.run_number,
            self.created_date,
            log_path.display()
        );
        Ok(log_path)
    }

    /// Point the monitor at the log named by the sidecar file
    ///
    /// The file itself may not exist yet; reads stay unavailable until the
    /// acquisition process creates it.
    ///
    /// # Returns
    ///
    /// The resumed path, or `None` if the pointer file is missing or blank
    pub fn resume_from_pointer(&mut self) -> Result<Option<PathBuf>, RunStateError> {
        let Some(log_path) = self.pointer.read()? else {
            return Ok(None);
        };

        let identity = log_path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(parse_run_log_file_name);
        match identity {
            Some((run_number, date)) => {
                self.run_number = run_number;
                self.created_date = date;
            }
            None => {
                warn!(
                    "Cannot tell run number or date from {}",
                    log_path.display()
                );
                self.run_number = DEFAULT_RUN_NUMBER.to_string();
                self.created_date = String::new();
            }
        }

        self.switch_log(log_path.clone());
        info!("Resumed monitoring of {}", log_path.display());
        Ok(Some(log_path))
    }

    fn switch_log(&mut self, log_path: PathBuf) {
        self.active_log_path = Some(log_path);
        self.alerted = AlertLedger::default();
        self.generation += 1;
    }

    /// Replace the safe band; the alert ledger is kept
    pub fn set_thresholds(&mut self, upper: f64, lower: f64) -> Result<(), RunStateError> {
        self.thresholds = Thresholds::new(upper, lower)?;
        info!("Thresholds set to [{} V, {} V]", lower, upper);
        Ok(())
    }

    pub fn set_monitoring_enabled(&mut self, enabled: bool) {
        if self.monitoring_enabled != enabled {
            info!(
                "Monitoring is now {}",
                if enabled { "ON" } else { "OFF" }
            );
        }
        self.monitoring_enabled = enabled;
    }

    pub fn is_alerted(&self, index: LineIndex) -> bool {
        self.alerted.contains(index)
    }

    pub fn mark_alerted(&mut self, index: LineIndex) {
        self.alerted.insert(index);
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn monitoring_enabled(&self) -> bool {
        self.monitoring_enabled
    }

    pub fn active_log_path(&self) -> Option<&Path> {
        self.active_log_path.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn run_number(&self) -> &str {
        &self.run_number
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_number: self.run_number.clone(),
            created_date: self.created_date.clone(),
            active_log_path: self.active_log_path.clone(),
            upper_threshold: self.thresholds.upper,
            lower_threshold: self.thresholds.lower,
            monitoring_enabled: self.monitoring_enabled,
            alerts_sent: self.alerted.len(),
        }
    }
}

/// Shared handle to the run state
///
/// Every read and write of the run state goes through this one lock, whether it comes
/// from the poll loop or from operator actions on other threads.
#[derive(Debug, Clone)]
pub struct RunStateHandle {
    inner: Arc<Mutex<RunState>>,
}

impl RunStateHandle {
    pub fn new(state: RunState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        // A panic while holding the lock cannot leave the state half-updated
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with exclusive access to the state
    pub fn with_state<R>(&self, f: impl FnOnce(&mut RunState) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn start_new_run(
        &self,
        run_number: &str,
        date: &str,
        upper: f64,
        lower: f64,
    ) -> Result<PathBuf, RunStateError> {
        self.lock().start_new_run(run_number, date, upper, lower)
    }

    pub fn resume_from_pointer(&self) -> Result<Option<PathBuf>, RunStateError> {
        self.lock().resume_from_pointer()
    }

    pub fn set_thresholds(&self, upper: f64, lower: f64) -> Result<(), RunStateError> {
        self.lock().set_thresholds(upper, lower)
    }

    pub fn set_monitoring_enabled(&self, enabled: bool) {
        self.lock().set_monitoring_enabled(enabled)
    }

    pub fn is_alerted(&self, index: LineIndex) -> bool {
        self.lock().is_alerted(index)
    }

    pub fn mark_alerted(&self, index: LineIndex) {
        self.lock().mark_alerted(index)
    }

    /// Active log path together with its generation
    pub fn active_source(&self) -> Option<(PathBuf, u64)> {
        let state = self.lock();
        state
            .active_log_path()
            .map(|path| (path.to_path_buf(), state.generation()))
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.lock().snapshot()
    }
}
