/// Run lifecycle state shared by the poll loop and operator actions
pub mod run_state;

/// Sidecar file naming the active log
pub mod pointer_file;

pub use pointer_file::PointerFile;
pub use run_state::{
    current_run_date, AlertLedger, RunSnapshot, RunState, RunStateHandle, Thresholds,
    DEFAULT_RUN_NUMBER,
};
