use crate::alerts::NotificationDispatcher;
use crate::collectors::{parse_record, LineSource, TailLine, TailReader};
use crate::error::{DispatchError, PollLoopError, TailError};
use crate::events::{AlertEvent, MeasurementRecord};
use crate::monitoring::SelfMonitoringCollector;
use crate::state::RunStateHandle;
use crate::triggers::ThresholdEvaluator;
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Granularity of the inter-cycle sleep, bounding how long `stop` waits
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Timing and sizing of the poll loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSettings {
    /// Period between the starts of consecutive cycles
    pub interval: Duration,
    /// Number of most recent lines inspected per cycle
    pub tail_lines: usize,
    /// Upper bound on a single tail read
    pub read_timeout: Duration,
    /// How often the self-monitoring summary is logged
    pub stats_interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(2500),
            tail_lines: 100,
            read_timeout: Duration::from_secs(2),
            stats_interval: Duration::from_secs(300),
        }
    }
}

/// Result of one delivery attempt
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRecord {
    pub event: AlertEvent,
    pub result: Result<(), DispatchError>,
}

/// What a cycle did with the active log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No active log, or it could not be read this tick
    Unavailable,
    /// The active run changed while the batch was being read
    Discarded,
    /// The batch was evaluated
    Processed,
}

/// Summary of one poll cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    /// Lines that parsed into readings
    pub records: usize,
    /// Lines the parser rejected
    pub malformed: usize,
    /// Delivery attempts, in detection order
    pub dispatched: Vec<DispatchRecord>,
}

impl CycleReport {
    fn empty(outcome: CycleOutcome) -> Self {
        Self {
            outcome,
            records: 0,
            malformed: 0,
            dispatched: Vec::new(),
        }
    }
}

/// A tailed batch together with the run it was read for
struct Batch {
    generation: u64,
    lines: Vec<TailLine>,
}

/// Executes single poll cycles: tail, parse, evaluate, dispatch
///
/// The state lock is held only while evaluating, never across the tail read or a
/// delivery attempt. Detection marks lines as alerted before anything is sent.
pub struct CycleRunner {
    state: RunStateHandle,
    reader: Box<dyn LineSource>,
    evaluator: ThresholdEvaluator,
    dispatcher: Arc<NotificationDispatcher>,
    stats: Arc<SelfMonitoringCollector>,
    settings: PollSettings,
    /// Generation the reader's position belongs to
    reader_generation: Option<u64>,
    /// Whether the previous cycle found the log unavailable
    was_unavailable: bool,
}

impl CycleRunner {
    pub fn new(
        state: RunStateHandle,
        dispatcher: Arc<NotificationDispatcher>,
        stats: Arc<SelfMonitoringCollector>,
        settings: PollSettings,
    ) -> Self {
        Self {
            state,
            reader: Box::new(TailReader::new()),
            evaluator: ThresholdEvaluator::new(),
            dispatcher,
            stats,
            settings,
            reader_generation: None,
            was_unavailable: false,
        }
    }

    /// Read lines from `reader` instead of the log file tail reader
    pub fn with_line_source(mut self, reader: Box<dyn LineSource>) -> Self {
        self.reader = reader;
        self.reader_generation = None;
        self
    }

    pub fn stats(&self) -> &Arc<SelfMonitoringCollector> {
        &self.stats
    }

    pub fn settings(&self) -> PollSettings {
        self.settings
    }

    /// Run one cycle
    ///
    /// An unreadable log or a failed delivery is reported in the returned
    /// `CycleReport`; neither stops the loop.
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.stats.record_cycle();

        let batch = match self.read_batch().await {
            Ok(batch) => batch,
            Err(e) => {
                self.stats.record_unavailable();
                if self.was_unavailable {
                    debug!("Active log still unavailable: {}", e);
                } else {
                    warn!("Active log unavailable, skipping cycle: {}", e);
                }
                self.was_unavailable = true;
                return CycleReport::empty(CycleOutcome::Unavailable);
            }
        };

        if self.was_unavailable {
            info!("Active log available again");
            self.was_unavailable = false;
        }

        let (records, malformed) = parse_batch(&batch.lines);
        self.stats.record_lines(records.len() as u64, malformed as u64);

        let Some(events) = self.evaluate_batch(batch.generation, &records) else {
            return CycleReport {
                records: records.len(),
                malformed,
                ..CycleReport::empty(CycleOutcome::Discarded)
            };
        };
        self.stats.record_detected(events.len() as u64);

        let mut dispatched = Vec::with_capacity(events.len());
        for event in events {
            let result = self.dispatcher.dispatch(&event).await;
            self.stats.record_delivery(result.is_ok());
            dispatched.push(DispatchRecord { event, result });
        }

        CycleReport {
            outcome: CycleOutcome::Processed,
            records: records.len(),
            malformed,
            dispatched,
        }
    }

    /// Tail the active log of the current run, bounded by the read timeout
    async fn read_batch(&mut self) -> Result<Batch, TailError> {
        let Some((path, generation)) = self.state.active_source() else {
            return Err(TailError::NoActiveLog);
        };

        if self.reader_generation != Some(generation) {
            // A new run may reuse the same file name, so its position is meaningless
            self.reader.reset();
            self.reader_generation = Some(generation);
        }

        let read_timeout = self.settings.read_timeout;
        let read = self.reader.read_tail(&path, self.settings.tail_lines);
        let lines = tokio::time::timeout(read_timeout, read)
            .await
            .map_err(|_| TailError::Timeout(read_timeout))??;

        Ok(Batch { generation, lines })
    }

    /// Evaluate parsed readings if the batch still belongs to the active run
    ///
    /// # Returns
    ///
    /// New violations in line order, or `None` when the run changed mid-cycle
    fn evaluate_batch(
        &self,
        generation: u64,
        records: &[MeasurementRecord],
    ) -> Option<Vec<AlertEvent>> {
        self.state.with_state(|state| {
            if state.generation() != generation {
                info!(
                    "Active run changed during the cycle, discarding {} reading(s)",
                    records.len()
                );
                return None;
            }
            Some(self.evaluator.evaluate_all(records, state))
        })
    }
}

/// Parse tailed lines, skipping blanks and counting rejects
fn parse_batch(lines: &[TailLine]) -> (Vec<MeasurementRecord>, usize) {
    let mut records = Vec::with_capacity(lines.len());
    let mut malformed = 0;

    for line in lines {
        match parse_record(&line.text, line.index) {
            Ok(Some(record)) => records.push(record),
            Ok(None) => {}
            Err(e) => {
                malformed += 1;
                debug!("Skipping line {}: {}", line.index, e);
            }
        }
    }

    (records, malformed)
}

fn is_running(running: &Mutex<bool>) -> bool {
    *running.lock().unwrap_or_else(PoisonError::into_inner)
}

fn set_running(running: &Mutex<bool>, value: bool) {
    *running.lock().unwrap_or_else(PoisonError::into_inner) = value;
}

/// Drives a `CycleRunner` on a dedicated thread at a fixed period
///
/// Cycles never overlap. When a cycle takes longer than the interval the next one
/// starts immediately after it.
pub struct PollLoop {
    /// Present while the loop is stopped
    runner: Option<CycleRunner>,
    thread_handle: Option<JoinHandle<CycleRunner>>,
    running: Arc<Mutex<bool>>,
    stats: Arc<SelfMonitoringCollector>,
}

impl PollLoop {
    pub fn new(runner: CycleRunner) -> Self {
        Self {
            stats: Arc::clone(runner.stats()),
            runner: Some(runner),
            thread_handle: None,
            running: Arc::new(Mutex::new(false)),
        }
    }

    /// Start polling on a background thread
    ///
    /// Calling `start` on a running loop does nothing.
    ///
    /// # Errors
    ///
    /// Returns `PollLoopError::Runtime` if the async runtime cannot be built.
    pub fn start(&mut self) -> Result<(), PollLoopError> {
        let Some(runner) = self.runner.take() else {
            return Ok(()); // Already running
        };

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                self.runner = Some(runner);
                return Err(e.into());
            }
        };

        set_running(&self.running, true);
        let running = Arc::clone(&self.running);
        let interval = runner.settings().interval;

        let handle = thread::spawn(move || Self::poll_thread(runtime, runner, running));
        self.thread_handle = Some(handle);

        info!("Poll loop started with interval {:?}", interval);
        Ok(())
    }

    /// Stop polling and wait for the current cycle to finish
    ///
    /// # Errors
    ///
    /// Returns `PollLoopError::ThreadPanicked` if the polling thread panicked.
    pub fn stop(&mut self) -> Result<(), PollLoopError> {
        set_running(&self.running, false);

        if let Some(handle) = self.thread_handle.take() {
            let runner = handle.join().map_err(|_| PollLoopError::ThreadPanicked)?;
            self.runner = Some(runner);
            info!("Poll loop stopped");
        }

        Ok(())
    }

    pub fn is_running(&self) -> bool {
        is_running(&self.running)
    }

    pub fn stats(&self) -> &Arc<SelfMonitoringCollector> {
        &self.stats
    }

    fn poll_thread(
        runtime: tokio::runtime::Runtime,
        mut runner: CycleRunner,
        running: Arc<Mutex<bool>>,
    ) -> CycleRunner {
        let settings = runner.settings();
        let mut last_summary = Instant::now();

        while is_running(&running) {
            let started = Instant::now();
            let report = runtime.block_on(runner.run_cycle());

            let failures = report
                .dispatched
                .iter()
                .filter(|record| record.result.is_err())
                .count();
            if failures > 0 {
                error!("{} alert(s) could not be delivered this cycle", failures);
            }

            if last_summary.elapsed() >= settings.stats_interval {
                runner.stats().log_summary();
                last_summary = Instant::now();
            }

            let mut remaining = settings.interval.saturating_sub(started.elapsed());
            while !remaining.is_zero() && is_running(&running) {
                let slice = remaining.min(SLEEP_SLICE);
                thread::sleep(slice);
                remaining -= slice;
            }
        }

        runner
    }
}

impl Drop for PollLoop {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("Error stopping poll loop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::mailer::MockMailTransport;
    use crate::alerts::LogMailer;
    use crate::collectors::TailFuture;
    use crate::events::Bound;
    use crate::state::{PointerFile, RunState, Thresholds};
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    const DATE: &str = "17-08-2017";

    fn test_settings() -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(20),
            tail_lines: 100,
            read_timeout: Duration::from_secs(2),
            stats_interval: Duration::from_secs(300),
        }
    }

    fn test_state(dir: &TempDir) -> RunStateHandle {
        RunStateHandle::new(RunState::new(
            dir.path(),
            PointerFile::new(dir.path().join("db_loc.txt")),
            Thresholds::new(0.003, 0.0005).unwrap(),
            true,
        ))
    }

    fn start_run(state: &RunStateHandle, run: &str) -> PathBuf {
        state.start_new_run(run, DATE, 0.003, 0.0005).unwrap()
    }

    fn append(path: &Path, lines: &[&str]) {
        let mut file = OpenOptions::new().append(true).create(true).open(path).unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
    }

    fn runner_with(state: &RunStateHandle, transport: MockMailTransport) -> CycleRunner {
        let dispatcher = NotificationDispatcher::new(
            Arc::new(transport),
            vec!["shifter@example.org".to_string()],
            Duration::from_secs(5),
        );
        CycleRunner::new(
            state.clone(),
            Arc::new(dispatcher),
            Arc::new(SelfMonitoringCollector::new()),
            test_settings(),
        )
    }

    fn accepting_transport(times: usize) -> MockMailTransport {
        let mut transport = MockMailTransport::new();
        transport
            .expect_send()
            .times(times)
            .returning(|_| Box::pin(async { Ok(()) }));
        transport
    }

    #[tokio::test]
    async fn test_cycle_alerts_upper_then_lower() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let log = start_run(&state, "7");
        append(
            &log,
            &[
                "0.0028,(2017 8 17 14 5 0.0)",
                "0.0035,(2017 8 17 14 5 2.5)",
                "0.0002,(2017 8 17 14 5 5.0)",
            ],
        );

        let mut runner = runner_with(&state, accepting_transport(2));
        let report = runner.run_cycle().await;

        assert_eq!(report.outcome, CycleOutcome::Processed);
        assert_eq!(report.records, 3);
        assert_eq!(report.dispatched.len(), 2);
        assert_eq!(report.dispatched[0].event.threshold_exceeded, Bound::Upper);
        assert_eq!(report.dispatched[0].event.record.source_line_index, 1);
        assert_eq!(report.dispatched[0].event.limit_value, 0.003);
        assert_eq!(report.dispatched[1].event.threshold_exceeded, Bound::Lower);
        assert_eq!(report.dispatched[1].event.record.source_line_index, 2);
        assert_eq!(report.dispatched[1].event.limit_value, 0.0005);
        assert!(report.dispatched.iter().all(|record| record.result.is_ok()));
    }

    #[tokio::test]
    async fn test_repeated_cycles_alert_once_per_line() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let log = start_run(&state, "7");
        append(&log, &["0.0035,(2017 8 17 14 5 0.0)"]);

        let mut runner = runner_with(&state, accepting_transport(2));
        assert_eq!(runner.run_cycle().await.dispatched.len(), 1);
        assert_eq!(runner.run_cycle().await.dispatched.len(), 0);

        // Same text on a new line is a new reading
        append(&log, &["0.0035,(2017 8 17 14 5 0.0)"]);
        let report = runner.run_cycle().await;
        assert_eq!(report.dispatched.len(), 1);
        assert_eq!(report.dispatched[0].event.record.source_line_index, 1);
    }

    #[tokio::test]
    async fn test_failed_delivery_keeps_line_alerted() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let log = start_run(&state, "7");
        append(&log, &["0.0035,(2017 8 17 14 5 0.0)"]);

        let mut transport = MockMailTransport::new();
        transport.expect_send().times(1).returning(|_| {
            Box::pin(async { Err(DispatchError::Transport("connection refused".to_string())) })
        });
        let mut runner = runner_with(&state, transport);

        let report = runner.run_cycle().await;
        assert_eq!(report.dispatched.len(), 1);
        assert!(report.dispatched[0].result.is_err());
        assert!(state.is_alerted(0));

        // The loop carries on and does not retry
        let report = runner.run_cycle().await;
        assert_eq!(report.outcome, CycleOutcome::Processed);
        assert!(report.dispatched.is_empty());

        let stats = runner.stats().collect_metrics();
        assert_eq!(stats.alerts_failed, 1);
        assert_eq!(stats.cycles, 2);
    }

    #[tokio::test]
    async fn test_missing_log_is_unavailable_until_created() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let log = start_run(&state, "7");
        fs::remove_file(&log).unwrap();

        let mut runner = runner_with(&state, accepting_transport(1));
        let report = runner.run_cycle().await;
        assert_eq!(report.outcome, CycleOutcome::Unavailable);
        assert!(report.dispatched.is_empty());

        append(&log, &["0.0001,(2017 8 17 14 5 0.0)"]);
        let report = runner.run_cycle().await;
        assert_eq!(report.outcome, CycleOutcome::Processed);
        assert_eq!(report.dispatched.len(), 1);
        assert_eq!(runner.stats().collect_metrics().unavailable_reads, 1);
    }

    /// Line source whose reads never finish in time
    struct StalledSource;

    impl LineSource for StalledSource {
        fn read_tail<'a>(&'a mut self, _path: &'a Path, _max_lines: usize) -> TailFuture<'a> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, TailError>(Vec::new())
            })
        }

        fn reset(&mut self) {}
    }

    #[tokio::test]
    async fn test_stalled_read_times_out_as_unavailable() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let log = start_run(&state, "7");
        append(&log, &["0.0035,(2017 8 17 14 5 0.0)"]);

        let read_timeout = Duration::from_millis(50);
        let dispatcher = NotificationDispatcher::new(
            Arc::new(accepting_transport(0)),
            vec!["shifter@example.org".to_string()],
            Duration::from_secs(5),
        );
        let mut runner = CycleRunner::new(
            state.clone(),
            Arc::new(dispatcher),
            Arc::new(SelfMonitoringCollector::new()),
            PollSettings {
                read_timeout,
                ..test_settings()
            },
        )
        .with_line_source(Box::new(StalledSource));

        assert!(matches!(
            runner.read_batch().await,
            Err(TailError::Timeout(timeout)) if timeout == read_timeout
        ));

        let started = Instant::now();
        let report = runner.run_cycle().await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.outcome, CycleOutcome::Unavailable);
        assert!(report.dispatched.is_empty());
        assert!(!state.is_alerted(0));
        assert_eq!(runner.stats().collect_metrics().unavailable_reads, 1);
    }

    #[tokio::test]
    async fn test_no_active_run_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let mut runner = runner_with(&state, accepting_transport(0));
        assert_eq!(runner.run_cycle().await.outcome, CycleOutcome::Unavailable);
    }

    #[tokio::test]
    async fn test_monitoring_disabled_sends_nothing() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let log = start_run(&state, "7");
        append(&log, &["0.0035,(2017 8 17 14 5 0.0)", "0.0001,(2017 8 17 14 5 2.5)"]);
        state.set_monitoring_enabled(false);

        let mut runner = runner_with(&state, accepting_transport(0));
        let report = runner.run_cycle().await;

        assert_eq!(report.outcome, CycleOutcome::Processed);
        assert_eq!(report.records, 2);
        assert!(report.dispatched.is_empty());
        assert!(!state.is_alerted(0));
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let log = start_run(&state, "7");
        append(
            &log,
            &[
                "garbage",
                "",
                "0.0035,(2017 8 17 14 5 0.0)",
                "abc,(2017 8 17 14 5 0.0)",
            ],
        );

        let mut runner = runner_with(&state, accepting_transport(1));
        let report = runner.run_cycle().await;

        assert_eq!(report.records, 1);
        assert_eq!(report.malformed, 2);
        assert_eq!(report.dispatched[0].event.record.source_line_index, 2);
    }

    #[tokio::test]
    async fn test_batch_from_previous_run_is_discarded() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let log = start_run(&state, "7");
        append(&log, &["0.0035,(2017 8 17 14 5 0.0)"]);

        let mut runner = runner_with(&state, accepting_transport(0));
        let batch = runner.read_batch().await.unwrap();
        let (records, _) = parse_batch(&batch.lines);

        start_run(&state, "8");
        assert_eq!(runner.evaluate_batch(batch.generation, &records), None);
        assert!(!state.is_alerted(0));
    }

    #[tokio::test]
    async fn test_new_run_restarts_line_indices() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let log = start_run(&state, "7");
        append(&log, &["0.002,(2017 8 17 14 5 0.0)", "0.002,(2017 8 17 14 5 2.5)"]);

        let mut runner = runner_with(&state, accepting_transport(1));
        assert!(runner.run_cycle().await.dispatched.is_empty());

        let log = start_run(&state, "8");
        append(&log, &["0.0035,(2017 8 17 14 6 0.0)"]);
        let report = runner.run_cycle().await;

        assert_eq!(report.dispatched.len(), 1);
        assert_eq!(report.dispatched[0].event.record.source_line_index, 0);
    }

    #[test]
    fn test_poll_loop_start_stop() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let log = start_run(&state, "7");
        append(&log, &["0.0035,(2017 8 17 14 5 0.0)"]);

        let dispatcher = NotificationDispatcher::new(
            Arc::new(LogMailer),
            vec!["shifter@example.org".to_string()],
            Duration::from_secs(5),
        );
        let runner = CycleRunner::new(
            state.clone(),
            Arc::new(dispatcher),
            Arc::new(SelfMonitoringCollector::new()),
            test_settings(),
        );
        let mut poll_loop = PollLoop::new(runner);

        assert!(!poll_loop.is_running());
        poll_loop.start().unwrap();
        assert!(poll_loop.is_running());
        poll_loop.start().unwrap(); // Second start is a no-op

        thread::sleep(Duration::from_millis(200));
        poll_loop.stop().unwrap();
        assert!(!poll_loop.is_running());

        let stats = poll_loop.stats().collect_metrics();
        assert!(stats.cycles >= 2);
        assert_eq!(stats.alerts_detected, 1);
        assert_eq!(stats.alerts_delivered, 1);
        assert!(state.is_alerted(0));

        // Stopping twice is fine
        poll_loop.stop().unwrap();
    }

    #[test]
    fn test_poll_loop_can_restart() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        start_run(&state, "7");

        let dispatcher =
            NotificationDispatcher::new(Arc::new(LogMailer), Vec::new(), Duration::from_secs(5));
        let runner = CycleRunner::new(
            state,
            Arc::new(dispatcher),
            Arc::new(SelfMonitoringCollector::new()),
            test_settings(),
        );
        let mut poll_loop = PollLoop::new(runner);

        poll_loop.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        poll_loop.stop().unwrap();
        let first = poll_loop.stats().collect_metrics().cycles;

        poll_loop.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        poll_loop.stop().unwrap();

        assert!(poll_loop.stats().collect_metrics().cycles > first);
    }
}
