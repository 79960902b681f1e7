use anubis::alerts::{LogMailer, MailTransport, NotificationDispatcher, SmtpMailer};
use anubis::config::{Config, MailerConfig};
use anubis::error::{ConfigError, RunStateError};
use anubis::monitoring::SelfMonitoringCollector;
use anubis::poll_loop::{CycleRunner, PollLoop};
use anubis::state::{current_run_date, PointerFile, RunState, RunStateHandle};
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// Command-line arguments for the ANUBIS low-voltage monitor
#[derive(Parser, Debug)]
#[command(
    name = "anubis",
    about = "ANUBIS low-voltage monitor - mails an alert when a logged voltage leaves its safe band",
    long_about = "Tails the low-voltage log written by the acquisition process, checks every new \
                  reading against the run's thresholds and sends one alert mail per offending \
                  line to the configured recipients."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,

    /// Start a new run with this number instead of resuming the recorded one
    #[arg(long, value_name = "RUN")]
    rnum: Option<String>,

    /// Upper voltage threshold in volts
    #[arg(long, value_name = "VOLTS")]
    threshold: Option<f64>,

    /// Lower voltage threshold in volts (defaults to half the upper threshold)
    #[arg(long, value_name = "VOLTS")]
    lower: Option<f64>,

    /// Alert recipients, comma separated
    #[arg(long, value_name = "ADDRESSES", value_delimiter = ',')]
    emails: Vec<String>,

    /// Sender account username
    #[arg(long, value_name = "USER")]
    user: Option<String>,

    /// Sender account password
    #[arg(long, value_name = "PASSWORD")]
    pass: Option<String>,

    /// Poll interval in milliseconds
    #[arg(long, value_name = "MS")]
    interval_ms: Option<u64>,

    /// Record the run but do not evaluate readings
    #[arg(long)]
    no_monitor: bool,
}

impl Cli {
    /// Reject arguments that can never produce a usable monitor
    ///
    /// Checked before any configuration is read: `--config` must not name a
    /// directory, `--rnum` must not be blank, and the thresholds must be finite.
    /// Band ordering is left to `Config::validate`, which also sees file values.
    fn validate(&self) -> Result<(), String> {
        // An absent file is fine, load_config falls back to defaults
        if let Some(path) = self.config.as_deref().filter(|path| path.exists()) {
            if path.is_dir() {
                return Err(format!("--config names a directory: {}", path.display()));
            }
            if path.extension().map_or(true, |ext| ext != "toml") {
                warn!("{} is read as TOML despite its extension", path.display());
            }
        }

        if let Some(ref run) = self.rnum {
            if run.trim().is_empty() {
                return Err("Run number must not be empty".to_string());
            }
        }

        for (name, value) in [("threshold", self.threshold), ("lower", self.lower)] {
            if let Some(value) = value {
                if !value.is_finite() {
                    return Err(format!("--{} must be a finite number, got {}", name, value));
                }
            }
        }

        Ok(())
    }

    /// The `--config` path as text, for logging and `load_config`
    fn config_path_str(&self) -> Result<Option<&str>, String> {
        self.config
            .as_deref()
            .map(|path| {
                path.to_str()
                    .ok_or_else(|| format!("--config is not valid UTF-8: {}", path.display()))
            })
            .transpose()
    }

    /// Overlay command-line values on the loaded configuration
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(ref run) = self.rnum {
            config.run.number = run.trim().to_string();
        }
        if let Some(threshold) = self.threshold {
            config.run.upper_threshold = threshold;
        }
        if let Some(lower) = self.lower {
            config.run.lower_threshold = Some(lower);
        }
        if self.no_monitor {
            config.run.monitoring_enabled = false;
        }
        if let Some(interval_ms) = self.interval_ms {
            config.poll.interval_ms = interval_ms;
        }

        let recipients: Vec<String> = self
            .emails
            .iter()
            .map(|address| address.trim().to_string())
            .filter(|address| !address.is_empty())
            .collect();
        if !recipients.is_empty() {
            config.alerts.recipients = recipients;
        }

        if let Some(ref user) = self.user {
            config.alerts.credentials.username = user.clone();
        }
        if let Some(ref pass) = self.pass {
            config.alerts.credentials.password = pass.clone();
        }
    }

    /// Whether this invocation starts a new run rather than resuming
    fn starts_new_run(&self) -> bool {
        self.rnum.is_some()
    }
}

/// Wires the run state, poll loop and mail delivery together
///
/// Owns the lifecycle: choosing the active run, starting and stopping the poll
/// loop, and waiting for a shutdown signal.
pub struct VoltageMonitor {
    config: Config,

    /// Shared run state, also used by the poll loop
    state: RunStateHandle,

    poll_loop: PollLoop,

    /// Shutdown signal
    shutdown_sender: Sender<()>,
    shutdown_receiver: Receiver<()>,
}

impl VoltageMonitor {
    /// Create a new VoltageMonitor with the given configuration
    ///
    /// No run is selected and nothing is polled until `start`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is invalid or the mail relay
    /// cannot be set up.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        info!("Initializing VoltageMonitor with configuration");
        config.validate()?;

        let state = RunStateHandle::new(RunState::new(
            config.run.data_dir.clone(),
            PointerFile::new(config.run.pointer_path()),
            config.run.thresholds()?,
            config.run.monitoring_enabled,
        ));

        let transport: Arc<dyn MailTransport> = match &config.alerts.mailer {
            MailerConfig::Smtp { host, port } => {
                info!("Sending alerts through {}:{}", host, port);
                let mailer = SmtpMailer::new(
                    host,
                    *port,
                    &config.alerts.credentials,
                    config.alerts.dispatch_timeout(),
                )
                .map_err(|e| ConfigError::ValidationError(format!("mail relay: {}", e)))?;
                Arc::new(mailer)
            }
            MailerConfig::Log => {
                warn!("Log mailer selected, alerts will only be logged");
                Arc::new(LogMailer)
            }
        };

        let dispatcher = NotificationDispatcher::new(
            transport,
            config.alerts.recipients.clone(),
            config.alerts.dispatch_timeout(),
        );

        let runner = CycleRunner::new(
            state.clone(),
            Arc::new(dispatcher),
            Arc::new(SelfMonitoringCollector::new()),
            config.poll.settings(),
        );

        let (shutdown_sender, shutdown_receiver) = mpsc::channel();

        Ok(VoltageMonitor {
            config,
            state,
            poll_loop: PollLoop::new(runner),
            shutdown_sender,
            shutdown_receiver,
        })
    }

    /// Read the monitor's TOML file, before command-line overrides
    ///
    /// The monitor must come up on a shift machine even without its file, so an
    /// unreadable file means built-in defaults (Gmail relay, 2.5 s polling). A file
    /// that is present but malformed stops startup instead of silently running with
    /// the wrong band.
    pub fn load_config(config_path: Option<&str>) -> Result<Config, ConfigError> {
        let Some(path) = config_path else {
            info!("No configuration file given, using built-in defaults");
            return Ok(Config::default());
        };

        info!("Loading configuration from {}", path);
        Config::from_file(std::path::Path::new(path)).or_else(|e| match e {
            ConfigError::ReadError(reason) => {
                warn!("Cannot read {} ({}), using built-in defaults", path, reason);
                Ok(Config::default())
            }
            e => {
                error!("Rejecting configuration {}: {}", path, e);
                Err(e)
            }
        })
    }

    /// Choose the active log
    ///
    /// A new run is started when asked for or when no previous run is recorded;
    /// otherwise the run named by the pointer file is resumed.
    ///
    /// # Returns
    ///
    /// The path of the active log
    pub fn select_run(&self, new_run: bool) -> Result<PathBuf, RunStateError> {
        if !new_run {
            if let Some(path) = self.state.resume_from_pointer()? {
                return Ok(path);
            }
            info!(
                "No active run recorded in {}, starting run {}",
                self.config.run.pointer_path().display(),
                self.config.run.number
            );
        }

        self.state.start_new_run(
            &self.config.run.number,
            &current_run_date(),
            self.config.run.upper_threshold,
            self.config.run.lower(),
        )
    }

    /// Select the run and start polling
    ///
    /// # Errors
    ///
    /// Returns an error if the run cannot be selected or the poll loop fails to
    /// start.
    pub fn start(&mut self, new_run: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("Starting VoltageMonitor components");

        self.select_run(new_run)?;
        info!("{}", self.state.snapshot());

        self.poll_loop.start()?;

        info!("All VoltageMonitor components started successfully");
        Ok(())
    }

    /// Stop polling, letting an in-flight cycle finish
    pub fn stop(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("Stopping VoltageMonitor components");

        self.poll_loop.stop()?;
        self.poll_loop.stats().log_summary();
        info!("{}", self.state.snapshot());

        info!("VoltageMonitor stopped successfully");
        Ok(())
    }

    /// Park the main thread while the poll loop runs
    ///
    /// Returns once the Ctrl+C handler posts on the shutdown channel. The poll
    /// loop keeps its own thread, so nothing is polled here.
    pub fn wait_for_shutdown(&self) -> Result<(), mpsc::RecvError> {
        self.shutdown_receiver.recv()?;
        info!("Stop requested, finishing the current cycle");
        Ok(())
    }
}

fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    info!("Starting ANUBIS low-voltage monitor");

    if let Err(e) = cli.validate() {
        error!("Invalid arguments: {}", e);
        std::process::exit(1);
    }

    let config_path = match cli.config_path_str() {
        Ok(path) => path,
        Err(e) => {
            error!("Invalid configuration path: {}", e);
            std::process::exit(1);
        }
    };

    let mut config = match VoltageMonitor::load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    cli.apply_overrides(&mut config);

    let mut monitor = match VoltageMonitor::new(config) {
        Ok(monitor) => monitor,
        Err(e) => {
            error!("Failed to initialize VoltageMonitor: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = monitor.start(cli.starts_new_run()) {
        error!("Failed to start VoltageMonitor: {}", e);
        std::process::exit(1);
    }

    let shutdown_sender = monitor.shutdown_sender.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received interrupt signal (SIGINT), shutting down gracefully...");
        if let Err(e) = shutdown_sender.send(()) {
            error!("Failed to send shutdown signal: {}", e);
        }
    }) {
        error!("Failed to install interrupt handler: {}", e);
        let _ = monitor.stop();
        std::process::exit(1);
    }

    info!("ANUBIS monitor is running. Press Ctrl+C to stop.");

    if let Err(e) = monitor.wait_for_shutdown() {
        error!("Shutdown channel closed unexpectedly: {}", e);
    }

    if let Err(e) = monitor.stop() {
        error!("Error during shutdown: {}", e);
        std::process::exit(1);
    }

    info!("ANUBIS monitor shutdown complete");
}
