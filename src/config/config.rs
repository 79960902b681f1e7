use crate::alerts::Credentials;
use crate::error::ConfigError;
use crate::poll_loop::PollSettings;
use crate::state::{Thresholds, DEFAULT_RUN_NUMBER};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Monitor configuration, loaded from TOML
///
/// Every section and field has a default, so a file only needs to name what it
/// changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub run: RunConfig,
    pub poll: PollConfig,
    pub alerts: AlertConfig,
}

/// Run identity, safe band and file locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Run label used in the log file name
    pub number: String,
    /// Upper bound of the safe band, in volts
    pub upper_threshold: f64,
    /// Lower bound of the safe band; half the upper bound when unset
    pub lower_threshold: Option<f64>,
    pub monitoring_enabled: bool,
    /// Directory holding run logs and the pointer file
    pub data_dir: PathBuf,
    /// Pointer file naming the active log, relative to `data_dir`
    pub pointer_file: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            number: DEFAULT_RUN_NUMBER.to_string(),
            upper_threshold: 1.5e-3,
            lower_threshold: None,
            monitoring_enabled: true,
            data_dir: PathBuf::from("."),
            pointer_file: PathBuf::from("db_loc.txt"),
        }
    }
}

impl RunConfig {
    pub fn lower(&self) -> f64 {
        self.lower_threshold.unwrap_or(self.upper_threshold / 2.0)
    }

    /// Validated safe band
    pub fn thresholds(&self) -> Result<Thresholds, ConfigError> {
        Ok(Thresholds::new(self.upper_threshold, self.lower())?)
    }

    /// Location of the pointer file; an absolute `pointer_file` is used as is
    pub fn pointer_path(&self) -> PathBuf {
        self.data_dir.join(&self.pointer_file)
    }
}

/// Poll loop timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub tail_lines: usize,
    pub read_timeout_ms: u64,
    pub stats_interval_seconds: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2500,
            tail_lines: 100,
            read_timeout_ms: 2000,
            stats_interval_seconds: 300,
        }
    }
}

impl PollConfig {
    pub fn settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(self.interval_ms),
            tail_lines: self.tail_lines,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            stats_interval: Duration::from_secs(self.stats_interval_seconds),
        }
    }
}

/// Alert recipients and delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub recipients: Vec<String>,
    pub dispatch_timeout_seconds: u64,
    pub credentials: Credentials,
    pub mailer: MailerConfig,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            recipients: Vec::new(),
            dispatch_timeout_seconds: 30,
            credentials: Credentials::default(),
            mailer: MailerConfig::default(),
        }
    }
}

impl AlertConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_seconds)
    }
}

/// How alert mail leaves the process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum MailerConfig {
    /// SMTP relay with STARTTLS
    Smtp {
        #[serde(default = "default_smtp_host")]
        host: String,
        #[serde(default = "default_smtp_port")]
        port: u16,
    },
    /// Only log alerts, for dry runs
    Log,
}

impl Default for MailerConfig {
    fn default() -> Self {
        MailerConfig::Smtp {
            host: default_smtp_host(),
            port: default_smtp_port(),
        }
    }
}

fn default_smtp_host() -> String {
    "smtp.gmail.com".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

impl Config {
    /// Load a configuration file
    ///
    /// Values are not validated here, since command-line overrides may still fix
    /// them. Call `validate` once the final configuration is assembled.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadError` if the file cannot be read and
    /// `ConfigError::ParseError` if it is not valid TOML for this layout.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&contents)
    }

    /// Parse configuration text without validating it
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Check that every value is usable
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.run.thresholds()?;

        if self.run.number.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "run number must not be empty".to_string(),
            ));
        }

        if self.poll.interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll interval must be greater than 0".to_string(),
            ));
        }

        if self.poll.tail_lines == 0 {
            return Err(ConfigError::ValidationError(
                "tail_lines must be greater than 0".to_string(),
            ));
        }

        if self.poll.read_timeout_ms == 0 || self.alerts.dispatch_timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "timeouts must be greater than 0".to_string(),
            ));
        }

        if self.run.monitoring_enabled && self.alerts.recipients.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one alert recipient is required while monitoring is enabled"
                    .to_string(),
            ));
        }

        if let Some(bad) = self
            .alerts
            .recipients
            .iter()
            .find(|recipient| !is_email_shaped(recipient))
        {
            return Err(ConfigError::ValidationError(format!(
                "invalid recipient address: '{}'",
                bad
            )));
        }

        if let MailerConfig::Smtp { host, port } = &self.alerts.mailer {
            if host.trim().is_empty() || *port == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "invalid SMTP relay: '{}:{}'",
                    host, port
                )));
            }
        }

        Ok(())
    }
}

fn is_email_shaped(address: &str) -> bool {
    match address.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !address.contains(char::is_whitespace)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.alerts.recipients = vec!["shifter@example.org".to_string()];
        config
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();

        assert_eq!(config.run.number, "notrun");
        assert_eq!(config.run.upper_threshold, 1.5e-3);
        assert_eq!(config.run.lower(), 7.5e-4);
        assert!(config.run.monitoring_enabled);
        assert_eq!(config.poll.interval_ms, 2500);
        assert_eq!(config.poll.tail_lines, 100);
        assert_eq!(
            config.alerts.mailer,
            MailerConfig::Smtp {
                host: "smtp.gmail.com".to_string(),
                port: 587
            }
        );
        assert_eq!(config.run.pointer_path(), PathBuf::from("./db_loc.txt"));
    }

    #[test]
    fn test_parse_full_file() {
        let config = Config::from_toml(
            r#"
            [run]
            number = "42"
            upper_threshold = 0.003
            lower_threshold = 0.001
            monitoring_enabled = false
            data_dir = "/var/anubis"
            pointer_file = "current.txt"

            [poll]
            interval_ms = 1000
            tail_lines = 50
            read_timeout_ms = 500
            stats_interval_seconds = 60

            [alerts]
            recipients = ["a@example.org", "b@example.org"]
            dispatch_timeout_seconds = 10

            [alerts.credentials]
            username = "lppcautomated"
            password = "secret"

            [alerts.mailer]
            backend = "smtp"
            host = "mail.example.org"
            port = 2525
            "#,
        )
        .unwrap();

        assert_eq!(config.run.number, "42");
        assert_eq!(config.run.lower(), 0.001);
        assert!(!config.run.monitoring_enabled);
        assert_eq!(
            config.run.pointer_path(),
            PathBuf::from("/var/anubis/current.txt")
        );
        assert_eq!(config.poll.settings().interval, Duration::from_secs(1));
        assert_eq!(config.poll.settings().read_timeout, Duration::from_millis(500));
        assert_eq!(config.alerts.recipients.len(), 2);
        assert_eq!(config.alerts.dispatch_timeout(), Duration::from_secs(10));
        assert_eq!(config.alerts.credentials.username, "lppcautomated");
        assert_eq!(
            config.alerts.mailer,
            MailerConfig::Smtp {
                host: "mail.example.org".to_string(),
                port: 2525
            }
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = Config::from_toml(
            r#"
            [run]
            upper_threshold = 0.004

            [alerts.mailer]
            backend = "smtp"
            "#,
        )
        .unwrap();

        assert_eq!(config.run.number, "notrun");
        assert_eq!(config.run.lower(), 0.002);
        assert_eq!(config.poll, PollConfig::default());
        assert_eq!(config.alerts.mailer, MailerConfig::default());
    }

    #[test]
    fn test_log_backend() {
        let config = Config::from_toml(
            r#"
            [alerts.mailer]
            backend = "log"
            "#,
        )
        .unwrap();

        assert_eq!(config.alerts.mailer, MailerConfig::Log);
    }

    #[test]
    fn test_unknown_backend_is_parse_error() {
        let result = Config::from_toml(
            r#"
            [alerts.mailer]
            backend = "carrier-pigeon"
            "#,
        );

        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validate_accepts_valid_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unordered_thresholds() {
        let mut config = valid_config();
        config.run.upper_threshold = 0.001;
        config.run.lower_threshold = Some(0.002);

        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_validate_rejects_non_finite_threshold() {
        let mut config = valid_config();
        config.run.upper_threshold = f64::NAN;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_interval_and_tail() {
        let mut config = valid_config();
        config.poll.interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.poll.tail_lines = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_recipients_when_monitoring() {
        let mut config = Config::default();
        assert!(config.validate().is_err());

        config.run.monitoring_enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_recipient() {
        let mut config = valid_config();
        config.alerts.recipients.push("not an email".to_string());

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("not an email"));
    }

    #[test]
    fn test_email_shape() {
        assert!(is_email_shaped("email@email.ch"));
        assert!(!is_email_shaped("email.ch"));
        assert!(!is_email_shaped("@email.ch"));
        assert!(!is_email_shaped("email@"));
        assert!(!is_email_shaped("a@b@c"));
        assert!(!is_email_shaped("a b@c.d"));
    }

    #[test]
    fn test_from_file_missing() {
        let result = Config::from_file(Path::new("/nonexistent/anubis.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError(_))));
    }

    #[test]
    fn test_from_file_invalid_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[run\nnumber = ").unwrap();

        let result = Config::from_file(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_from_file_valid() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[run]\nnumber = \"7\"\n\n[alerts]\nrecipients = [\"email@email.ch\"]"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.run.number, "7");
        assert_eq!(config.alerts.recipients, vec!["email@email.ch"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let config = valid_config();
        let text = toml::to_string(&config).unwrap();
        assert_eq!(Config::from_toml(&text).unwrap(), config);
    }
}
