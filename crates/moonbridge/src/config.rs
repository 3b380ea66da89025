//! Configuration file parsing and structures.
//!
//! The bridge is configured with a single TOML file: one `[printer]`
//! section per bridge instance plus an optional `[logging]` section. The
//! host framework owns *when* the bridge runs; this file only describes
//! *what* it talks to.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::LevelFilter;

use crate::error::ConfigError;

/// Top-level configuration structure
#[derive(Debug, Deserialize)]
pub struct Config {
    pub printer: PrinterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

/// Which transport keeps the printer state fresh.
///
/// `Poll` issues full-snapshot queries whenever the host scheduler calls
/// the refresh entrypoint. `Socket` holds a websocket open and applies
/// field-level deltas as they are pushed.
#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Poll,
    Socket,
}

fn default_port() -> u16 {
    7125
}

fn default_poll_interval() -> u64 {
    60
}

fn default_extruders() -> Vec<String> {
    vec!["extruder".to_string()]
}

/// One printer endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct PrinterConfig {
    /// Human-readable printer name; slugified into the device identifier
    pub name: String,

    /// Hostname or IP address of the Moonraker instance
    pub host: String,

    /// Moonraker port (default: 7125)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Use https/wss instead of http/ws
    #[serde(default)]
    pub ssl: bool,

    /// Poll over HTTP or subscribe over the websocket
    #[serde(default)]
    pub mode: TransportMode,

    /// Poll cadence hint for the host scheduler, in seconds.
    /// The bridge never schedules its own refreshes.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Printer-side extruder object names (multi-extruder setups list
    /// "extruder", "extruder1", ...)
    #[serde(default = "default_extruders")]
    pub extruders: Vec<String>,

    /// Accepted but not transmitted: Moonraker's default websocket has no
    /// authentication field in the identify call this bridge issues.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,

    /// URL of the hosting instance, reported in the identify handshake
    #[serde(default)]
    pub instance_url: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        let config: Config = toml::from_str(&contents)?;
        config.printer.validate()?;
        Ok(config)
    }
}

impl PrinterConfig {
    /// Semantic validation, run once before the coordinator is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("printer host must not be empty".into()));
        }
        if self.host.contains(['/', '?', '#']) {
            return Err(ConfigError::Invalid(format!(
                "printer host `{}` must be a bare hostname or address",
                self.host
            )));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("printer port must not be 0".into()));
        }
        if self.extruders.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one extruder object name is required".into(),
            ));
        }
        Ok(())
    }

    /// Base URL for HTTP requests, without a trailing slash.
    pub fn base_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    /// Websocket endpoint URL.
    pub fn ws_url(&self) -> String {
        let scheme = if self.ssl { "wss" } else { "ws" };
        format!("{}://{}:{}/websocket", scheme, self.host, self.port)
    }

    /// Stable device identifier derived from the configured name.
    pub fn printer_id(&self) -> String {
        crate::bindings::slugify(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [printer]
            name = "Voron 2.4"
            host = "192.168.10.16"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        config.printer.validate().unwrap();
        assert_eq!(config.printer.port, 7125);
        assert_eq!(config.printer.mode, TransportMode::Poll);
        assert_eq!(config.printer.poll_interval_secs, 60);
        assert_eq!(config.printer.extruders, vec!["extruder".to_string()]);
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.printer.printer_id(), "voron_2_4");
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [printer]
            name = "trident"
            host = "printer.local"
            port = 443
            ssl = true
            mode = "socket"
            poll_interval_secs = 30
            extruders = ["extruder", "extruder1"]
            username = "me"
            password = "secret"

            [logging]
            level = "debug"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        config.printer.validate().unwrap();
        assert_eq!(config.printer.mode, TransportMode::Socket);
        assert_eq!(config.printer.base_url(), "https://printer.local:443");
        assert_eq!(config.printer.ws_url(), "wss://printer.local:443/websocket");
        assert_eq!(config.printer.extruders.len(), 2);
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn test_validate_rejects_empty_host() {
        let toml = r#"
            [printer]
            name = "p"
            host = ""
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert!(matches!(
            config.printer.validate(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_validate_rejects_host_with_path() {
        let toml = r#"
            [printer]
            name = "p"
            host = "printer.local/api"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.printer.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_no_extruders() {
        let toml = r#"
            [printer]
            name = "p"
            host = "printer.local"
            extruders = []
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.printer.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [printer]
            name = "bench printer"
            host = "127.0.0.1"
            port = 7125
        "#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.printer.base_url(), "http://127.0.0.1:7125");
    }

    #[test]
    fn test_from_file_missing() {
        let err = Config::from_file("/nonexistent/moonbridge.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_, _)));
    }
}
