//! Participant configuration
//!
//! Settings come from defaults, a TOML file, or `MPGREET_<SECTION>_<KEY>`
//! environment variables. Every loader validates before returning.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

use crate::core_async::Intervals;
use crate::core_greet::PROTOCOL_VERSION;
use crate::logging::LogLevel;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub protocol: ProtocolConfig,
    pub monitor: MonitorConfig,
    pub logging: LoggingConfig,
}

/// Wire and state machine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Version byte written into every packet; must match this build
    pub version: u8,

    /// Coerce illegal greet type transitions to a legal type instead of failing
    pub silence_illegal_greet_types: bool,
}

/// Schedule of delivery rounds while an operation is in flight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Delay between rounds
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Rounds before giving up on an operation that has not settled
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    pub json_format: bool,

    pub with_timestamp: bool,

    pub with_target: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self { version: PROTOCOL_VERSION, silence_illegal_greet_types: false }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { interval: Duration::from_millis(10), attempts: 64 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

impl MonitorConfig {
    /// Express the retry schedule as monitor delays counted in `tick`s
    ///
    /// Intervals shorter than one tick round up to a single tick.
    pub fn intervals(&self, tick: Duration) -> Intervals {
        let tick_ms = tick.as_millis().max(1);
        let ticks = (self.interval.as_millis() / tick_ms).max(1);
        let ticks = u64::try_from(ticks).unwrap_or(u64::MAX);
        Intervals::sequence(std::iter::repeat(ticks).take(self.attempts as usize))
    }
}

fn parse_var<T>(name: &str, what: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(format!("Invalid {}: {}", what, e))),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Variables follow the pattern `MPGREET_<SECTION>_<KEY>`, for example
    /// `MPGREET_MONITOR_INTERVAL=500ms` or `MPGREET_LOGGING_LEVEL=debug`.
    ///
    /// # Errors
    ///
    /// `InvalidValue` for unparsable variables, `ValidationFailed` if the
    /// result does not validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(version) = parse_var("MPGREET_PROTOCOL_VERSION", "protocol version")? {
            config.protocol.version = version;
        }
        if let Some(silence) =
            parse_var("MPGREET_PROTOCOL_SILENCE_ILLEGAL_GREET_TYPES", "silence flag")?
        {
            config.protocol.silence_illegal_greet_types = silence;
        }

        if let Ok(interval) = env::var("MPGREET_MONITOR_INTERVAL") {
            config.monitor.interval = humantime_serde::re::humantime::parse_duration(&interval)
                .map_err(|e| {
                    ConfigError::InvalidValue(format!("Invalid monitor interval: {}", e))
                })?;
        }
        if let Some(attempts) = parse_var("MPGREET_MONITOR_ATTEMPTS", "monitor attempts")? {
            config.monitor.attempts = attempts;
        }

        if let Ok(level) = env::var("MPGREET_LOGGING_LEVEL") {
            config.logging.level = level;
        }
        if let Some(json) = parse_var("MPGREET_LOGGING_JSON", "JSON flag")? {
            config.logging.json_format = json;
        }
        if let Some(timestamps) = parse_var("MPGREET_LOGGING_TIMESTAMPS", "timestamp flag")? {
            config.logging.with_timestamp = timestamps;
        }
        if let Some(target) = parse_var("MPGREET_LOGGING_TARGET", "target flag")? {
            config.logging.with_target = target;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file; absent keys keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol.version != PROTOCOL_VERSION {
            return Err(ConfigError::ValidationFailed(format!(
                "protocol version {:#04x} is not supported (expected {:#04x})",
                self.protocol.version, PROTOCOL_VERSION
            )));
        }

        if self.monitor.interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "monitor interval must be greater than 0".to_string(),
            ));
        }
        if self.monitor.attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "monitor attempts must be greater than 0".to_string(),
            ));
        }

        if let Err(e) = self.logging.level.parse::<LogLevel>() {
            return Err(ConfigError::ValidationFailed(e.to_string()));
        }

        Ok(())
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }
}
