//! Mapper options and the per-mapper logging gate.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{debug, error, info, warn};

/// Verbosity of the mapper's logging gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, thiserror::Error)]
#[error("unrecognized log level {0:?}")]
pub struct ParseLogLevelError(String);

impl FromStr for LogLevel {
    type Err = ParseLogLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(ParseLogLevelError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LoggingOptions {
    /// Turns on structured logging of warnings/errors.
    pub enabled: bool,
    pub log_level: LogLevel,
}

/// Recognized mapper options.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MapOptions {
    pub logging: LoggingOptions,
}

/// Emission goes through `tracing`, but only when the mapper was
/// configured with logging enabled and at or above the configured level.
/// Installing a subscriber is the embedding application's business.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Logger {
    enabled: bool,
    level: LogLevel,
}

impl Logger {
    pub(crate) fn disabled() -> Self {
        Self { enabled: false, level: LogLevel::Info }
    }

    pub(crate) fn new(options: LoggingOptions) -> Self {
        Self { enabled: options.enabled, level: options.log_level }
    }

    fn on(&self, level: LogLevel) -> bool {
        self.enabled && level >= self.level
    }

    pub(crate) fn debug(&self, msg: &str) {
        if self.on(LogLevel::Debug) {
            debug!("{}", msg);
        }
    }

    pub(crate) fn info(&self, msg: &str) {
        if self.on(LogLevel::Info) {
            info!("{}", msg);
        }
    }

    pub(crate) fn warn(&self, msg: &str) {
        if self.on(LogLevel::Warn) {
            warn!("{}", msg);
        }
    }

    pub(crate) fn error(&self, msg: &str) {
        if self.on(LogLevel::Error) {
            error!("{}", msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_case_insensitively() {
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn gate_respects_level_ordering() {
        let log = Logger::new(LoggingOptions { enabled: true, log_level: LogLevel::Warn });
        assert!(log.on(LogLevel::Error));
        assert!(log.on(LogLevel::Warn));
        assert!(!log.on(LogLevel::Info));
        assert!(!Logger::disabled().on(LogLevel::Error));
    }
}
