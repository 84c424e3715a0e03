//! MumbleChat Logging
//!
//! `tracing-subscriber` setup shared by the daemon and CLI.
//!
//! The filter comes from `RUST_LOG` when set, otherwise
//! `info,mumblechat=<level>`.

use std::fmt;
use std::fs::OpenOptions;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use thiserror::Error;
use tracing_subscriber::{fmt as tfmt, prelude::*, EnvFilter};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("A global subscriber is already installed")]
    AlreadyInitialized,

    #[error("Failed to open log file: {0}")]
    File(#[from] std::io::Error),

    #[error("Unknown log level: {0}")]
    UnknownLevel(String),
}

pub type Result<T> = std::result::Result<T, LoggingError>;

/// Verbosity for MumbleChat targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// `-v` count to level: 0 → info, 1 → debug, 2+ → trace
    pub fn from_verbosity(count: u8) -> Self {
        match count {
            0 => LogLevel::Info,
            1 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::UnknownLevel(s.to_string())),
        }
    }
}

/// Default directive string when `RUST_LOG` is unset
pub fn default_directives(level: LogLevel) -> String {
    format!("info,mumblechat={}", level)
}

fn build_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(level)))
}

/// Install the global subscriber, ignoring a second call
pub fn init(level: LogLevel) {
    let _ = try_init(level);
}

/// Install the global subscriber writing to stderr
pub fn try_init(level: LogLevel) -> Result<()> {
    tracing_subscriber::registry()
        .with(tfmt::layer().with_writer(std::io::stderr))
        .with(build_filter(level))
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)
}

/// Install the global subscriber writing to stderr and appending to `path`
pub fn try_init_with_file(level: LogLevel, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;

    tracing_subscriber::registry()
        .with(tfmt::layer().with_writer(std::io::stderr))
        .with(
            tfmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .with(build_filter(level))
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parse() {
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_verbosity_mapping() {
        assert_eq!(LogLevel::from_verbosity(0), LogLevel::Info);
        assert_eq!(LogLevel::from_verbosity(1), LogLevel::Debug);
        assert_eq!(LogLevel::from_verbosity(5), LogLevel::Trace);
    }

    #[test]
    fn test_default_directives() {
        assert_eq!(default_directives(LogLevel::Debug), "info,mumblechat=debug");
    }

    #[test]
    fn test_second_init_fails() {
        init(LogLevel::Info);
        assert!(matches!(
            try_init(LogLevel::Info),
            Err(LoggingError::AlreadyInitialized)
        ));
    }
}
