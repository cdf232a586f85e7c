//! Thin wrapper around `slog`/`sloggers`, re-exporting the macros so call
//! sites read exactly like `logging::debug!(self.log, "msg"; "k" => v)`.

pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use serde::{Deserialize, Serialize};
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Minimal logging configuration, loaded from the fleet config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub struct LogConfig {
    pub level: LogLevel,
}

impl Default for LogConfig {
    fn default() -> LogConfig {
        LogConfig {
            level: LogLevel::Debug,
        }
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl From<LogLevel> for Severity {
    fn from(level: LogLevel) -> Severity {
        match level {
            LogLevel::Trace => Severity::Trace,
            LogLevel::Debug => Severity::Debug,
            LogLevel::Info => Severity::Info,
            LogLevel::Warning => Severity::Warning,
            LogLevel::Error => Severity::Error,
            LogLevel::Critical => Severity::Critical,
        }
    }
}

/// Builds the process-wide root logger. Every long-lived component attaches
/// a child logger via `log.new(o!(...))` rather than logging on the root
/// directly, so structured fields (bot name, channel id) don't need to be
/// repeated at every call site.
pub fn init(config: &LogConfig) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(config.level.into());
    builder.destination(Destination::Stderr);

    builder
        .build()
        .expect("terminal logger configuration is always valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_level_is_debug() {
        assert!(matches!(LogConfig::default().level, LogLevel::Debug));
    }

    #[test]
    fn init_does_not_panic() {
        let _ = init(&LogConfig::default());
    }
}
