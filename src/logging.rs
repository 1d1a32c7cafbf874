//! Log setup for the exporter.
//!
//! Output goes to stderr, or is appended to a log file. All other modules
//! log through the `tracing` macros and never touch the subscriber.

use crate::error::{ExporterError, Result};
use std::fmt;
use std::fs::OpenOptions;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing_subscriber::filter::LevelFilter;

/// Log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    /// Tracing entry/exit of scopes
    Trace,
    /// Debug information
    Debug,
    /// Informational messages
    #[default]
    Info,
    /// Warnings
    Warn,
    /// Errors
    Error,
    /// Fatal errors; logged at error level
    Fatal,
}

impl LogLevel {
    /// Returns the canonical upper-case name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        }
    }

    /// Maps onto the subscriber filter.
    #[must_use]
    pub fn filter(&self) -> LevelFilter {
        match self {
            Self::Trace => LevelFilter::TRACE,
            Self::Debug => LevelFilter::DEBUG,
            Self::Info => LevelFilter::INFO,
            Self::Warn => LevelFilter::WARN,
            Self::Error | Self::Fatal => LevelFilter::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ExporterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TRACE" => Ok(Self::Trace),
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" | "WARNING" => Ok(Self::Warn),
            "ERROR" => Ok(Self::Error),
            "FATAL" => Ok(Self::Fatal),
            _ => Err(ExporterError::ConfigInvalid {
                key: "log_level".to_string(),
                message: format!("unknown level '{s}'"),
            }),
        }
    }
}

/// Installs the global subscriber.
///
/// With `logfile` set, lines are appended to that file without ANSI colours.
///
/// # Errors
///
/// Returns [`ExporterError::Io`] if the file cannot be opened and
/// [`ExporterError::Logging`] if a subscriber is already installed.
pub fn init(level: LogLevel, logfile: Option<&Path>) -> Result<()> {
    let builder = tracing_subscriber::fmt().with_max_level(level.filter()).with_target(false);

    let installed = match logfile {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };

    installed.map_err(|e| ExporterError::Logging(e.to_string()))
}

/// RAII guard timing a scope.
///
/// Logs entry and exit at trace level. [`TimingGuard::finish`] hands out the
/// measured duration instead of only logging it.
pub struct TimingGuard {
    component: &'static str,
    start: Instant,
    done: bool,
}

impl TimingGuard {
    /// Starts timing `component`.
    pub fn new(component: &'static str) -> Self {
        tracing::trace!("-> {component}");
        Self { component, start: Instant::now(), done: false }
    }

    /// Stops the guard and returns the elapsed time.
    pub fn finish(mut self) -> Duration {
        let elapsed = self.start.elapsed();
        self.log_exit(elapsed);
        self.done = true;
        elapsed
    }

    fn log_exit(&self, elapsed: Duration) {
        tracing::trace!("<- {} ({:.2}ms)", self.component, elapsed.as_secs_f64() * 1000.0);
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        if !self.done {
            self.log_exit(self.start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parse_case_insensitive() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("Info".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!(" WARN ".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("fatal".parse::<LogLevel>().unwrap(), LogLevel::Fatal);
    }

    #[test]
    fn test_level_parse_rejects_unknown() {
        let err = "loud".parse::<LogLevel>().unwrap_err();
        assert!(err.to_string().contains("loud"), "Error should name the value: {}", err);
    }

    #[test]
    fn test_fatal_maps_to_error_filter() {
        assert_eq!(LogLevel::Fatal.filter(), LevelFilter::ERROR);
        assert_eq!(LogLevel::Trace.filter(), LevelFilter::TRACE);
    }

    #[test]
    fn test_level_display_roundtrip() {
        for level in [LogLevel::Trace, LogLevel::Debug, LogLevel::Info, LogLevel::Warn] {
            assert_eq!(level.to_string().parse::<LogLevel>().unwrap(), level);
        }
    }

    #[test]
    fn test_default_level_is_info() {
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn test_timing_guard_measures_time() {
        let guard = TimingGuard::new("test");
        std::thread::sleep(Duration::from_millis(5));
        let elapsed = guard.finish();
        assert!(elapsed >= Duration::from_millis(5), "elapsed too short: {elapsed:?}");
    }

    #[test]
    fn test_timing_guard_drop_without_finish() {
        let guard = TimingGuard::new("drop_test");
        assert_eq!(guard.component, "drop_test");
        assert!(!guard.done);
        drop(guard);
    }
}
