//! Error types for the exporter.
//!
//! Only the fatal class of failures ends up here. A query that fails for one
//! metric on one device is consumed by the capability state of that device
//! and never surfaces as an [`ExporterError`].

use std::io;
use thiserror::Error;

/// Error type for exporter operations.
#[derive(Debug, Error)]
pub enum ExporterError {
    /// The management library could not be initialized.
    #[error("failed to initialize the GPU management library: {0}")]
    BackendInit(String),

    /// No device could be enumerated, so there is nothing to collect.
    #[error("no GPU devices found, nothing to collect")]
    NoDevices,

    /// Configuration parsing error with line number.
    #[error("configuration error at line {line}: {message}")]
    ConfigParse {
        /// Line number where the error occurred (1-indexed).
        line: usize,
        /// Error message describing the issue.
        message: String,
    },

    /// Configuration file not found.
    #[error("configuration file not found: {0}")]
    ConfigNotFound(String),

    /// Invalid configuration value.
    #[error("invalid configuration value for '{key}': {message}")]
    ConfigInvalid {
        /// The configuration key with invalid value.
        key: String,
        /// Error message describing why the value is invalid.
        message: String,
    },

    /// One or more metric family names are not known.
    #[error("unknown metric name(s): {0}")]
    UnknownMetric(String),

    /// The log subscriber could not be installed.
    #[error("logging setup failed: {0}")]
    Logging(String),

    /// The HTTP endpoint failed.
    #[error("http server error: {0}")]
    Server(String),

    /// Underlying I/O error (log file, socket).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl ExporterError {
    /// Maps the error to the service-manager exit code the binary returns.
    ///
    /// Follows the SMF convention: 95 fatal, 96 configuration, 100
    /// permission, 101 temporarily disabled, 1 anything else.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::BackendInit(_) | Self::NoDevices => 101,
            Self::ConfigParse { .. }
            | Self::ConfigNotFound(_)
            | Self::ConfigInvalid { .. }
            | Self::UnknownMetric(_) => 96,
            Self::Io(e) if e.kind() == io::ErrorKind::PermissionDenied => 100,
            Self::Logging(_) => 95,
            Self::Server(_) | Self::Io(_) => 1,
        }
    }
}

/// Result type alias for exporter operations.
pub type Result<T> = std::result::Result<T, ExporterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parse_error_includes_line_number() {
        let err = ExporterError::ConfigParse { line: 42, message: "invalid value".to_string() };
        let display = err.to_string();

        assert!(display.contains("42"), "Error should include line number: {}", display);
        assert!(display.contains("invalid value"), "Error should include message: {}", display);
    }

    #[test]
    fn test_unknown_metric_lists_names() {
        let err = ExporterError::UnknownMetric("fans, clocks".to_string());
        let display = err.to_string();

        assert!(display.contains("fans, clocks"), "Error should list names: {}", display);
    }

    #[test]
    fn test_no_devices_message() {
        let display = ExporterError::NoDevices.to_string();
        assert!(display.contains("nothing to collect"), "Unexpected message: {}", display);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: ExporterError = io_err.into();

        assert!(matches!(err, ExporterError::Io(_)), "Should convert to Io");
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExporterError::NoDevices.exit_code(), 101);
        assert_eq!(ExporterError::BackendInit("x".into()).exit_code(), 101);
        assert_eq!(ExporterError::UnknownMetric("x".into()).exit_code(), 96);
        assert_eq!(ExporterError::ConfigNotFound("/etc/nvmex.yaml".into()).exit_code(), 96);
        assert_eq!(ExporterError::Server("bind".into()).exit_code(), 1);

        let denied: ExporterError = io::Error::new(io::ErrorKind::PermissionDenied, "no").into();
        assert_eq!(denied.exit_code(), 100);
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ExporterError>();
    }
}
