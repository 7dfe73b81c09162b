//! Error types for each external boundary of the monitor.
//!
//! Only [`ConfigError`] is ever fatal. The others are logged by the component
//! that hits them and the run carries on.

use std::path::PathBuf;

/// A sensor could not be read.
#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    /// The sensor is present but returned no usable value.
    #[error("sensor {sensor} unavailable: {reason}")]
    Unavailable {
        /// Which reading failed.
        sensor: &'static str,
        /// Why.
        reason: String,
    },
}

/// A sink failed to persist or forward an observation.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Local file I/O failed.
    #[error("log file write failed: {0}")]
    Io(#[from] std::io::Error),

    /// The HTTP request could not be completed.
    #[error("time-series request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("time-series store rejected request with status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The response body could not be decoded.
    #[error("could not decode time-series response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// The final notification could not be delivered.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// No transport credentials were supplied.
    #[error("notification transport not configured")]
    NotConfigured,

    /// The HTTP request could not be completed.
    #[error("notification request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The transport answered with a non-success status.
    #[error("notification rejected with status {0}")]
    Rejected(u16),
}

/// Startup configuration is unusable.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A configuration value could not be parsed or is out of range.
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        /// Configuration key (environment variable name).
        key: &'static str,
        /// The offending raw value.
        value: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The directory holding the log file could not be created.
    #[error("cannot create log directory {path}: {source}")]
    LogDir {
        /// Directory we tried to create.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}
