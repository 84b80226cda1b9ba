//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failures that occur while driving the spectrometer, from
//! configuration problems to instrument timeouts and a laser that refuses to lock.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment` while loading or extracting settings.
//! - **`Configuration`**: Semantic errors in otherwise well-formed settings, such as a
//!   GPIB resource without a configured gateway.
//! - **`Io`**: Wraps `std::io::Error` for sockets, serial ports and files.
//! - **`Timeout`**: An instrument did not answer in time. These are considered
//!   transient and are retried by the acquisition sequencer.
//! - **`Instrument`** / **`Parse`** / **`OutOfRange`**: Driver level failures.
//! - **`LockFailed`**: The piezo lock did not reach its setpoint within the acquisition
//!   timeout.
//! - **`Storage`** / **`OutputExists`** / **`Serialization`**: Session recorder failures.
//! - **`FeatureNotEnabled`**: Functionality that was compiled out via feature flags.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types with
//! the `?` operator.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors produced by the acquisition system.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Settings could not be loaded or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Settings were loaded but are not usable.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation did not complete in time.
    #[error("Timed out after {after:?} waiting for {operation}")]
    Timeout {
        /// What was being waited on (usually the command sent).
        operation: String,
        /// How long we waited.
        after: Duration,
    },

    /// Generic instrument failure.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// An instrument answered with something we could not interpret.
    #[error("Unexpected response to '{command}': '{response}'")]
    Parse {
        /// Command that produced the response.
        command: String,
        /// Raw response text.
        response: String,
    },

    /// A set-point was rejected before it reached the hardware.
    #[error("{parameter} = {value} is outside the allowed range [{min}, {max}]")]
    OutOfRange {
        /// Name of the parameter.
        parameter: &'static str,
        /// Rejected value.
        value: f64,
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },

    /// The frequency lock gave up.
    #[error("Failed to lock laser to {setpoint_ghz:.6} GHz within {elapsed:?}")]
    LockFailed {
        /// Lock setpoint.
        setpoint_ghz: f64,
        /// Time spent trying.
        elapsed: Duration,
    },

    /// Session recorder failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Refusing to overwrite an existing data file.
    #[error("Output file {0} already exists, pick a different filename")]
    OutputExists(PathBuf),

    /// Metadata could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Functionality excluded at compile time.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// The operation was cancelled by the operator.
    #[error("Operation cancelled")]
    Cancelled,

    /// One or more instruments failed to shut down cleanly.
    #[error("Shutdown failed with {} error(s)", .0.len())]
    ShutdownFailed(Vec<DaqError>),
}

impl DaqError {
    /// Whether retrying the same operation could reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DaqError::Timeout { .. } => true,
            DaqError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Shorthand for a [`DaqError::Parse`].
    pub fn parse(command: impl Into<String>, response: impl Into<String>) -> Self {
        DaqError::Parse {
            command: command.into(),
            response: response.into(),
        }
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

impl From<serde_json::Error> for DaqError {
    fn from(value: serde_json::Error) -> Self {
        DaqError::Serialization(value.to_string())
    }
}
