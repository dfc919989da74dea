//! Custom error types for the logger.
//!
//! `LoggerError` is the single error type of the library. It follows the
//! failure classes of a logging run:
//!
//! - **`Config`**: the configuration sources could not be read or extracted
//!   (missing file, bad TOML, wrong types).
//! - **`Configuration`**: the configuration parsed but is semantically wrong
//!   (degenerate calibration domain, channel without a calibration record,
//!   duplicate channel ids). Always fatal before any device interaction.
//! - **`DeviceUnavailable`**: no acquisition device could be found or
//!   connected. Fatal; output streams are never opened in this case.
//! - **`Producer`**: the acquisition device reported a fault while scanning.
//!   Fatal to the run; rows already written stay valid.
//! - **`TransientRead`**: one poll returned something unusable (cursor out of
//!   range, non-finite slot value). The consumer skips the poll and retries.
//! - **`Storage`**: the positional CSV contract was violated (row before
//!   header, header twice, column count mismatch).
//! - **`Csv`** / **`Io`**: wrapped library errors from the writers and the
//!   filesystem.
//!
//! Cancellation by the operator is not an error and has no variant here.

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, LoggerError>;

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Producer fault: {0}")]
    Producer(String),

    #[error("Transient read anomaly: {0}")]
    TransientRead(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for LoggerError {
    fn from(err: figment::Error) -> Self {
        LoggerError::Config(Box::new(err))
    }
}

impl LoggerError {
    /// Whether the consumer may skip the current poll and keep running.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientRead(_))
    }

    /// Whether this error belongs to start-up configuration.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Configuration(_))
    }
}
