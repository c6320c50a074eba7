//! Custom error types for the application.
//!
//! This module defines the primary error type, `UrtsError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures that can occur while driving shades, from serial link problems to
//! rejected calibration input.
//!
//! ## Error Hierarchy
//!
//! - **`Transport`**: connect or write failure on the serial link. Already retried
//!   locally by the transport before it surfaces here.
//! - **`Calibration`**: an invalid travel time (non-numeric or outside `[0, 60]`).
//!   No state is changed.
//! - **`PositionUnknown`**: a relative move was requested before the shade has a
//!   position baseline. No hardware command is sent.
//! - **`UnknownAddress`** / **`InvalidCommand`**: malformed supervisor input.
//! - **`Config`** / **`Configuration`**: configuration parse and validation errors,
//!   only raised at startup.
//!
//! None of these are fatal to the process. A malfunctioning shade or an unplugged
//! cable is reported to the immediate caller and everything else keeps running.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, UrtsError>;

/// Primary error type for the shade controller.
#[derive(Error, Debug)]
pub enum UrtsError {
    /// Serial connect or write failed after all retries.
    #[error("Serial transport error: {0}")]
    Transport(String),

    /// Travel time rejected.
    #[error("Invalid travel time: {0}")]
    Calibration(String),

    /// Relative move without a known baseline.
    #[error("{command} received on {address} but current shade position is not known")]
    PositionUnknown {
        /// Shade the command was addressed to
        address: String,
        /// Command that was rejected
        command: &'static str,
    },

    /// No shade registered under this address.
    #[error("Unknown channel address: {0}")]
    UnknownAddress(String),

    /// Supervisor command could not be parsed.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Raw I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UrtsError {
    /// Whether the caller may retry the operation later.
    ///
    /// Configuration errors need an edited file and a restart; everything else
    /// can succeed on a later attempt (cable replugged, position learned, etc.).
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Config(_) | Self::Configuration(_))
    }
}

impl From<figment::Error> for UrtsError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}
