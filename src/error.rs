//! Custom error types for the curve tracer.
//!
//! `CurveTraceError` is the single error type of the library. Using `thiserror`,
//! it gives every layer (serial transport, vendor drivers, supply stacks, heater
//! controller, sweep engine) one consistent way to report failures.
//!
//! ## Error Hierarchy
//!
//! - **`CommunicationTimeout`**: a device did not answer after the bounded number of
//!   retries. Fatal for the device at connect time, aborts a running sweep.
//! - **`UnknownModel`**: the identification string is not in the model table of the
//!   selected command set.
//! - **`InvalidResponse`**: the device answered, but the answer could not be parsed.
//! - **`ConfigurationInconsistent`**: the test configuration cannot be run at all
//!   (no supply configured, two variable idle supplies, ...).
//! - **`Cancelled`**: the user interrupted the run.
//! - **`Io`**, **`Serial`**, **`Modbus`**, **`Config`**: wrapped errors from the
//!   underlying crates.
//!
//! Settle timeouts and repeated limiter hits are not errors: they are reported through
//! `SettleOutcome` and sweep control flow, and only logged.

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, CurveTraceError>;

/// Errors raised by drivers, supplies, the heater controller and the sweep engine.
#[derive(Error, Debug)]
pub enum CurveTraceError {
    #[error("{device} did not respond to '{command}' after {attempts} attempt(s)")]
    CommunicationTimeout {
        device: String,
        command: String,
        attempts: u32,
    },

    #[error("Unknown {vendor} power supply model: '{model}'")]
    UnknownModel { vendor: &'static str, model: String },

    #[error("Invalid response from {device}: '{response}'")]
    InvalidResponse { device: String, response: String },

    #[error("Inconsistent configuration: {0}")]
    ConfigurationInconsistent(String),

    #[error("Run cancelled by user")]
    Cancelled,

    #[error("Device not connected: {0}")]
    NotConnected(String),

    #[error("Heater controller error: {0}")]
    Heater(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("Modbus protocol error: {0}")]
    Modbus(rmodbus::ErrorKind),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),
}

impl From<rmodbus::ErrorKind> for CurveTraceError {
    fn from(err: rmodbus::ErrorKind) -> Self {
        CurveTraceError::Modbus(err)
    }
}

impl From<figment::Error> for CurveTraceError {
    fn from(err: figment::Error) -> Self {
        CurveTraceError::Config(Box::new(err))
    }
}

impl CurveTraceError {
    /// Shorthand for an `InvalidResponse` error.
    pub fn invalid_response(device: impl Into<String>, response: impl Into<String>) -> Self {
        CurveTraceError::InvalidResponse {
            device: device.into(),
            response: response.into(),
        }
    }

    /// Whether this error must abort a running sweep.
    ///
    /// Every error that reaches the sweep engine aborts the run, except parse errors
    /// of a single reply, which the driver retry loops already absorb.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CurveTraceError::InvalidResponse { .. })
    }
}
