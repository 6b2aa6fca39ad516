//! # PSU Curve Tracer Library
//!
//! Records current/voltage characteristics of two- and three-terminal devices with
//! programmable bench power supplies. PSU1 sweeps the primary terminal (collector,
//! drain, anode) in an inner loop, PSU2 the control terminal (base, gate) in an outer
//! loop. An optional heater block holds the device at a set temperature.
//!
//! ## Crate Structure
//!
//! - **`config`**: tester and DUT configuration, loaded with `figment` from TOML.
//! - **`error`**: the `CurveTraceError` enum shared by every layer.
//! - **`error_recovery`**: bounded retry policies of the serial drivers.
//! - **`hardware`**: serial transport, vendor command sets, the DS18B20 sensor and
//!   simulated devices.
//! - **`supply`**: logical supplies (stacked units, calibration, settle detection).
//! - **`heater`**: the heater block PID controller task.
//! - **`experiment`**: test profiles, idle regulation, the sweep engine, data file
//!   and plotting outputs.
//! - **`tracing_setup`**: structured logging initialisation.

pub mod config;
pub mod error;
pub mod error_recovery;
pub mod experiment;
pub mod hardware;
pub mod heater;
pub mod supply;
pub mod tracing_setup;

pub use error::{AppResult, CurveTraceError};
