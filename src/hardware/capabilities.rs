//! Power supply capabilities
//!
//! Every supported command set implements [`ProtocolDriver`]. The trait is the only
//! thing the supply stack, the heater controller and the sweep engine know about a
//! physical unit. The concrete driver is picked once at connect time
//! (see [`crate::hardware::connect_unit`]) and used through `Box<dyn ProtocolDriver>`.
//!
//! # Design Philosophy
//!
//! - Async (uses #[async_trait])
//! - `&mut self`: a unit has exactly one owner, so no interior locking is needed
//! - Uses [`AppResult`] so callers can tell timeouts from unknown models
//! - Setpoints are clamped and rounded by the driver, never rejected

use crate::error::AppResult;
use crate::hardware::device_spec::DeviceSpec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which setpoint is currently clamping the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimiterMode {
    /// Output voltage follows the voltage setpoint
    ConstantVoltage,
    /// Output current is clamped at the current limit
    ConstantCurrent,
    /// No limit has been commanded yet, or the device cannot tell
    Unknown,
}

impl fmt::Display for LimiterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterMode::ConstantVoltage => write!(f, "CV"),
            LimiterMode::ConstantCurrent => write!(f, "CC"),
            LimiterMode::Unknown => write!(f, "??"),
        }
    }
}

/// One voltage/current readback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Output voltage (V)
    pub voltage: f64,
    /// Output current (A)
    pub current: f64,
    /// Active limiter
    pub limiter: LimiterMode,
}

impl Reading {
    /// Create a reading.
    pub fn new(voltage: f64, current: f64, limiter: LimiterMode) -> Self {
        Self {
            voltage,
            current,
            limiter,
        }
    }

    /// Whether the current limiter is active.
    pub fn is_current_limited(&self) -> bool {
        self.limiter == LimiterMode::ConstantCurrent
    }
}

/// Thresholds of the CV/CC inference used by devices without a status register.
///
/// The thresholds were tuned empirically per model, so they are configurable per unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimiterMargins {
    /// Distance below the current limit that still counts as "at the limit" (A)
    pub current: f64,
    /// Distance below the voltage setpoint that counts as "dropped out of CV" (V)
    pub voltage: f64,
}

impl LimiterMargins {
    /// Read resolution plus offset margin of the model.
    pub fn for_spec(spec: &DeviceSpec) -> Self {
        Self {
            current: spec.i_res_read + spec.i_offset_max,
            voltage: spec.v_res_read + spec.v_offset_max,
        }
    }
}

/// Last setpoints sent to a unit.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Setpoints {
    /// Last voltage setpoint, as transmitted
    pub voltage: Option<f64>,
    /// Last current limit, as transmitted
    pub current: Option<f64>,
}

impl Setpoints {
    /// Infer the limiter mode from how close a readback is to the setpoints.
    ///
    /// CC if the current sits at the current limit while the voltage has dropped
    /// below its setpoint, CV otherwise. Unknown until both setpoints are known.
    pub fn infer_limiter(&self, voltage: f64, current: f64, margins: &LimiterMargins) -> LimiterMode {
        match (self.voltage, self.current) {
            (Some(v_set), Some(i_set)) => {
                if current >= i_set - margins.current && voltage < v_set - margins.voltage {
                    LimiterMode::ConstantCurrent
                } else {
                    LimiterMode::ConstantVoltage
                }
            }
            _ => LimiterMode::Unknown,
        }
    }
}

/// Uniform capability set of one physical power supply.
///
/// # Contract
/// - `set_voltage`/`set_current` clamp to the model envelope and round to the set
///   resolution before anything is transmitted; they return the transmitted value
/// - `read` returns raw (uncalibrated) values
/// - Every query is retried internally; exhaustion surfaces as
///   [`crate::error::CurveTraceError::CommunicationTimeout`]
#[async_trait]
pub trait ProtocolDriver: Send {
    /// Model identifier as resolved at connect time (e.g. "KWR103", "RD6012P_6A")
    fn model(&self) -> &str;

    /// Operating envelope of the connected model
    fn spec(&self) -> &DeviceSpec;

    /// Query the identification string and resolve it to a model identifier.
    ///
    /// # Errors
    /// - `CommunicationTimeout` if the device stays silent
    /// - `UnknownModel` if the device is not in the model table
    async fn identify(&mut self) -> AppResult<String>;

    /// Program the voltage setpoint.
    ///
    /// # Arguments
    /// * `volts` - Requested voltage, silently clamped and rounded
    ///
    /// # Returns
    /// The voltage that was actually transmitted.
    async fn set_voltage(&mut self, volts: f64) -> AppResult<f64>;

    /// Program the current limit.
    ///
    /// # Arguments
    /// * `amps` - Requested current limit, silently clamped and rounded
    ///
    /// # Returns
    /// The current that was actually transmitted.
    async fn set_current(&mut self, amps: f64) -> AppResult<f64>;

    /// Enable or disable the output.
    async fn set_output(&mut self, on: bool) -> AppResult<()>;

    /// Read the output voltage, current and limiter mode.
    async fn read(&mut self) -> AppResult<Reading>;
}
