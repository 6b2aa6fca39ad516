//! Per-model device constants.
//!
//! Every supported model is described by one row in its vendor's model table. The
//! row is turned into a [`DeviceSpec`] once the device has identified itself.

use crate::error::{AppResult, CurveTraceError};
use std::time::Duration;

/// Immutable operating envelope and resolution of one power supply model.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSpec {
    /// Lowest programmable voltage (V)
    pub v_min: f64,
    /// Highest programmable voltage (V)
    pub v_max: f64,
    /// Highest programmable current (A)
    pub i_max: f64,
    /// Maximum output power (W)
    pub p_max: f64,
    /// Voltage setpoint resolution (V)
    pub v_res_set: f64,
    /// Current setpoint resolution (A)
    pub i_res_set: f64,
    /// Voltage readback resolution (V)
    pub v_res_read: f64,
    /// Current readback resolution (A)
    pub i_res_read: f64,
    /// Largest expected deviation of the voltage readback from the setpoint (V)
    pub v_offset_max: f64,
    /// Largest expected deviation of the current readback from the setpoint (A)
    pub i_offset_max: f64,
    /// Time allowed for the output to settle after a setpoint change
    pub max_settle: Duration,
    /// Pause between two consecutive readback polls
    pub read_idle: Duration,
}

/// One row of a vendor model table.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SpecRow {
    pub model: &'static str,
    /// VMIN, VMAX, IMAX, PMAX
    pub limits: [f64; 4],
    /// voltage / current set resolution
    pub set_res: [f64; 2],
    /// voltage / current read resolution
    pub read_res: [f64; 2],
    /// voltage / current offset margins
    pub offsets: [f64; 2],
    pub settle_ms: u64,
}

impl SpecRow {
    pub(crate) fn to_spec(self, read_idle: Duration) -> DeviceSpec {
        let [v_min, v_max, i_max, p_max] = self.limits;
        DeviceSpec {
            v_min,
            v_max,
            i_max,
            p_max,
            v_res_set: self.set_res[0],
            i_res_set: self.set_res[1],
            v_res_read: self.read_res[0],
            i_res_read: self.read_res[1],
            v_offset_max: self.offsets[0],
            i_offset_max: self.offsets[1],
            max_settle: Duration::from_millis(self.settle_ms),
            read_idle,
        }
    }
}

/// Find `model` in a vendor table.
pub(crate) fn lookup(
    vendor: &'static str,
    table: &'static [SpecRow],
    model: &str,
) -> AppResult<&'static SpecRow> {
    table
        .iter()
        .find(|row| row.model == model)
        .ok_or_else(|| CurveTraceError::UnknownModel {
            vendor,
            model: model.to_string(),
        })
}

impl DeviceSpec {
    /// Clamp and round a voltage request to what the device can be programmed to.
    pub fn quantize_voltage(&self, volts: f64) -> f64 {
        quantize(volts, self.v_res_set, self.v_min, self.v_max)
    }

    /// Clamp and round a current request to what the device can be programmed to.
    pub fn quantize_current(&self, amps: f64) -> f64 {
        quantize(amps, self.i_res_set, 0.0, self.i_max)
    }

    /// Decimals needed to print a voltage setpoint at full resolution.
    pub fn voltage_decimals(&self) -> usize {
        decimals_for(self.v_res_set)
    }

    /// Decimals needed to print a current setpoint at full resolution.
    pub fn current_decimals(&self) -> usize {
        decimals_for(self.i_res_set)
    }
}

/// Round `value` to a multiple of `resolution`, then clamp it to `[min, max]`.
pub fn quantize(value: f64, resolution: f64, min: f64, max: f64) -> f64 {
    let rounded = if resolution > 0.0 {
        (value / resolution).round() * resolution
    } else {
        value
    };
    rounded.clamp(min, max)
}

/// Number of decimals that resolve `resolution`, i.e. `ceil(-log10(resolution))`.
pub fn decimals_for(resolution: f64) -> usize {
    if !(resolution > 0.0) || resolution >= 1.0 {
        return 0;
    }
    // guard against log10(0.001) landing a hair above -3
    (-resolution.log10() - 1e-9).ceil() as usize
}
