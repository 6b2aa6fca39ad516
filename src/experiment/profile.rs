//! Test profiles and run settings.
//!
//! A [`TestProfile`] is the sweep description of one supply after it has been
//! checked against that supply's envelope. Values the supply cannot deliver are
//! adjusted (and logged), never rejected.

use super::point::Averaging;
use crate::config::TestProfileConfig;
use crate::hardware::device_spec::DeviceSpec;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Run-wide settings from the `[run]` table of the DUT file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    /// Sample name written to the data file header
    #[serde(default = "default_sample")]
    pub sample: String,
    /// Control resistor between PSU2 and the DUT (Ω), if any
    #[serde(default)]
    pub r2control: Option<f64>,
    /// Readings averaged per sweep point
    #[serde(default = "default_repeats")]
    pub repeats: usize,
    /// Idle time before each reading (s)
    #[serde(default)]
    pub idle_secs: f64,
    /// Pre-heat time before the sweep (s)
    #[serde(default)]
    pub preheat_secs: f64,
    /// Heater block target temperature (°C)
    #[serde(default)]
    pub t_target: Option<f64>,
    /// Heater block temperature tolerance (K)
    #[serde(default = "default_t_tolerance")]
    pub t_tolerance: f64,
    /// Pre-heat only, no sweep
    #[serde(default)]
    pub quick: bool,
    /// Reduction of repeated readings
    #[serde(default)]
    pub averaging: Averaging,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            sample: default_sample(),
            r2control: None,
            repeats: default_repeats(),
            idle_secs: 0.0,
            preheat_secs: 0.0,
            t_target: None,
            t_tolerance: default_t_tolerance(),
            quick: false,
            averaging: Averaging::default(),
        }
    }
}

fn default_sample() -> String {
    "sample".to_string()
}

fn default_repeats() -> usize {
    1
}

fn default_t_tolerance() -> f64 {
    0.5
}

impl RunSettings {
    /// Validate counts and durations.
    pub fn validate(&self) -> Result<(), String> {
        if self.repeats == 0 {
            return Err("repeats must be positive".into());
        }
        if self.idle_secs < 0.0 || self.preheat_secs < 0.0 {
            return Err("idle_secs and preheat_secs must not be negative".into());
        }
        if self.t_target.is_some() && !(self.t_tolerance > 0.0) {
            return Err("t_tolerance must be positive".into());
        }
        if self.sample.trim().is_empty() {
            return Err("sample name must not be empty".into());
        }
        Ok(())
    }

    /// Whether idle points are needed (idle between readings or pre-heat).
    pub fn needs_idle(&self) -> bool {
        self.idle_secs > 0.0 || self.preheat_secs > 0.0
    }
}

/// Idle operating point of one supply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdleProfile {
    /// Initial (or fixed) idle voltage (V)
    pub voltage: f64,
    /// Lower end of the regulation range (V)
    pub v_min: f64,
    /// Upper end of the regulation range (V)
    pub v_max: f64,
    /// Idle current (A)
    pub current: f64,
    /// Power limit while idling (W)
    pub p_limit: f64,
    /// DUT transconductance (A/V); only set for a regulated idle point
    pub transconductance: Option<f64>,
}

impl IdleProfile {
    /// Whether the idle voltage is regulated within `[v_min, v_max]`.
    pub fn is_variable(&self) -> bool {
        self.transconductance.is_some() && self.v_min < self.v_max
    }

    /// Clamp a regulated voltage to the idle range.
    pub fn clamp(&self, volts: f64) -> f64 {
        volts.clamp(self.v_min, self.v_max)
    }
}

/// Sweep description of one supply, checked against its envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct TestProfile {
    /// First voltage (V)
    pub v_start: f64,
    /// Last voltage (V)
    pub v_end: f64,
    /// Step size (V); 0 = single voltage
    pub v_step: f64,
    /// Current limit (A)
    pub i_limit: f64,
    /// Power limit (W)
    pub p_limit: f64,
    /// Output polarity (+1 / -1)
    pub polarity: i8,
    /// Idle operating point, if idle or pre-heat is used
    pub idle: Option<IdleProfile>,
    /// Consistent readings averaged per measurement
    pub num_readings: usize,
}

fn adjust(label: &str, what: &str, unit: &str, requested: f64, adjusted: f64) -> f64 {
    if (adjusted - requested).abs() > 1e-9 * requested.abs().max(1.0) {
        warn!("{}: adjusting {} from {} {} to {} {}", label, what, requested, unit, adjusted, unit);
    }
    adjusted
}

impl TestProfile {
    /// Check a configured profile against the supply envelope.
    ///
    /// # Arguments
    /// * `label` - supply label for log messages
    /// * `config` - profile as written in the DUT file
    /// * `env` - envelope of the supply
    /// * `wiring_polarity` - polarity of the tester wiring, used if the profile has none
    /// * `num_readings` - consistent readings per measurement
    /// * `needs_idle` - whether idle points are used by this run
    pub fn configure(
        label: &str,
        config: &TestProfileConfig,
        env: &DeviceSpec,
        wiring_polarity: i8,
        num_readings: usize,
        needs_idle: bool,
    ) -> Self {
        let clamp_v = |v: f64| v.clamp(env.v_min, env.v_max);
        let v_start = adjust(label, "start voltage", "V", config.v_start, clamp_v(config.v_start));
        let mut v_end = adjust(label, "end voltage", "V", config.v_end, clamp_v(config.v_end));

        let range = (v_end - v_start).abs();
        let v_step = if range < env.v_res_set {
            if range > 0.0 {
                warn!(
                    "{}: voltage range is less than the setting resolution, running at fixed voltage {} V",
                    label, v_start
                );
            }
            v_end = v_start;
            0.0
        } else {
            let mut step = config.v_step.abs().min(range).max(env.v_res_set);
            if env.v_res_set > 0.0 {
                step = (step / env.v_res_set).round() * env.v_res_set;
            }
            adjust(label, "voltage step", "V", config.v_step, step)
        };

        let i_limit = adjust(label, "current limit", "A", config.i_limit, config.i_limit.min(env.i_max));
        let p_limit = adjust(label, "power limit", "W", config.p_limit, config.p_limit.min(env.p_max));
        let polarity = match config.polarity.unwrap_or(wiring_polarity) {
            p if p < 0 => -1,
            _ => 1,
        };

        let idle = if needs_idle {
            Self::configure_idle(label, config, env, p_limit)
        } else {
            None
        };

        Self {
            v_start,
            v_end,
            v_step,
            i_limit,
            p_limit,
            polarity,
            idle,
            num_readings: num_readings.max(1),
        }
    }

    fn configure_idle(label: &str, config: &TestProfileConfig, env: &DeviceSpec, p_limit: f64) -> Option<IdleProfile> {
        let (Some(v_idle), Some(i_idle)) = (config.v_idle, config.i_idle) else {
            warn!("{}: no idle point configured, idle will keep this supply at its sweep start", label);
            return None;
        };
        let clamp_v = |v: f64| v.clamp(env.v_min, env.v_max);
        let voltage = adjust(label, "idle voltage", "V", v_idle, clamp_v(v_idle));
        let mut v_min = clamp_v(config.v_idle_min.unwrap_or(voltage));
        let mut v_max = clamp_v(config.v_idle_max.unwrap_or(voltage));
        if v_min > v_max {
            warn!("{}: idle voltage range is inverted, using fixed idle voltage {} V", label, voltage);
            v_min = voltage;
            v_max = voltage;
        }

        let p_idle = config.p_idle_limit.unwrap_or(p_limit);
        let p_idle = adjust(label, "idle power limit", "W", p_idle, p_idle.min(env.p_max));
        let mut current = adjust(label, "idle current", "A", i_idle, i_idle.min(env.i_max));
        if voltage * current > env.p_max && voltage > 0.0 {
            current = adjust(label, "idle current", "A", current, env.p_max / voltage);
        }

        let transconductance = match config.idle_gm {
            Some(gm) if gm > 0.0 && v_min < v_max => Some(gm),
            _ if v_min < v_max => {
                warn!(
                    "{}: idle voltage range needs a positive transconductance, using fixed idle voltage {} V",
                    label, voltage
                );
                v_min = voltage;
                v_max = voltage;
                None
            }
            _ => None,
        };

        Some(IdleProfile {
            voltage,
            v_min,
            v_max,
            current,
            p_limit: p_idle,
            transconductance,
        })
    }

    /// Current limit at `volts`: the configured limit, reduced so the power limit
    /// (and the supply PMAX) hold.
    pub fn current_limit_at(&self, volts: f64, p_max: f64) -> f64 {
        current_limit(self.i_limit, self.p_limit, p_max, volts)
    }
}

/// `min(i_limit, p_limit / V)`, capped by `p_max / V`; `i_limit` at V = 0.
pub fn current_limit(i_limit: f64, p_limit: f64, p_max: f64, volts: f64) -> f64 {
    let v = volts.abs();
    if v > 0.0 {
        i_limit.min(p_limit / v).min(p_max / v)
    } else {
        i_limit
    }
}

/// Voltages swept by one supply.
///
/// An arithmetic series from start toward end in either direction, including the
/// end value when the step divides the range. An unconfigured supply contributes
/// the single value 0.
pub fn voltage_steps(profile: Option<&TestProfile>, env: Option<&DeviceSpec>) -> Vec<f64> {
    let Some(p) = profile else {
        return vec![0.0];
    };
    if p.v_step <= 0.0 {
        return vec![p.v_start];
    }
    let direction = if p.v_end >= p.v_start { 1.0 } else { -1.0 };
    let (lo, hi) = (p.v_start.min(p.v_end), p.v_start.max(p.v_end));
    let count = ((hi - lo) / p.v_step + 1e-9).floor() as usize;
    (0..=count)
        .map(|k| p.v_start + direction * k as f64 * p.v_step)
        .filter(|v| *v >= lo - 1e-9 && *v <= hi + 1e-9)
        .filter(|v| env.map_or(true, |e| *v >= e.v_min - 1e-9 && *v <= e.v_max + 1e-9))
        .collect()
}
