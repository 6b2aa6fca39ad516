//! Configuration System using Figment
//!
//! Two files describe a run:
//! 1. the tester configuration ([`TesterConfig`]): which power supplies are wired
//!    up as PSU1 / PSU2, how to reach them, their calibration, and the heater block
//! 2. the DUT configuration ([`DutConfig`]): sweep ranges, limits and idle points of
//!    the part under test
//!
//! The tester configuration is loaded from TOML and can be overridden with
//! environment variables prefixed `CURVETRACE_`, nested keys separated by `__`
//! (e.g. `CURVETRACE_APPLICATION__LOG_LEVEL=debug`).
//!
//! # Example
//! ```no_run
//! use psu_curvetrace::config::TesterConfig;
//!
//! let config = TesterConfig::load_from("config/tester.toml")?;
//! config.validate()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::experiment::profile::RunSettings;
use crate::hardware::capabilities::LimiterMargins;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Environment variable prefix of the tester configuration
pub const ENV_PREFIX: &str = "CURVETRACE_";

/// Tester hardware configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TesterConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Supply wired up as PSU1 (primary, inner sweep loop)
    #[serde(default)]
    pub psu1: Option<SupplyConfig>,
    /// Supply wired up as PSU2 (secondary, outer sweep loop)
    #[serde(default)]
    pub psu2: Option<SupplyConfig>,
    /// Temperature-controlled DUT mount
    #[serde(default)]
    pub heaterblock: Option<HeaterblockConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory data files are written to
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

/// Vendor command set of one physical unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandSet {
    /// KORAD / RND (KWR103)
    #[serde(rename = "KORAD", alias = "RND")]
    Korad,
    /// BK PRECISION 9185B / 9120A
    #[serde(rename = "BK")]
    BkPrecision,
    /// SALUKI / MAYNUO SPS8xx
    #[serde(rename = "SALUKI")]
    Saluki,
    /// VOLTCRAFT PPS
    #[serde(rename = "VOLTCRAFT")]
    Voltcraft,
    /// RIDEN RD60xx (Modbus RTU)
    #[serde(rename = "RIDEN")]
    Riden,
    /// Simulated supply, no hardware
    #[serde(rename = "SIMULATED")]
    Simulated,
}

impl fmt::Display for CommandSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandSet::Korad => "KORAD",
            CommandSet::BkPrecision => "BK",
            CommandSet::Saluki => "SALUKI",
            CommandSet::Voltcraft => "VOLTCRAFT",
            CommandSet::Riden => "RIDEN",
            CommandSet::Simulated => "SIMULATED",
        };
        write!(f, "{name}")
    }
}

/// One physical power supply unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitConfig {
    /// Serial port (e.g. "/dev/ttyUSB0"); ignored for SIMULATED units
    #[serde(default)]
    pub port: String,
    /// Command set spoken by the unit
    pub command_set: CommandSet,
    /// Baud rate override (RIDEN only; the others are fixed or probed)
    #[serde(default)]
    pub baud: Option<u32>,
    /// Vendor-specific mode: "HIGH"/"LOW" voltage range (BK 9185B) or current
    /// range (RIDEN RD6012P)
    #[serde(default)]
    pub mode: Option<String>,
    /// Calibration of the voltage setpoint, coefficients a0, a1, ...
    #[serde(default = "identity_poly")]
    pub v_set_calpoly: Vec<f64>,
    /// Calibration of the voltage readback
    #[serde(default = "identity_poly")]
    pub v_read_calpoly: Vec<f64>,
    /// Calibration of the current setpoint
    #[serde(default = "identity_poly")]
    pub i_set_calpoly: Vec<f64>,
    /// Calibration of the current readback
    #[serde(default = "identity_poly")]
    pub i_read_calpoly: Vec<f64>,
    /// CV/CC inference thresholds for units without a status register
    #[serde(default)]
    pub limiter_margins: Option<LimiterMargins>,
    /// Envelope and load of a SIMULATED unit
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Parameters of a simulated unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Maximum voltage (V)
    #[serde(default = "default_sim_v_max")]
    pub v_max: f64,
    /// Maximum current (A)
    #[serde(default = "default_sim_i_max")]
    pub i_max: f64,
    /// Load resistance (Ω); none = open terminals
    #[serde(default)]
    pub load_ohms: Option<f64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            v_max: default_sim_v_max(),
            i_max: default_sim_i_max(),
            load_ohms: None,
        }
    }
}

/// A logical supply: one unit, or several stacked in series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplyConfig {
    /// Units in stacking order
    pub units: Vec<UnitConfig>,
    /// Number of consistent readings required per measurement
    #[serde(default = "default_num_stable_readings")]
    pub num_stable_readings: usize,
    /// Output polarity of the wiring (+1 normal, -1 inverted); the DUT profile may override it
    #[serde(default = "default_polarity")]
    pub polarity: i8,
}

/// Heater block: a heater supply, a DS18B20 and the PID loop tying them together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaterblockConfig {
    /// Units of the heater supply
    pub units: Vec<UnitConfig>,
    /// Serial port of the one-wire adapter; "SIMULATED" for a simulated sensor
    pub sensor_port: String,
    /// ROM code of the sensor, if more than one device shares the bus
    #[serde(default)]
    pub sensor_rom: Option<String>,
    /// Heater resistance (Ω)
    pub heater_resistance: f64,
    /// Power ceiling (W); the supply's PMAX if unset
    #[serde(default)]
    pub max_power: Option<f64>,
    /// Proportional gain (W/K)
    pub kp: f64,
    /// Integral gain (W/(K·s))
    pub ki: f64,
    /// Derivative gain (W·s/K)
    #[serde(default)]
    pub kd: f64,
    /// Control loop period (ms)
    #[serde(default = "default_control_interval_ms")]
    pub control_interval_ms: u64,
    /// Minimum spacing of buffered temperature readings (s)
    #[serde(default = "default_buffer_interval_s")]
    pub buffer_interval_s: f64,
    /// Number of buffered readings that must be within tolerance
    #[serde(default = "default_buffer_len")]
    pub buffer_len: usize,
    /// Upper bound of one wait for a stable temperature (s)
    #[serde(default = "default_stable_timeout_s")]
    pub stable_timeout_s: f64,
    /// Upper bound of one wait for the one-wire bus (ms)
    #[serde(default = "default_bus_lock_timeout_ms")]
    pub bus_lock_timeout_ms: u64,
}

/// Sweep parameters of one supply, as written in the DUT file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestProfileConfig {
    /// First voltage of the sweep (V)
    pub v_start: f64,
    /// Last voltage of the sweep (V)
    pub v_end: f64,
    /// Step size (V); 0 = fixed voltage
    #[serde(default)]
    pub v_step: f64,
    /// Current limit (A)
    pub i_limit: f64,
    /// Power limit (W)
    pub p_limit: f64,
    /// Output polarity (+1 / -1); the tester wiring if unset
    #[serde(default)]
    pub polarity: Option<i8>,
    /// Idle / pre-heat voltage (V)
    #[serde(default)]
    pub v_idle: Option<f64>,
    /// Lower end of a regulated idle voltage range (V)
    #[serde(default)]
    pub v_idle_min: Option<f64>,
    /// Upper end of a regulated idle voltage range (V)
    #[serde(default)]
    pub v_idle_max: Option<f64>,
    /// Idle current (A)
    #[serde(default)]
    pub i_idle: Option<f64>,
    /// Idle power limit (W); the sweep power limit if unset
    #[serde(default)]
    pub p_idle_limit: Option<f64>,
    /// DUT transconductance at the idle point (A/V)
    #[serde(default)]
    pub idle_gm: Option<f64>,
}

/// DUT test configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DutConfig {
    /// Profile of PSU1; PSU1 stays unused if unset
    #[serde(default)]
    pub psu1: Option<TestProfileConfig>,
    /// Profile of PSU2; PSU2 stays unused if unset
    #[serde(default)]
    pub psu2: Option<TestProfileConfig>,
    /// Repeats, idle/pre-heat times, temperature target
    #[serde(default)]
    pub run: RunSettings,
}

// Default value functions
fn default_app_name() -> String {
    "curvetrace".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

fn identity_poly() -> Vec<f64> {
    vec![0.0, 1.0]
}

fn default_sim_v_max() -> f64 {
    30.0
}

fn default_sim_i_max() -> f64 {
    1.0
}

fn default_num_stable_readings() -> usize {
    1
}

fn default_polarity() -> i8 {
    1
}

fn default_control_interval_ms() -> u64 {
    1000
}

fn default_buffer_interval_s() -> f64 {
    1.0
}

fn default_buffer_len() -> usize {
    10
}

fn default_stable_timeout_s() -> f64 {
    3600.0
}

fn default_bus_lock_timeout_ms() -> u64 {
    5000
}

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl TesterConfig {
    /// Load configuration from a TOML file and `CURVETRACE_` environment variables.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if !VALID_LEVELS.contains(&self.application.log_level.to_ascii_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LEVELS.join(", ")
            ));
        }
        for (label, supply) in [("psu1", &self.psu1), ("psu2", &self.psu2)] {
            if let Some(supply) = supply {
                supply.validate().map_err(|e| format!("{label}: {e}"))?;
            }
        }
        if let Some(heater) = &self.heaterblock {
            heater.validate().map_err(|e| format!("heaterblock: {e}"))?;
        }
        Ok(())
    }
}

impl TesterConfig {
    /// Bench of simulated devices: PSU1 30 V / 1 A into `load1` Ω, PSU2 12 V / 0.5 A
    /// into `load2` Ω, and optionally a simulated heater block.
    pub fn simulated(load1: f64, load2: f64, with_heater: bool) -> Self {
        let supply = |v_max: f64, i_max: f64, load: f64| SupplyConfig {
            units: vec![UnitConfig::simulated(v_max, i_max, Some(load))],
            num_stable_readings: default_num_stable_readings(),
            polarity: default_polarity(),
        };
        Self {
            application: ApplicationConfig::default(),
            psu1: Some(supply(30.0, 1.0, load1)),
            psu2: Some(supply(12.0, 0.5, load2)),
            heaterblock: with_heater.then(HeaterblockConfig::simulated),
        }
    }
}

impl UnitConfig {
    /// SIMULATED unit with an identity calibration.
    pub fn simulated(v_max: f64, i_max: f64, load_ohms: Option<f64>) -> Self {
        Self {
            port: String::new(),
            command_set: CommandSet::Simulated,
            baud: None,
            mode: None,
            v_set_calpoly: identity_poly(),
            v_read_calpoly: identity_poly(),
            i_set_calpoly: identity_poly(),
            i_read_calpoly: identity_poly(),
            limiter_margins: None,
            simulation: SimulationConfig {
                v_max,
                i_max,
                load_ohms,
            },
        }
    }
}

impl HeaterblockConfig {
    /// Simulated heater block: a 30 V / 2 A supply into 10 Ω and a simulated sensor.
    pub fn simulated() -> Self {
        Self {
            units: vec![UnitConfig::simulated(30.0, 2.0, None)],
            sensor_port: "SIMULATED".to_string(),
            sensor_rom: None,
            heater_resistance: 10.0,
            max_power: Some(40.0),
            kp: 4.0,
            ki: 0.2,
            kd: 0.0,
            control_interval_ms: default_control_interval_ms(),
            buffer_interval_s: default_buffer_interval_s(),
            buffer_len: default_buffer_len(),
            stable_timeout_s: default_stable_timeout_s(),
            bus_lock_timeout_ms: default_bus_lock_timeout_ms(),
        }
    }
}

fn validate_units(units: &[UnitConfig]) -> Result<(), String> {
    if units.is_empty() {
        return Err("at least one unit is required".into());
    }
    for (k, unit) in units.iter().enumerate() {
        if unit.command_set != CommandSet::Simulated && unit.port.trim().is_empty() {
            return Err(format!("unit {} ({}) has no port", k + 1, unit.command_set));
        }
        for (name, poly) in [
            ("v_set_calpoly", &unit.v_set_calpoly),
            ("v_read_calpoly", &unit.v_read_calpoly),
            ("i_set_calpoly", &unit.i_set_calpoly),
            ("i_read_calpoly", &unit.i_read_calpoly),
        ] {
            if poly.is_empty() {
                return Err(format!("unit {}: {} must have at least one coefficient", k + 1, name));
            }
        }
    }
    Ok(())
}

impl SupplyConfig {
    /// Validate units and reading settings.
    pub fn validate(&self) -> Result<(), String> {
        validate_units(&self.units)?;
        if self.num_stable_readings == 0 {
            return Err("num_stable_readings must be at least 1".into());
        }
        if self.polarity != 1 && self.polarity != -1 {
            return Err(format!("polarity must be 1 or -1, not {}", self.polarity));
        }
        Ok(())
    }
}

impl HeaterblockConfig {
    /// Validate units, heater and control loop settings.
    pub fn validate(&self) -> Result<(), String> {
        validate_units(&self.units)?;
        if !(self.heater_resistance > 0.0) {
            return Err("heater_resistance must be positive".into());
        }
        if self.max_power.is_some_and(|p| p <= 0.0) {
            return Err("max_power must be positive".into());
        }
        if self.buffer_len == 0 {
            return Err("buffer_len must be at least 1".into());
        }
        if self.control_interval_ms == 0 {
            return Err("control_interval_ms must be positive".into());
        }
        if self.sensor_port.trim().is_empty() {
            return Err("sensor_port is required".into());
        }
        Ok(())
    }
}

impl DutConfig {
    /// Load a DUT configuration from a TOML file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new().merge(Toml::file(path.as_ref())).extract()
    }

    /// Validate profile values and run settings.
    pub fn validate(&self) -> Result<(), String> {
        let needs_idle = self.run.idle_secs > 0.0 || self.run.preheat_secs > 0.0;
        for (label, profile) in [("psu1", &self.psu1), ("psu2", &self.psu2)] {
            if let Some(profile) = profile {
                profile.validate(needs_idle).map_err(|e| format!("{label}: {e}"))?;
            }
        }
        self.run.validate()
    }
}

impl TestProfileConfig {
    fn validate(&self, needs_idle: bool) -> Result<(), String> {
        if self.v_step < 0.0 {
            return Err("v_step must not be negative".into());
        }
        if self.v_step == 0.0 && self.v_start != self.v_end {
            return Err("v_step is required when v_start and v_end differ".into());
        }
        if !(self.i_limit > 0.0) || !(self.p_limit > 0.0) {
            return Err("i_limit and p_limit must be positive".into());
        }
        if let Some(p) = self.polarity {
            if p != 1 && p != -1 {
                return Err(format!("polarity must be 1 or -1, not {p}"));
            }
        }
        if needs_idle && (self.v_idle.is_none() || self.i_idle.is_none()) {
            return Err("v_idle and i_idle are required for idle / pre-heat".into());
        }
        Ok(())
    }
}
