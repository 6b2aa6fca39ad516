//! Logical power supplies.
//!
//! A [`LogicalSupply`] is what the sweep engine and the heater controller drive: one
//! physical unit, or several units wired in series and addressed as one supply with
//! summed voltage and power capability. The stack has a combined envelope, spreads
//! voltage setpoints across its units, applies each unit's calibration, and decides
//! when a new setpoint has settled (see [`settle`]).
//!
//! # Example
//!
//! ```rust,ignore
//! let mut psu1 = LogicalSupply::connect("PSU1", &tester.psu1.unwrap()).await?;
//! psu1.set_current(0.1, false).await?;
//! psu1.set_voltage(5.0, true).await?;
//! let reading = psu1.read(psu1.num_stable_readings()).await?;
//! ```

pub mod calibration;
pub mod settle;

pub use calibration::{CalibrationPolynomial, CalibrationSet};
pub use settle::{SettleOutcome, LIMITER_STREAK_LIMIT};

use crate::config::SupplyConfig;
use crate::error::{AppResult, CurveTraceError};
use crate::experiment::profile::TestProfile;
use crate::hardware::capabilities::{LimiterMode, ProtocolDriver, Reading};
use crate::hardware::device_spec::DeviceSpec;
use crate::hardware::connect_unit;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Live connection to one physical unit of a stack.
pub struct PhysicalUnit {
    driver: Box<dyn ProtocolDriver>,
    calibration: CalibrationSet,
    connected: bool,
}

impl PhysicalUnit {
    /// Wrap a connected driver.
    pub fn new(driver: Box<dyn ProtocolDriver>, calibration: CalibrationSet) -> Self {
        Self {
            driver,
            calibration,
            connected: true,
        }
    }

    /// Model identifier reported by the driver
    pub fn model(&self) -> &str {
        self.driver.model()
    }

    /// Envelope of the unit
    pub fn spec(&self) -> &DeviceSpec {
        self.driver.spec()
    }

    /// Calibration polynomials of the unit
    pub fn calibration(&self) -> &CalibrationSet {
        &self.calibration
    }

    /// Whether the unit is still usable.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn ensure_connected(&self) -> AppResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(CurveTraceError::NotConnected(self.model().to_string()))
        }
    }

    async fn set_voltage(&mut self, nominal: f64) -> AppResult<f64> {
        self.ensure_connected()?;
        self.driver.set_voltage(self.calibration.v_set.apply(nominal)).await
    }

    async fn set_current(&mut self, nominal: f64) -> AppResult<f64> {
        self.ensure_connected()?;
        self.driver.set_current(self.calibration.i_set.apply(nominal)).await
    }

    async fn set_output(&mut self, on: bool) -> AppResult<()> {
        self.ensure_connected()?;
        self.driver.set_output(on).await
    }

    async fn read_raw(&mut self) -> AppResult<Reading> {
        self.ensure_connected()?;
        self.driver.read().await
    }

    fn correct(&self, raw: Reading) -> Reading {
        Reading::new(
            self.calibration.v_read.apply(raw.voltage),
            self.calibration.i_read.apply(raw.current),
            raw.limiter,
        )
    }

    async fn force_off(&mut self) -> AppResult<()> {
        self.ensure_connected()?;
        let v_min = self.driver.spec().v_min;
        self.driver.set_output(false).await?;
        self.driver.set_voltage(v_min).await?;
        self.driver.set_current(0.0).await?;
        Ok(())
    }
}

/// Combined envelope of units stacked in series.
///
/// Voltages and power add up, the series current is limited by the weakest unit,
/// resolutions and timings follow the coarsest (slowest) unit.
pub fn stack_envelope(specs: &[&DeviceSpec]) -> DeviceSpec {
    let max_of = |f: fn(&DeviceSpec) -> f64| specs.iter().map(|s| f(s)).fold(0.0, f64::max);
    let sum_of = |f: fn(&DeviceSpec) -> f64| specs.iter().map(|s| f(s)).sum::<f64>();
    let i_max = specs.iter().map(|s| s.i_max).fold(f64::INFINITY, f64::min);
    let i_max = if i_max.is_finite() { i_max } else { 0.0 };
    let v_max = sum_of(|s| s.v_max);
    DeviceSpec {
        v_min: sum_of(|s| s.v_min),
        v_max,
        i_max,
        p_max: sum_of(|s| s.p_max).min(v_max * i_max),
        v_res_set: max_of(|s| s.v_res_set),
        i_res_set: max_of(|s| s.i_res_set),
        v_res_read: max_of(|s| s.v_res_read),
        i_res_read: max_of(|s| s.i_res_read),
        v_offset_max: sum_of(|s| s.v_offset_max),
        i_offset_max: max_of(|s| s.i_offset_max),
        max_settle: specs.iter().map(|s| s.max_settle).max().unwrap_or(Duration::ZERO),
        read_idle: specs.iter().map(|s| s.read_idle).max().unwrap_or(Duration::ZERO),
    }
}

/// Split `total` across units with the given `[v_min, v_max]` ranges, front to back.
///
/// Each unit takes as much as it can, but leaves at least the minimum voltage of the
/// units behind it.
pub fn distribute_voltage(total: f64, ranges: &[(f64, f64)]) -> Vec<f64> {
    let mut remaining = total;
    let mut shares = Vec::with_capacity(ranges.len());
    for (k, (v_min, v_max)) in ranges.iter().enumerate() {
        let reserved: f64 = ranges[k + 1..].iter().map(|(lo, _)| lo).sum();
        let share = remaining.min(*v_max).min(remaining - reserved).max(*v_min);
        shares.push(share);
        remaining -= share;
    }
    shares
}

/// Combine calibrated unit readings of a series stack.
///
/// Voltages add up, the current is the mean. CC wins over Unknown, Unknown wins
/// over CV.
pub fn combine_readings(readings: &[Reading]) -> Reading {
    let voltage = readings.iter().map(|r| r.voltage).sum();
    let current = if readings.is_empty() {
        0.0
    } else {
        readings.iter().map(|r| r.current).sum::<f64>() / readings.len() as f64
    };
    let limiter = if readings.iter().any(|r| r.limiter == LimiterMode::ConstantCurrent) {
        LimiterMode::ConstantCurrent
    } else if readings.iter().any(|r| r.limiter == LimiterMode::Unknown) || readings.is_empty() {
        LimiterMode::Unknown
    } else {
        LimiterMode::ConstantVoltage
    };
    Reading::new(voltage, current, limiter)
}

/// One or more physical units addressed as a single supply.
pub struct LogicalSupply {
    label: String,
    units: Vec<PhysicalUnit>,
    envelope: DeviceSpec,
    num_stable_readings: usize,
    polarity: i8,
    profile: Option<TestProfile>,
    voltage_setpoint: f64,
    current_setpoint: f64,
}

impl LogicalSupply {
    /// Stack already connected units.
    ///
    /// # Errors
    /// `ConfigurationInconsistent` if `units` is empty.
    pub fn new(
        label: impl Into<String>,
        units: Vec<PhysicalUnit>,
        num_stable_readings: usize,
        polarity: i8,
    ) -> AppResult<Self> {
        let label = label.into();
        if units.is_empty() {
            return Err(CurveTraceError::ConfigurationInconsistent(format!(
                "{label} has no power supply units"
            )));
        }
        let envelope = stack_envelope(&units.iter().map(PhysicalUnit::spec).collect::<Vec<_>>());
        let voltage_setpoint = envelope.v_min;
        Ok(Self {
            label,
            units,
            envelope,
            num_stable_readings: num_stable_readings.max(1),
            polarity: if polarity < 0 { -1 } else { 1 },
            profile: None,
            voltage_setpoint,
            current_setpoint: 0.0,
        })
    }

    /// Connect every configured unit and stack them.
    pub async fn connect(label: impl Into<String>, config: &SupplyConfig) -> AppResult<Self> {
        let label = label.into();
        let mut units = Vec::with_capacity(config.units.len());
        for unit in &config.units {
            let driver = connect_unit(unit).await?;
            units.push(PhysicalUnit::new(driver, CalibrationSet::from_unit(unit)));
        }
        let supply = Self::new(label, units, config.num_stable_readings, config.polarity)?;
        info!("{}", supply.describe());
        Ok(supply)
    }

    /// Label used in logs and data file headers ("PSU1", "HEATER", ...)
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Combined envelope of the stack
    pub fn envelope(&self) -> &DeviceSpec {
        &self.envelope
    }

    /// Units in stacking order
    pub fn units(&self) -> &[PhysicalUnit] {
        &self.units
    }

    /// Number of consistent readings taken per measurement
    pub fn num_stable_readings(&self) -> usize {
        self.num_stable_readings
    }

    /// Output polarity (+1 / -1): the profile's if one is applied, the wiring's otherwise
    pub fn polarity(&self) -> i8 {
        self.profile.as_ref().map_or(self.polarity, |p| p.polarity)
    }

    /// Polarity of the tester wiring
    pub fn wiring_polarity(&self) -> i8 {
        self.polarity
    }

    /// Whether every unit is connected.
    pub fn is_connected(&self) -> bool {
        self.units.iter().all(PhysicalUnit::is_connected)
    }

    /// Whether a test profile has been applied.
    pub fn is_configured(&self) -> bool {
        self.profile.is_some()
    }

    /// Test profile applied for the current run
    pub fn profile(&self) -> Option<&TestProfile> {
        self.profile.as_ref()
    }

    /// Apply a test profile; its polarity overrides the wiring polarity.
    pub fn set_profile(&mut self, profile: TestProfile) {
        self.profile = Some(profile);
    }

    /// Drop the test profile; the supply is unused until configured again.
    pub fn clear_profile(&mut self) {
        self.profile = None;
    }

    /// Last nominal voltage setpoint
    pub fn voltage_setpoint(&self) -> f64 {
        self.voltage_setpoint
    }

    /// Last nominal current setpoint
    pub fn current_setpoint(&self) -> f64 {
        self.current_setpoint
    }

    /// Multi-line summary of models and envelope.
    pub fn describe(&self) -> String {
        let env = &self.envelope;
        let mut lines = vec![format!("{}:", self.label)];
        for (k, unit) in self.units.iter().enumerate() {
            if self.units.len() > 1 {
                lines.push(format!("* Model (unit {}): {}", k + 1, unit.model()));
            } else {
                lines.push(format!("* Model: {}", unit.model()));
            }
        }
        lines.push(format!("* Min. voltage: {} V", env.v_min));
        lines.push(format!("* Max. voltage: {} V", env.v_max));
        lines.push(format!("* Max. current: {} A", env.i_max));
        lines.push(format!("* Max. power: {} W", env.p_max));
        lines.push(format!("* Voltage setting resolution: {} V", env.v_res_set));
        lines.push(format!("* Current setting resolution: {} A", env.i_res_set));
        lines.push(format!("* Voltage reading resolution: {} V", env.v_res_read));
        lines.push(format!("* Current reading resolution: {} A", env.i_res_read));
        lines.push(format!(
            "* Number of consistent readings for measurements: {}",
            self.num_stable_readings
        ));
        lines.join("\n")
    }

    /// Set the total output voltage.
    ///
    /// The value is rounded to the coarsest set resolution, clamped to the stack
    /// envelope, split across the units and calibrated per unit.
    ///
    /// # Returns
    /// The settle outcome if `wait_stable`, `None` otherwise.
    pub async fn set_voltage(&mut self, volts: f64, wait_stable: bool) -> AppResult<Option<SettleOutcome>> {
        let total = self.envelope.quantize_voltage(volts);
        if (total - volts).abs() > self.envelope.v_res_set {
            debug!("{}: voltage request {} V adjusted to {} V", self.label, volts, total);
        }
        let ranges: Vec<(f64, f64)> = self
            .units
            .iter()
            .map(|u| (u.spec().v_min, u.spec().v_max))
            .collect();
        let shares = distribute_voltage(total, &ranges);
        for (unit, share) in self.units.iter_mut().zip(shares) {
            unit.set_voltage(share).await?;
        }
        self.voltage_setpoint = total;

        if wait_stable {
            Ok(Some(self.settle_voltage(total).await?))
        } else {
            Ok(None)
        }
    }

    /// Set the current limit of every unit (they share the series current).
    pub async fn set_current(&mut self, amps: f64, wait_stable: bool) -> AppResult<Option<SettleOutcome>> {
        let value = self.envelope.quantize_current(amps);
        for unit in &mut self.units {
            unit.set_current(value).await?;
        }
        self.current_setpoint = value;

        if wait_stable {
            Ok(Some(self.settle_current(value).await?))
        } else {
            Ok(None)
        }
    }

    /// Enable the outputs of all units.
    pub async fn turn_on(&mut self) -> AppResult<()> {
        for unit in &mut self.units {
            unit.set_output(true).await?;
        }
        Ok(())
    }

    /// Disable all outputs and park every unit at its minimum voltage and zero current.
    ///
    /// Every unit is attempted even if an earlier one fails; the first error is returned.
    pub async fn turn_off(&mut self) -> AppResult<()> {
        let mut first_error = None;
        for unit in &mut self.units {
            if let Err(e) = unit.force_off().await {
                warn!("{}: failed to turn off {}: {}", self.label, unit.model(), e);
                first_error.get_or_insert(e);
            }
        }
        self.voltage_setpoint = self.envelope.v_min;
        self.current_setpoint = 0.0;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Turn the outputs off and release all units.
    pub async fn disconnect(&mut self) -> AppResult<()> {
        let result = self.turn_off().await;
        for unit in &mut self.units {
            unit.connected = false;
        }
        info!("{} disconnected", self.label);
        result
    }

    /// Read every unit once and combine the calibrated readings.
    pub async fn read_once(&mut self) -> AppResult<Reading> {
        let mut readings = Vec::with_capacity(self.units.len());
        for unit in &mut self.units {
            let raw = unit.read_raw().await?;
            readings.push(unit.correct(raw));
        }
        Ok(combine_readings(&readings))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::hardware::mock::{bench_spec, Load, SimulatedHandle, SimulatedSupply};

    pub(crate) fn sim_unit(spec: DeviceSpec, load: Load, calibration: CalibrationSet) -> (PhysicalUnit, SimulatedHandle) {
        let psu = SimulatedSupply::new("SIM", spec, load);
        let handle = psu.handle();
        (PhysicalUnit::new(Box::new(psu), calibration), handle)
    }

    #[test]
    fn envelope_of_a_stack() {
        let a = bench_spec(20.0, 2.0);
        let b = DeviceSpec {
            v_res_set: 0.01,
            ..bench_spec(40.0, 1.0)
        };
        let env = stack_envelope(&[&a, &b]);
        assert_eq!(env.v_max, 60.0);
        assert_eq!(env.i_max, 1.0);
        assert_eq!(env.v_res_set, 0.01);
        assert!(env.p_max <= env.v_max * env.i_max);
    }

    #[test]
    fn shares_respect_unit_limits_and_sum_up() {
        let shares = distribute_voltage(45.0, &[(0.0, 20.0), (0.0, 40.0)]);
        assert_eq!(shares, vec![20.0, 25.0]);

        let shares = distribute_voltage(10.0, &[(0.0, 20.0), (0.0, 40.0)]);
        assert_eq!(shares, vec![10.0, 0.0]);
    }

    #[test]
    fn voltage_is_borrowed_back_for_minimum_of_later_units() {
        let shares = distribute_voltage(5.0, &[(0.9, 20.0), (0.9, 20.0)]);
        assert!((shares[0] - 4.1).abs() < 1e-12);
        assert!((shares[1] - 0.9).abs() < 1e-12);
    }

    #[test]
    fn readings_combine_in_series() {
        let cv = Reading::new(10.0, 0.10, LimiterMode::ConstantVoltage);
        let cc = Reading::new(5.0, 0.12, LimiterMode::ConstantCurrent);
        let combined = combine_readings(&[cv, cc]);
        assert_eq!(combined.voltage, 15.0);
        assert!((combined.current - 0.11).abs() < 1e-12);
        assert_eq!(combined.limiter, LimiterMode::ConstantCurrent);

        let unknown = Reading::new(1.0, 0.0, LimiterMode::Unknown);
        assert_eq!(combine_readings(&[cv, unknown]).limiter, LimiterMode::Unknown);
        assert_eq!(combine_readings(&[cv, cv]).limiter, LimiterMode::ConstantVoltage);
    }

    #[test]
    fn empty_stack_is_rejected() {
        let err = LogicalSupply::new("PSU1", Vec::new(), 1, 1).err().unwrap();
        assert!(matches!(err, CurveTraceError::ConfigurationInconsistent(_)));
    }

    #[tokio::test]
    async fn stacked_setpoints_are_distributed() {
        let (u1, h1) = sim_unit(bench_spec(20.0, 1.0), Load::Open, CalibrationSet::default());
        let (u2, h2) = sim_unit(bench_spec(40.0, 1.0), Load::Open, CalibrationSet::default());
        let mut psu = LogicalSupply::new("PSU1", vec![u1, u2], 1, 1).unwrap();

        assert!(psu.set_voltage(45.0, false).await.unwrap().is_none());
        assert!((h1.voltage_setpoint() - 20.0).abs() < 1e-9);
        assert!((h1.voltage_setpoint() + h2.voltage_setpoint() - 45.0).abs() <= 0.001);

        psu.set_voltage(75.0, false).await.unwrap();
        assert_eq!(psu.voltage_setpoint(), 60.0);
        assert!((h2.voltage_setpoint() - 40.0).abs() < 1e-9);

        psu.set_current(0.25, false).await.unwrap();
        assert!((h1.current_setpoint() - 0.25).abs() < 1e-9);
        assert!((h2.current_setpoint() - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn calibration_applies_on_set_and_read() {
        let calibration = CalibrationSet {
            v_set: CalibrationPolynomial::new(vec![0.0, 1.01]),
            v_read: CalibrationPolynomial::new(vec![0.0, 1.0 / 1.01]),
            ..Default::default()
        };
        let (unit, handle) = sim_unit(bench_spec(30.0, 1.0), Load::Resistive(1000.0), calibration);
        let mut psu = LogicalSupply::new("PSU1", vec![unit], 1, 1).unwrap();
        psu.set_current(1.0, false).await.unwrap();
        psu.set_voltage(10.0, false).await.unwrap();
        psu.turn_on().await.unwrap();

        assert!((handle.voltage_setpoint() - 10.1).abs() < 1e-9);
        let reading = psu.read_once().await.unwrap();
        assert!((reading.voltage - 10.0).abs() < 1e-9);
        assert!((reading.current - 0.0101).abs() < 1e-9);
    }

    #[tokio::test]
    async fn turn_off_bypasses_calibration() {
        let calibration = CalibrationSet {
            v_set: CalibrationPolynomial::new(vec![0.5, 1.0]),
            i_set: CalibrationPolynomial::new(vec![0.01, 1.0]),
            ..Default::default()
        };
        let (unit, handle) = sim_unit(bench_spec(30.0, 1.0), Load::Open, calibration);
        let mut psu = LogicalSupply::new("PSU1", vec![unit], 1, 1).unwrap();
        psu.set_voltage(5.0, false).await.unwrap();
        psu.turn_on().await.unwrap();
        psu.turn_off().await.unwrap();

        assert!(!handle.output_on());
        assert_eq!(handle.voltage_setpoint(), 0.0);
        assert_eq!(handle.current_setpoint(), 0.0);
    }

    #[tokio::test]
    async fn disconnected_units_refuse_commands() {
        let (unit, _handle) = sim_unit(bench_spec(30.0, 1.0), Load::Open, CalibrationSet::default());
        let mut psu = LogicalSupply::new("PSU1", vec![unit], 1, 1).unwrap();
        psu.disconnect().await.unwrap();
        assert!(!psu.is_connected());
        let err = psu.read_once().await.unwrap_err();
        assert!(matches!(err, CurveTraceError::NotConnected(_)));
    }
}
