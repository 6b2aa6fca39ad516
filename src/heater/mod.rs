//! Heater block temperature controller.
//!
//! The heater block is a resistive heater on its own power supply plus a DS18B20 on
//! a one-wire bus. [`HeaterController`] runs as an independent tokio task: every
//! control interval it reads the sensor, feeds the PID loop and programs the heater
//! supply. The sweep engine talks to it only through a [`HeaterHandle`].
//!
//! # Controller state machine
//!
//! ```text
//! Stopped ──spawn──> Running ──terminate──> StopRequested ──(loop exit)──> Stopped
//!                       │                                                    ▲
//!                       └──────────────────(failure)─────────────────────────┘
//! ```
//!
//! Whichever way the loop ends, it turns the heater supply off first.

pub mod pid;

pub use pid::Pid;

use crate::config::{CommandSet, HeaterblockConfig};
use crate::error::{AppResult, CurveTraceError};
use crate::experiment::state::CancelFlag;
use crate::hardware::capabilities::ProtocolDriver;
use crate::hardware::device_spec::DeviceSpec;
use crate::hardware::mock::SimulatedSensor;
use crate::hardware::serial::TokioSerialConnector;
use crate::hardware::temperature::{parse_rom_code, Ds18b20, TemperatureSensor, UartOneWire};
use crate::hardware::{connect_unit, simulated_unit};
use crate::supply::{CalibrationSet, LogicalSupply, PhysicalUnit};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Sensor port name selecting the simulated heater block.
pub const SIMULATED_SENSOR_PORT: &str = "SIMULATED";

/// Poll period of [`HeaterHandle::terminate`]
const TERMINATE_POLL: Duration = Duration::from_millis(10);

/// Time a controller step may take beyond its interval before `terminate` gives up
const TERMINATE_GRACE: Duration = Duration::from_secs(30);

/// Poll period of [`HeaterHandle::wait_for_stable_temperature`]
const STABLE_POLL: Duration = Duration::from_millis(100);

/// Consecutive failed sensor readings that end the control loop
const MAX_SENSOR_FAILURES: u32 = 5;

// Thermal model of the simulated block
const SIM_AMBIENT: f64 = 22.0;
const SIM_KELVIN_PER_WATT: f64 = 2.0;
const SIM_TIME_CONSTANT: Duration = Duration::from_secs(60);

// =============================================================================
// Settings and state
// =============================================================================

/// Control loop settings.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaterSettings {
    /// Control loop period
    pub interval: Duration,
    /// Minimum spacing of buffered readings
    pub buffer_interval: Duration,
    /// Number of buffered readings
    pub buffer_len: usize,
    /// Upper bound of one wait for a stable temperature
    pub stable_timeout: Duration,
    /// Upper bound of one wait for the one-wire bus
    pub bus_lock_timeout: Duration,
    /// Heater resistance (Ω)
    pub heater_resistance: f64,
    /// Configured power ceiling (W)
    pub max_power: Option<f64>,
    /// PID gains
    pub kp: f64,
    /// Integral gain
    pub ki: f64,
    /// Derivative gain
    pub kd: f64,
}

impl HeaterSettings {
    /// Settings of a configured heater block.
    pub fn from_config(config: &HeaterblockConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.control_interval_ms),
            buffer_interval: Duration::from_secs_f64(config.buffer_interval_s.max(0.0)),
            buffer_len: config.buffer_len.max(1),
            stable_timeout: Duration::from_secs_f64(config.stable_timeout_s.max(0.0)),
            bus_lock_timeout: Duration::from_millis(config.bus_lock_timeout_ms),
            heater_resistance: config.heater_resistance,
            max_power: config.max_power,
            kp: config.kp,
            ki: config.ki,
            kd: config.kd,
        }
    }
}

/// State of the background control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Task not running
    Stopped,
    /// Task running the control loop
    Running,
    /// Owner asked the task to stop
    StopRequested,
}

/// Heater block state, written by the controller task.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaterState {
    /// Target temperature (°C)
    pub target: Option<f64>,
    /// Tolerance around the target (K)
    pub tolerance: f64,
    /// Last temperature reading (°C)
    pub temperature: Option<f64>,
    /// Time of the last reading
    pub timestamp: Option<DateTime<Local>>,
    /// Heater output enabled
    pub is_on: bool,
    /// Last requested heater power (W)
    pub power: f64,
    /// Recent readings, oldest first, spaced at least one buffer interval apart
    pub buffer: VecDeque<f64>,
    buffer_len: usize,
}

impl HeaterState {
    fn new(buffer_len: usize) -> Self {
        Self {
            target: None,
            tolerance: 0.0,
            temperature: None,
            timestamp: None,
            is_on: false,
            power: 0.0,
            buffer: VecDeque::with_capacity(buffer_len),
            buffer_len,
        }
    }

    fn push_reading(&mut self, temperature: f64) {
        self.buffer.push_back(temperature);
        while self.buffer.len() > self.buffer_len {
            self.buffer.pop_front();
        }
    }

    /// Whether the buffer is full and every buffered reading is within tolerance.
    pub fn is_stable(&self) -> bool {
        let Some(target) = self.target else {
            return false;
        };
        self.buffer.len() == self.buffer_len
            && self.buffer.iter().all(|t| (t - target).abs() <= self.tolerance)
    }
}

struct Shared {
    state: HeaterState,
    controller: ControllerState,
    output_request: Option<bool>,
}

impl Shared {
    /// Output state including a request the controller has not applied yet.
    fn wants_on(&self) -> bool {
        self.output_request.unwrap_or(self.state.is_on)
    }
}

/// Heater supply setpoints for `power`: `V = sqrt(P·R)` within VMAX, `I = P/V`
/// within IMAX.
pub fn heater_setpoints(power: f64, resistance: f64, env: &DeviceSpec) -> (f64, f64) {
    let volts = (power.max(0.0) * resistance).sqrt().min(env.v_max);
    let amps = if volts > 0.0 {
        (power / volts).clamp(0.0, env.i_max)
    } else {
        0.0
    };
    (volts, amps)
}

// =============================================================================
// Controller
// =============================================================================

/// Closed-loop heater controller, consumed by [`HeaterController::spawn`].
pub struct HeaterController {
    supply: LogicalSupply,
    sensor: Box<dyn TemperatureSensor>,
    settings: HeaterSettings,
    pid: Pid,
    max_power: f64,
    shared: Arc<Mutex<Shared>>,
    last_buffered: Option<Instant>,
    sensor_failures: u32,
}

impl HeaterController {
    /// Controller for an already connected heater supply and sensor.
    pub fn new(supply: LogicalSupply, sensor: Box<dyn TemperatureSensor>, settings: HeaterSettings) -> Self {
        let p_max = supply.envelope().p_max;
        let max_power = settings.max_power.map_or(p_max, |p| p.min(p_max));
        let pid = Pid::new(settings.kp, settings.ki, settings.kd, 0.0, max_power);
        let shared = Shared {
            state: HeaterState::new(settings.buffer_len),
            controller: ControllerState::Stopped,
            output_request: None,
        };
        Self {
            supply,
            sensor,
            settings,
            pid,
            max_power,
            shared: Arc::new(Mutex::new(shared)),
            last_buffered: None,
            sensor_failures: 0,
        }
    }

    /// Connect heater supply and sensor of a configured heater block.
    ///
    /// A sensor port named `SIMULATED` gives a simulated block, heated by the first
    /// (simulated) heater supply unit.
    pub async fn connect(config: &HeaterblockConfig) -> AppResult<Self> {
        let settings = HeaterSettings::from_config(config);
        let mut units = Vec::with_capacity(config.units.len());
        let mut simulated_heater = None;
        for unit in &config.units {
            let driver: Box<dyn ProtocolDriver> = if unit.command_set == CommandSet::Simulated {
                let psu = simulated_unit(unit, Some(config.heater_resistance));
                simulated_heater.get_or_insert_with(|| psu.handle());
                Box::new(psu)
            } else {
                connect_unit(unit).await?
            };
            units.push(PhysicalUnit::new(driver, CalibrationSet::from_unit(unit)));
        }
        let mut supply = LogicalSupply::new("HEATER", units, 1, 1)?;
        supply.turn_off().await?;
        info!("{}", supply.describe());

        let sensor: Box<dyn TemperatureSensor> = if config.sensor_port.eq_ignore_ascii_case(SIMULATED_SENSOR_PORT) {
            let heater = simulated_heater.ok_or_else(|| {
                CurveTraceError::ConfigurationInconsistent(
                    "a simulated heater block sensor needs a SIMULATED heater supply".into(),
                )
            })?;
            Box::new(SimulatedSensor::new(heater, SIM_AMBIENT, SIM_KELVIN_PER_WATT, SIM_TIME_CONSTANT))
        } else {
            let rom = match &config.sensor_rom {
                Some(code) => Some(parse_rom_code(code).ok_or_else(|| {
                    CurveTraceError::ConfigurationInconsistent(format!("invalid sensor ROM code '{code}'"))
                })?),
                None => None,
            };
            let bus = UartOneWire::open(Box::new(TokioSerialConnector::new(config.sensor_port.clone())))
                .await?
                .shared();
            Box::new(Ds18b20::new(bus, rom).with_lock_timeout(settings.bus_lock_timeout))
        };

        Ok(Self::new(supply, sensor, settings))
    }

    /// Power ceiling: the configured maximum, limited by the supply PMAX.
    pub fn max_power(&self) -> f64 {
        self.max_power
    }

    /// Start the control loop on its own task.
    pub fn spawn(self) -> HeaterHandle {
        let shared = self.shared.clone();
        shared.lock().controller = ControllerState::Running;
        let stable_timeout = self.settings.stable_timeout;
        let terminate_timeout = self.settings.interval + TERMINATE_GRACE;
        let task = tokio::spawn(self.run());
        HeaterHandle {
            shared,
            task: Some(task),
            stable_timeout,
            terminate_timeout,
        }
    }

    async fn run(mut self) {
        info!("Heater controller started (max. power {:.2} W)", self.max_power);
        let result = loop {
            if self.shared.lock().controller == ControllerState::StopRequested {
                break Ok(());
            }
            sleep(self.settings.interval).await;
            if let Err(e) = self.step().await {
                break Err(e);
            }
        };
        if let Err(e) = &result {
            error!("Heater controller failed: {}", e);
        }
        if let Err(e) = self.supply.turn_off().await {
            warn!("Could not turn off the heater: {}", e);
        }
        {
            let mut shared = self.shared.lock();
            shared.state.is_on = false;
            shared.state.power = 0.0;
            shared.output_request = None;
            shared.controller = ControllerState::Stopped;
        }
        info!("Heater controller stopped");
    }

    /// One control iteration.
    async fn step(&mut self) -> AppResult<()> {
        let now = Instant::now();
        let reading = match self.sensor.temperature().await {
            Ok(t) => {
                self.sensor_failures = 0;
                Some(t)
            }
            Err(e) => {
                self.sensor_failures += 1;
                if self.sensor_failures >= MAX_SENSOR_FAILURES {
                    return Err(CurveTraceError::Heater(format!(
                        "{} consecutive temperature readings failed, last: {}",
                        self.sensor_failures, e
                    )));
                }
                warn!("Heater block temperature reading failed: {}", e);
                None
            }
        };

        let request = {
            let mut shared = self.shared.lock();
            if let Some(t) = reading {
                shared.state.temperature = Some(t);
                shared.state.timestamp = Some(Local::now());
                let due = self
                    .last_buffered
                    .map_or(true, |last| now.duration_since(last) >= self.settings.buffer_interval);
                if due {
                    shared.state.push_reading(t);
                    self.last_buffered = Some(now);
                }
            }
            shared.output_request.take()
        };

        match request {
            Some(true) => self.switch_on().await?,
            Some(false) => self.switch_off().await?,
            None => {}
        }

        let (is_on, target) = {
            let shared = self.shared.lock();
            (shared.state.is_on, shared.state.target)
        };
        if !is_on {
            return Ok(());
        }
        let Some(temperature) = reading else {
            return Ok(());
        };
        match target {
            None => {
                warn!("Heater block has no target temperature, turning the heater off");
                self.switch_off().await
            }
            Some(target) => {
                let power = self.pid.update(target, temperature, now);
                debug!("Heater: T = {:.2} °C, target {:.2} °C, power {:.2} W", temperature, target, power);
                self.apply_power(power).await
            }
        }
    }

    async fn switch_on(&mut self) -> AppResult<()> {
        self.supply.turn_on().await?;
        self.supply.set_voltage(0.0, false).await?;
        let i_max = self.supply.envelope().i_max;
        self.supply.set_current(i_max, false).await?;
        self.pid.reset();
        let mut shared = self.shared.lock();
        shared.state.is_on = true;
        shared.state.power = 0.0;
        info!("Heater turned on");
        Ok(())
    }

    async fn switch_off(&mut self) -> AppResult<()> {
        self.supply.turn_off().await?;
        self.pid.reset();
        let mut shared = self.shared.lock();
        shared.state.is_on = false;
        shared.state.power = 0.0;
        info!("Heater turned off");
        Ok(())
    }

    async fn apply_power(&mut self, power: f64) -> AppResult<()> {
        let power = power.clamp(0.0, self.max_power);
        let (volts, amps) = heater_setpoints(power, self.settings.heater_resistance, self.supply.envelope());
        self.supply.set_voltage(volts, false).await?;
        self.supply.set_current(amps, false).await?;
        self.shared.lock().state.power = power;
        Ok(())
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Owner side of a running [`HeaterController`].
///
/// Dropping the handle asks the controller to stop; the task then turns the heater
/// off on its own.
pub struct HeaterHandle {
    shared: Arc<Mutex<Shared>>,
    task: Option<JoinHandle<()>>,
    stable_timeout: Duration,
    terminate_timeout: Duration,
}

impl HeaterHandle {
    /// Last temperature reading (°C)
    pub fn temperature(&self) -> Option<f64> {
        self.shared.lock().state.temperature
    }

    /// Whether the buffered readings are all within tolerance of the target
    pub fn is_stable(&self) -> bool {
        self.shared.lock().state.is_stable()
    }

    /// Target temperature and tolerance
    pub fn target(&self) -> Option<(f64, f64)> {
        let shared = self.shared.lock();
        shared.state.target.map(|t| (t, shared.state.tolerance))
    }

    /// Snapshot of the heater state
    pub fn state(&self) -> HeaterState {
        self.shared.lock().state.clone()
    }

    /// State of the control loop
    pub fn controller_state(&self) -> ControllerState {
        self.shared.lock().controller
    }

    /// Whether the heater is on, or has been asked to turn on
    pub fn is_on(&self) -> bool {
        self.shared.lock().wants_on()
    }

    /// Set (or clear) the target temperature.
    pub fn set_target(&self, target: Option<f64>, tolerance: f64) {
        let mut shared = self.shared.lock();
        shared.state.target = target;
        shared.state.tolerance = tolerance.abs();
        match target {
            Some(t) => info!("Heater block target temperature {:.2} ± {:.2} °C", t, tolerance.abs()),
            None => info!("Heater block target temperature cleared"),
        }
    }

    /// Ask the controller to turn the heater on.
    pub fn turn_on(&self) {
        self.shared.lock().output_request = Some(true);
    }

    /// Ask the controller to turn the heater off.
    pub fn turn_off(&self) {
        self.shared.lock().output_request = Some(false);
    }

    /// Wait until the heater block temperature is stable.
    ///
    /// While the block is hotter than `target + tolerance`, `dut` is turned off so it
    /// stops heating the block; it is turned back on with its previous setpoints
    /// once the wait is over. Returns at once if the heater is off or has no target.
    ///
    /// # Returns
    /// Time spent waiting. The wait is bounded by the configured stable timeout,
    /// after which a warning is logged and the run continues.
    ///
    /// # Errors
    /// - `Cancelled` if `cancel` is set while waiting
    /// - `Heater` if the controller is no longer running
    pub async fn wait_for_stable_temperature(
        &self,
        mut dut: Option<&mut LogicalSupply>,
        cancel: &CancelFlag,
    ) -> AppResult<Duration> {
        let start = Instant::now();
        {
            let shared = self.shared.lock();
            if !shared.wants_on() || shared.state.target.is_none() || shared.state.is_stable() {
                return Ok(Duration::ZERO);
            }
        }
        if let Some((target, tolerance)) = self.target() {
            info!(
                "Waiting for heater block temperature (current: {}, target: {:.2} ± {:.2} °C)...",
                self.temperature().map_or_else(|| "NA".to_string(), |t| format!("{t:.2} °C")),
                target,
                tolerance
            );
        }

        let mut parked: Option<(f64, f64)> = None;
        let result = loop {
            let (stable, hot, controller) = {
                let shared = self.shared.lock();
                let state = &shared.state;
                let hot = match (state.temperature, state.target) {
                    (Some(t), Some(target)) => t > target + state.tolerance,
                    _ => false,
                };
                (state.is_stable() || state.target.is_none(), hot, shared.controller)
            };
            if stable {
                break Ok(());
            }
            if controller == ControllerState::Stopped {
                break Err(CurveTraceError::Heater("heater controller is not running".into()));
            }
            if let Err(e) = cancel.check() {
                break Err(e);
            }
            if start.elapsed() > self.stable_timeout {
                warn!(
                    "Heater block temperature not stable after {:?}, continuing",
                    self.stable_timeout
                );
                break Ok(());
            }
            if hot && parked.is_none() {
                if let Some(dut) = dut.as_deref_mut() {
                    let setpoints = (dut.voltage_setpoint(), dut.current_setpoint());
                    if let Err(e) = dut.turn_off().await {
                        break Err(e);
                    }
                    info!("{} turned off until the heater block has cooled down", dut.label());
                    parked = Some(setpoints);
                }
            }
            sleep(STABLE_POLL).await;
        };

        result?;
        if let (Some((volts, amps)), Some(dut)) = (parked, dut.as_deref_mut()) {
            dut.turn_on().await?;
            dut.set_current(amps, false).await?;
            dut.set_voltage(volts, false).await?;
        }
        Ok(start.elapsed())
    }

    /// Stop the controller and wait for it to turn the heater off.
    ///
    /// Polls the controller state every 10 ms. If the loop does not stop within one
    /// control interval plus a grace period, the task is aborted and an error returned.
    pub async fn terminate(&mut self) -> AppResult<()> {
        {
            let mut shared = self.shared.lock();
            if shared.controller == ControllerState::Running {
                shared.controller = ControllerState::StopRequested;
            }
        }
        let deadline = Instant::now() + self.terminate_timeout;
        while self.controller_state() != ControllerState::Stopped {
            if Instant::now() > deadline {
                if let Some(task) = self.task.take() {
                    task.abort();
                }
                return Err(CurveTraceError::Heater("heater controller did not stop".into()));
            }
            sleep(TERMINATE_POLL).await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        Ok(())
    }
}

impl Drop for HeaterHandle {
    fn drop(&mut self) {
        let mut shared = self.shared.lock();
        if shared.controller == ControllerState::Running {
            shared.controller = ControllerState::StopRequested;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{bench_spec, Load, SimulatedHandle, SimulatedSupply};
    use crate::supply::tests::sim_unit;

    fn settings(stable_timeout: Duration) -> HeaterSettings {
        HeaterSettings {
            interval: Duration::from_secs(1),
            buffer_interval: Duration::from_secs(1),
            buffer_len: 5,
            stable_timeout,
            bus_lock_timeout: Duration::from_secs(1),
            heater_resistance: 10.0,
            max_power: Some(30.0),
            kp: 2.0,
            ki: 0.1,
            kd: 0.0,
        }
    }

    /// Heater supply 30 V / 1 A into 10 Ω, block at `ambient` heating 2 K/W.
    fn simulated_block(ambient: f64, stable_timeout: Duration) -> (HeaterController, SimulatedHandle) {
        let psu = SimulatedSupply::new("SIM", bench_spec(30.0, 1.0), Load::Resistive(10.0));
        let heater = psu.handle();
        let unit = PhysicalUnit::new(Box::new(psu), CalibrationSet::default());
        let supply = LogicalSupply::new("HEATER", vec![unit], 1, 1).unwrap();
        let sensor = SimulatedSensor::new(heater.clone(), ambient, 2.0, Duration::from_secs(20));
        (HeaterController::new(supply, Box::new(sensor), settings(stable_timeout)), heater)
    }

    #[test]
    fn setpoints_follow_power() {
        let env = bench_spec(30.0, 1.0);
        let (v, i) = heater_setpoints(10.0, 10.0, &env);
        assert!((v - 10.0).abs() < 1e-9);
        assert!((i - 1.0).abs() < 1e-9);

        let (v, i) = heater_setpoints(100.0, 10.0, &env);
        assert_eq!(v, 30.0);
        assert_eq!(i, 1.0);

        assert_eq!(heater_setpoints(0.0, 10.0, &env), (0.0, 0.0));
        assert_eq!(heater_setpoints(-5.0, 10.0, &env), (0.0, 0.0));
    }

    #[test]
    fn stability_needs_full_buffer_within_tolerance() {
        let mut state = HeaterState::new(3);
        state.target = Some(40.0);
        state.tolerance = 0.5;
        state.push_reading(40.1);
        state.push_reading(39.8);
        assert!(!state.is_stable());
        state.push_reading(40.4);
        assert!(state.is_stable());
        state.push_reading(40.6);
        assert!(!state.is_stable());
        assert_eq!(state.buffer.len(), 3);

        state.target = None;
        assert!(!state.is_stable());
    }

    #[test]
    fn max_power_is_limited_by_supply() {
        let (controller, _) = simulated_block(22.0, Duration::from_secs(60));
        assert_eq!(controller.max_power(), 30.0);

        let psu = SimulatedSupply::new("SIM", bench_spec(10.0, 1.0), Load::Resistive(10.0));
        let heater = psu.handle();
        let supply = LogicalSupply::new(
            "HEATER",
            vec![PhysicalUnit::new(Box::new(psu), CalibrationSet::default())],
            1,
            1,
        )
        .unwrap();
        let sensor = SimulatedSensor::new(heater, 22.0, 2.0, Duration::from_secs(20));
        let controller = HeaterController::new(supply, Box::new(sensor), settings(Duration::from_secs(60)));
        assert_eq!(controller.max_power(), 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn block_reaches_target_and_heater_turns_off_on_terminate() {
        let (controller, heater) = simulated_block(22.0, Duration::from_secs(3600));
        let mut handle = controller.spawn();
        assert_eq!(handle.controller_state(), ControllerState::Running);

        handle.set_target(Some(40.0), 0.5);
        handle.turn_on();
        let waited = handle
            .wait_for_stable_temperature(None, &CancelFlag::new())
            .await
            .unwrap();
        assert!(waited > Duration::ZERO);
        assert!(handle.is_stable());
        let t = handle.temperature().unwrap();
        assert!((t - 40.0).abs() <= 0.5, "temperature {t}");
        assert!(heater.output_on());
        let power = handle.state().power;
        assert!(power > 0.0 && power <= 30.0);

        handle.terminate().await.unwrap();
        assert_eq!(handle.controller_state(), ControllerState::Stopped);
        assert!(!heater.output_on());
        assert!(!handle.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn heater_without_target_stays_off() {
        let (controller, heater) = simulated_block(22.0, Duration::from_secs(60));
        let mut handle = controller.spawn();
        handle.turn_on();
        let waited = handle
            .wait_for_stable_temperature(None, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(waited, Duration::ZERO);

        sleep(Duration::from_secs(3)).await;
        assert!(!handle.is_on());
        assert!(!heater.output_on());
        assert!(handle.temperature().is_some());
        handle.terminate().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn hot_block_parks_the_dut_and_restores_it() {
        // Block sits at 60 °C even without heating, so it never gets to 40 °C.
        let (controller, _) = simulated_block(60.0, Duration::from_secs(30));
        let mut handle = controller.spawn();
        handle.set_target(Some(40.0), 0.5);
        handle.turn_on();

        let (unit, dut_handle) = sim_unit(bench_spec(30.0, 1.0), Load::Resistive(100.0), CalibrationSet::default());
        let mut dut = LogicalSupply::new("PSU1", vec![unit], 1, 1).unwrap();
        dut.set_current(0.1, false).await.unwrap();
        dut.set_voltage(5.0, false).await.unwrap();
        dut.turn_on().await.unwrap();

        // Let the controller take a first reading.
        sleep(Duration::from_millis(1500)).await;
        let waited = handle
            .wait_for_stable_temperature(Some(&mut dut), &CancelFlag::new())
            .await
            .unwrap();
        assert!(waited >= Duration::from_secs(30));
        assert!(dut_handle.commands().contains(&"OUT 0".to_string()));
        assert!(dut_handle.output_on());
        assert!((dut_handle.voltage_setpoint() - 5.0).abs() < 1e-9);
        assert!((dut_handle.current_setpoint() - 0.1).abs() < 1e-9);

        handle.terminate().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_the_wait() {
        let (controller, _) = simulated_block(22.0, Duration::from_secs(3600));
        let mut handle = controller.spawn();
        handle.set_target(Some(80.0), 0.1);
        handle.turn_on();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let result = handle.wait_for_stable_temperature(None, &cancel).await;
        assert!(matches!(result, Err(CurveTraceError::Cancelled)));
        handle.terminate().await.unwrap();
    }
}
