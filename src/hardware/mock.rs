//! Simulated hardware for tests and `curvetrace simulate`.
//!
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep)
//! and `tokio::time::Instant`, so tests can run them on a paused clock.
//!
//! # Available Mocks
//!
//! - [`SimulatedSupply`] - power supply driving a configurable load
//! - [`SimulatedSensor`] - heater block thermometer with a first-order thermal model

use crate::error::{AppResult, CurveTraceError};
use crate::hardware::capabilities::{LimiterMode, ProtocolDriver, Reading};
use crate::hardware::device_spec::DeviceSpec;
use crate::hardware::temperature::TemperatureSensor;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};

/// Envelope of a generic simulated bench supply: 1 mV / 1 mA resolution, fast settling.
pub fn bench_spec(v_max: f64, i_max: f64) -> DeviceSpec {
    DeviceSpec {
        v_min: 0.0,
        v_max,
        i_max,
        p_max: v_max * i_max,
        v_res_set: 0.001,
        i_res_set: 0.001,
        v_res_read: 0.001,
        i_res_read: 0.001,
        v_offset_max: 0.0,
        i_offset_max: 0.0,
        max_settle: Duration::from_secs(1),
        read_idle: Duration::from_millis(10),
    }
}

// =============================================================================
// Load models
// =============================================================================

/// What is connected to the output terminals of a simulated supply.
#[derive(Clone)]
pub enum Load {
    /// Nothing connected
    Open,
    /// Ohmic load (Ω)
    Resistive(f64),
    /// Current drawn as a function of the terminal voltage
    Custom(Arc<dyn Fn(f64) -> f64 + Send + Sync>),
}

impl fmt::Debug for Load {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Load::Open => write!(f, "Open"),
            Load::Resistive(r) => write!(f, "Resistive({r})"),
            Load::Custom(_) => write!(f, "Custom"),
        }
    }
}

impl Load {
    fn current_at(&self, volts: f64) -> f64 {
        match self {
            Load::Open => 0.0,
            Load::Resistive(ohms) if *ohms > 0.0 => volts / ohms,
            Load::Resistive(_) => f64::INFINITY,
            Load::Custom(f) => f(volts).max(0.0),
        }
    }

    /// Terminal voltage once the current is clamped to `limit`.
    fn voltage_at_limit(&self, programmed: f64, demand: f64, limit: f64) -> f64 {
        match self {
            Load::Resistive(ohms) => (limit * ohms).min(programmed),
            _ if demand > 0.0 && demand.is_finite() => programmed * limit / demand,
            _ => 0.0,
        }
    }
}

// =============================================================================
// SimulatedSupply
// =============================================================================

#[derive(Debug)]
struct SupplyState {
    output_on: bool,
    voltage_setpoint: f64,
    current_setpoint: f64,
    load: Load,
    silent: bool,
    commands: Vec<String>,
}

impl SupplyState {
    fn output(&self) -> Reading {
        if !self.output_on {
            return Reading::new(0.0, 0.0, LimiterMode::ConstantVoltage);
        }
        let demand = self.load.current_at(self.voltage_setpoint);
        if demand > self.current_setpoint {
            let volts = self
                .load
                .voltage_at_limit(self.voltage_setpoint, demand, self.current_setpoint);
            Reading::new(volts, self.current_setpoint, LimiterMode::ConstantCurrent)
        } else {
            Reading::new(self.voltage_setpoint, demand, LimiterMode::ConstantVoltage)
        }
    }
}

/// Shared view into a [`SimulatedSupply`], kept by tests and by [`SimulatedSensor`].
#[derive(Debug, Clone)]
pub struct SimulatedHandle {
    state: Arc<Mutex<SupplyState>>,
}

impl SimulatedHandle {
    /// Whether the output is enabled.
    pub fn output_on(&self) -> bool {
        self.state.lock().output_on
    }

    /// Last programmed voltage.
    pub fn voltage_setpoint(&self) -> f64 {
        self.state.lock().voltage_setpoint
    }

    /// Last programmed current limit.
    pub fn current_setpoint(&self) -> f64 {
        self.state.lock().current_setpoint
    }

    /// What the output terminals deliver right now.
    pub fn output(&self) -> Reading {
        self.state.lock().output()
    }

    /// Power delivered into the load (W).
    pub fn power(&self) -> f64 {
        let out = self.output();
        out.voltage * out.current
    }

    /// Replace the load.
    pub fn set_load(&self, load: Load) {
        self.state.lock().load = load;
    }

    /// Make the supply stop answering, as if its cable had been pulled.
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Every command received so far, oldest first.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }
}

/// Power supply simulation implementing [`ProtocolDriver`].
///
/// # Example
///
/// ```rust,ignore
/// let mut psu = SimulatedSupply::new("SIM30", bench_spec(30.0, 1.0), Load::Resistive(100.0));
/// let handle = psu.handle();
/// psu.set_voltage(10.0).await?;
/// assert_eq!(handle.voltage_setpoint(), 10.0);
/// ```
pub struct SimulatedSupply {
    model: String,
    spec: DeviceSpec,
    handle: SimulatedHandle,
    latency: Duration,
}

impl SimulatedSupply {
    /// Simulated supply with output off and zero setpoints.
    pub fn new(model: impl Into<String>, spec: DeviceSpec, load: Load) -> Self {
        let state = SupplyState {
            output_on: false,
            voltage_setpoint: spec.v_min,
            current_setpoint: 0.0,
            load,
            silent: false,
            commands: Vec::new(),
        };
        Self {
            model: model.into(),
            spec,
            handle: SimulatedHandle {
                state: Arc::new(Mutex::new(state)),
            },
            latency: Duration::ZERO,
        }
    }

    /// Delay every operation by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Handle for inspecting the simulated output.
    pub fn handle(&self) -> SimulatedHandle {
        self.handle.clone()
    }

    async fn exchange(&self, command: String) -> AppResult<()> {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        let mut state = self.handle.state.lock();
        if state.silent {
            return Err(CurveTraceError::CommunicationTimeout {
                device: format!("SIMULATED {}", self.model),
                command,
                attempts: 1,
            });
        }
        state.commands.push(command);
        Ok(())
    }
}

#[async_trait]
impl ProtocolDriver for SimulatedSupply {
    fn model(&self) -> &str {
        &self.model
    }

    fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    async fn identify(&mut self) -> AppResult<String> {
        self.exchange("IDN".into()).await?;
        Ok(self.model.clone())
    }

    async fn set_voltage(&mut self, volts: f64) -> AppResult<f64> {
        let value = self.spec.quantize_voltage(volts);
        self.exchange(format!("VSET {:.*}", self.spec.voltage_decimals(), value))
            .await?;
        self.handle.state.lock().voltage_setpoint = value;
        Ok(value)
    }

    async fn set_current(&mut self, amps: f64) -> AppResult<f64> {
        let value = self.spec.quantize_current(amps);
        self.exchange(format!("ISET {:.*}", self.spec.current_decimals(), value))
            .await?;
        self.handle.state.lock().current_setpoint = value;
        Ok(value)
    }

    async fn set_output(&mut self, on: bool) -> AppResult<()> {
        self.exchange(format!("OUT {}", u8::from(on))).await?;
        self.handle.state.lock().output_on = on;
        Ok(())
    }

    async fn read(&mut self) -> AppResult<Reading> {
        self.exchange("READ".into()).await?;
        Ok(self.handle.output())
    }
}

// =============================================================================
// SimulatedSensor
// =============================================================================

/// Heater block thermometer.
///
/// The block temperature relaxes exponentially towards
/// `ambient + kelvin_per_watt × P_heater` with the given time constant, where the
/// heater power is whatever the heater supply currently delivers.
pub struct SimulatedSensor {
    heater: SimulatedHandle,
    ambient: f64,
    kelvin_per_watt: f64,
    time_constant: Duration,
    temperature: f64,
    last_update: Option<Instant>,
}

impl SimulatedSensor {
    /// Block starting at ambient temperature.
    pub fn new(heater: SimulatedHandle, ambient: f64, kelvin_per_watt: f64, time_constant: Duration) -> Self {
        Self {
            heater,
            ambient,
            kelvin_per_watt,
            time_constant,
            temperature: ambient,
            last_update: None,
        }
    }

    fn advance(&mut self) -> f64 {
        let now = Instant::now();
        let steady = self.ambient + self.kelvin_per_watt * self.heater.power();
        if let Some(last) = self.last_update {
            let dt = now.duration_since(last).as_secs_f64();
            let tau = self.time_constant.as_secs_f64();
            let alpha = if tau > 0.0 { 1.0 - (-dt / tau).exp() } else { 1.0 };
            self.temperature += alpha * (steady - self.temperature);
        }
        self.last_update = Some(now);
        self.temperature
    }
}

#[async_trait]
impl TemperatureSensor for SimulatedSensor {
    async fn temperature(&mut self) -> AppResult<f64> {
        Ok(self.advance())
    }
}
