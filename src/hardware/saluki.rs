//! SALUKI / MAYNUO SPS8xx power supply driver
//!
//! Protocol Overview:
//! - Format: SCPI over USB-CDC
//! - Baud: probed in the order 9600, 57600, 38400, 19200, 14400, 4800
//! - Terminator: LF (\n)
//! - Commands: VOLTAGE x, CURRENT x, OUTPUT 1|0 (values printed at set resolution)
//! - Queries: *IDN?, MEASURE:VOLTAGE?, MEASURE:CURRENT?
//!
//! The units have no readable CV/CC status. The front panel shows CC when the
//! current is within 1 mA of the limit and CV when the voltage is within 5 mV of
//! the setpoint; the driver applies the same windows.

use crate::error::{AppResult, CurveTraceError};
use crate::error_recovery::RetryPolicy;
use crate::hardware::capabilities::{LimiterMargins, LimiterMode, ProtocolDriver, Reading, Setpoints};
use crate::hardware::device_spec::{lookup, DeviceSpec, SpecRow};
use crate::hardware::serial::{LineChannel, LineSettings, SerialConnector};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

const VENDOR: &str = "SALUKI";

/// Baud rates probed during connect, in order.
pub const BAUD_RATES: [u32; 6] = [9600, 57600, 38400, 19200, 14400, 4800];

/// Front-panel CV/CC windows.
pub const PANEL_MARGINS: LimiterMargins = LimiterMargins {
    current: 0.001,
    voltage: 0.005,
};

static MODELS: [SpecRow; 4] = [
    SpecRow {
        model: "SPS811",
        limits: [0.0, 30.0, 5.0, 30.0],
        set_res: [0.0005, 0.0001],
        read_res: [0.0001, 0.00001],
        offsets: [0.0005, 0.0001],
        settle_ms: 1000,
    },
    SpecRow {
        model: "SPS812",
        limits: [0.0, 75.0, 2.0, 30.0],
        set_res: [0.001, 0.00005],
        read_res: [0.0001, 0.00001],
        offsets: [0.0005, 0.0001],
        settle_ms: 1000,
    },
    SpecRow {
        model: "SPS813",
        limits: [0.0, 150.0, 1.0, 30.0],
        set_res: [0.001, 0.00001],
        read_res: [0.0001, 0.00001],
        offsets: [0.0005, 0.0001],
        settle_ms: 1000,
    },
    SpecRow {
        model: "SPS831",
        limits: [0.0, 30.0, 1.0, 30.0],
        set_res: [0.0005, 0.00001],
        read_res: [0.0001, 0.000001],
        offsets: [0.0005, 0.0001],
        settle_ms: 1000,
    },
];

/// Driver for SALUKI SPS8xx (and MAYNUO M88xx) supplies.
pub struct SalukiDriver {
    channel: LineChannel,
    model: String,
    spec: DeviceSpec,
    setpoints: Setpoints,
    margins: LimiterMargins,
}

impl SalukiDriver {
    /// Default line settings: LF framing, 2 s timeout, 10 attempts per query.
    pub fn default_settings() -> LineSettings {
        LineSettings::lf()
            .with_timeout(Duration::from_secs(2))
            .with_retry(RetryPolicy::new(10, Duration::from_millis(200)))
    }

    /// Probe the baud rate, identify the model, reset the unit and switch the output off.
    ///
    /// # Arguments
    /// * `margins` - CV/CC windows; `None` uses [`PANEL_MARGINS`]
    /// * `probe_pause` - pause after a baud rate that did not answer
    pub async fn connect(
        connector: Box<dyn SerialConnector>,
        settings: LineSettings,
        margins: Option<LimiterMargins>,
        probe_pause: Duration,
    ) -> AppResult<Self> {
        let mut channel = LineChannel::open(connector, BAUD_RATES[0], settings).await?;
        let idn = channel.probe_baud_rates(&BAUD_RATES, "*IDN?", probe_pause).await?;
        let model = resolve_model(&idn)?;
        let row = lookup(VENDOR, &MODELS, &model)?;
        if model != "SPS831" {
            warn!("Operation of {} {} is untested, be careful", VENDOR, model);
        }
        let spec = row.to_spec(Duration::from_millis(20));
        channel.set_device_name(format!("{} {}", VENDOR, model));
        info!("Connected to {} {} at {} baud", VENDOR, model, channel.baud_rate());

        channel.send("*CLS").await?;
        channel.send("*RST").await?;

        let mut driver = Self {
            channel,
            model,
            spec,
            setpoints: Setpoints::default(),
            margins: margins.unwrap_or(PANEL_MARGINS),
        };
        driver.set_output(false).await?;
        Ok(driver)
    }

    fn limiter(&self, voltage: f64, current: f64) -> LimiterMode {
        match (self.setpoints.voltage, self.setpoints.current) {
            (_, Some(i_set)) if (current - i_set).abs() <= self.margins.current => LimiterMode::ConstantCurrent,
            (Some(v_set), _) if (voltage - v_set).abs() <= self.margins.voltage => LimiterMode::ConstantVoltage,
            _ => LimiterMode::Unknown,
        }
    }
}

/// Map an IDN reply to a model table key. MAYNUO units report their own names.
fn resolve_model(idn: &str) -> AppResult<String> {
    let normalized = idn.to_ascii_uppercase().replace("MAYNUO", VENDOR);
    let tokens: Vec<&str> = normalized.split(',').map(str::trim).collect();
    let model = match (tokens.first(), tokens.get(1)) {
        (Some(&VENDOR), Some(&("M8811" | "SPS811"))) => "SPS811",
        (Some(&VENDOR), Some(&("M8812" | "SPS812"))) => "SPS812",
        (Some(&VENDOR), Some(&("M8813" | "SPS813"))) => "SPS813",
        (Some(&VENDOR), Some(&("M8831" | "SPS831"))) => "SPS831",
        _ => {
            return Err(CurveTraceError::UnknownModel {
                vendor: VENDOR,
                model: idn.to_string(),
            })
        }
    };
    Ok(model.to_string())
}

#[async_trait]
impl ProtocolDriver for SalukiDriver {
    fn model(&self) -> &str {
        &self.model
    }

    fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    async fn identify(&mut self) -> AppResult<String> {
        let idn = self.channel.query("*IDN?").await?;
        resolve_model(&idn)
    }

    async fn set_voltage(&mut self, volts: f64) -> AppResult<f64> {
        let value = self.spec.quantize_voltage(volts);
        self.channel
            .send(&format!("VOLTAGE {:.*}", self.spec.voltage_decimals(), value))
            .await?;
        self.setpoints.voltage = Some(value);
        Ok(value)
    }

    async fn set_current(&mut self, amps: f64) -> AppResult<f64> {
        let value = self.spec.quantize_current(amps);
        self.channel
            .send(&format!("CURRENT {:.*}", self.spec.current_decimals(), value))
            .await?;
        self.setpoints.current = Some(value);
        Ok(value)
    }

    async fn set_output(&mut self, on: bool) -> AppResult<()> {
        self.channel.send(if on { "OUTPUT 1" } else { "OUTPUT 0" }).await
    }

    async fn read(&mut self) -> AppResult<Reading> {
        self.channel.send("*CLS").await?;
        let voltage = self.channel.query_number("MEASURE:VOLTAGE?").await?;
        let current = self.channel.query_number("MEASURE:CURRENT?").await?;
        Ok(Reading::new(voltage, current, self.limiter(voltage, current)))
    }
}
