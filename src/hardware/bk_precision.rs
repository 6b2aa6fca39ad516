//! BK PRECISION 9100-series power supply driver
//!
//! Protocol Overview:
//! - Format: SCPI over USB-CDC / RS-232
//! - Baud: unknown in advance, probed in the order 57600, 38400, 19200, 14400, 9600, 4800
//! - Terminator: LF (\n)
//! - Commands: SOURCE:VOLTAGE x, SOURCE:CURRENT x, OUTPUT ON|OFF
//! - Queries: *IDN?, MEASURE:VOLTAGE?, MEASURE:CURRENT?
//!
//! The CV/CC status register is deliberately not queried: on the 9185B reading it
//! corrupts the communication. The limiter mode is inferred from the readback
//! instead (see [`Setpoints::infer_limiter`]).

use crate::error::{AppResult, CurveTraceError};
use crate::error_recovery::RetryPolicy;
use crate::hardware::capabilities::{LimiterMargins, ProtocolDriver, Reading, Setpoints};
use crate::hardware::device_spec::{lookup, DeviceSpec, SpecRow};
use crate::hardware::serial::{LineChannel, LineSettings, SerialConnector};
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

const VENDOR: &str = "BK PRECISION";

/// Baud rates probed during connect, in order.
pub const BAUD_RATES: [u32; 6] = [57600, 38400, 19200, 14400, 9600, 4800];

static MODELS: [SpecRow; 3] = [
    SpecRow {
        model: "9185B_HIGH",
        limits: [0.0, 610.0, 0.35, 210.0],
        set_res: [0.02, 0.00001],
        read_res: [0.3, 0.0015],
        offsets: [0.02, 0.0],
        settle_ms: 2000,
    },
    SpecRow {
        model: "9185B_LOW",
        limits: [0.0, 400.0, 0.5, 210.0],
        set_res: [0.02, 0.00001],
        read_res: [0.3, 0.0015],
        offsets: [0.02, 0.0],
        settle_ms: 2000,
    },
    SpecRow {
        model: "9120A",
        limits: [0.0, 32.0, 3.0, 96.0],
        set_res: [0.0005, 0.0001],
        read_res: [0.0001, 0.00001],
        offsets: [0.012, 0.0002],
        settle_ms: 2000,
    },
];

/// Output voltage range of the 9185B.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoltageRange {
    /// 0..610 V at 0.35 A
    #[default]
    High,
    /// 0..400 V at 0.5 A
    Low,
}

impl VoltageRange {
    fn scpi(self) -> &'static str {
        match self {
            VoltageRange::High => "HIGH",
            VoltageRange::Low => "LOW",
        }
    }

    /// Parse the "HIGH"/"LOW" mode string used in unit configuration.
    pub fn from_mode(mode: Option<&str>) -> Self {
        match mode.map(str::to_ascii_uppercase).as_deref() {
            Some("LOW") => VoltageRange::Low,
            _ => VoltageRange::High,
        }
    }
}

/// Connect-time options of a BK PRECISION unit.
#[derive(Debug, Clone)]
pub struct BkOptions {
    /// Voltage range, only used by the 9185B
    pub range: VoltageRange,
    /// CV/CC inference thresholds; `None` derives them from the model
    pub margins: Option<LimiterMargins>,
    /// Pause after a baud rate that did not answer
    pub probe_pause: Duration,
}

impl Default for BkOptions {
    fn default() -> Self {
        Self {
            range: VoltageRange::High,
            margins: None,
            probe_pause: Duration::from_millis(1500),
        }
    }
}

/// Driver for BK PRECISION 9185B and 9120A supplies.
pub struct BkPrecisionDriver {
    channel: LineChannel,
    model: String,
    spec: DeviceSpec,
    setpoints: Setpoints,
    margins: LimiterMargins,
    range: VoltageRange,
}

impl BkPrecisionDriver {
    /// Default line settings: LF framing, 10 attempts per query.
    pub fn default_settings() -> LineSettings {
        LineSettings::lf()
            .with_timeout(Duration::from_secs(1))
            .with_retry(RetryPolicy::new(10, Duration::from_millis(200)))
    }

    /// Probe the baud rate, identify the model, reset the unit to defaults and switch
    /// the output off.
    pub async fn connect(
        connector: Box<dyn SerialConnector>,
        settings: LineSettings,
        options: BkOptions,
    ) -> AppResult<Self> {
        let mut channel = LineChannel::open(connector, BAUD_RATES[0], settings).await?;
        let idn = channel
            .probe_baud_rates(&BAUD_RATES, "*IDN?", options.probe_pause)
            .await?;
        let model = resolve_model(&idn, options.range)?;
        let row = lookup(VENDOR, &MODELS, &model)?;
        let spec = row.to_spec(Duration::from_millis(row.settle_ms / 50));
        channel.set_device_name(format!("{} {}", VENDOR, model));
        info!("Connected to {} {} at {} baud", VENDOR, model, channel.baud_rate());

        channel.send("*CLS").await?;
        channel.send("SYSTEM:RECALL:DEFAULT").await?;
        if model.starts_with("9185B") {
            channel
                .send(&format!("SOURCE:VOLTAGE:RANGE {}", options.range.scpi()))
                .await?;
        }

        let margins = options.margins.unwrap_or_else(|| LimiterMargins::for_spec(&spec));
        let mut driver = Self {
            channel,
            model,
            spec,
            setpoints: Setpoints::default(),
            margins,
            range: options.range,
        };
        driver.set_output(false).await?;
        Ok(driver)
    }
}

/// Map an IDN reply ("B&K PRECISION,9185B,SN,FW") to a model table key.
fn resolve_model(idn: &str, range: VoltageRange) -> AppResult<String> {
    let tokens: Vec<&str> = idn.split(',').map(str::trim).collect();
    let vendor_ok = tokens
        .first()
        .is_some_and(|v| v.eq_ignore_ascii_case("B&K PRECISION") || v.eq_ignore_ascii_case("BK PRECISION"));
    match tokens.get(1) {
        Some(&"9185B") if vendor_ok => Ok(format!("9185B_{}", range.scpi())),
        Some(model) if vendor_ok => Ok(model.to_string()),
        _ => Err(CurveTraceError::UnknownModel {
            vendor: VENDOR,
            model: idn.to_string(),
        }),
    }
}

#[async_trait]
impl ProtocolDriver for BkPrecisionDriver {
    fn model(&self) -> &str {
        &self.model
    }

    fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    async fn identify(&mut self) -> AppResult<String> {
        let idn = self.channel.query("*IDN?").await?;
        resolve_model(&idn, self.range)
    }

    async fn set_voltage(&mut self, volts: f64) -> AppResult<f64> {
        let value = self.spec.quantize_voltage(volts);
        self.channel
            .send(&format!("SOURCE:VOLTAGE {:.*}", self.spec.voltage_decimals(), value))
            .await?;
        self.setpoints.voltage = Some(value);
        Ok(value)
    }

    async fn set_current(&mut self, amps: f64) -> AppResult<f64> {
        let value = self.spec.quantize_current(amps);
        self.channel
            .send(&format!("SOURCE:CURRENT {:.*}", self.spec.current_decimals(), value))
            .await?;
        self.setpoints.current = Some(value);
        Ok(value)
    }

    async fn set_output(&mut self, on: bool) -> AppResult<()> {
        self.channel
            .send(if on { "OUTPUT ON" } else { "OUTPUT OFF" })
            .await
    }

    async fn read(&mut self) -> AppResult<Reading> {
        self.channel.send("*CLS").await?;
        let voltage = self.channel.query_number("MEASURE:VOLTAGE?").await?;
        let current = self.channel.query_number("MEASURE:CURRENT?").await?;
        let limiter = self.setpoints.infer_limiter(voltage, current, &self.margins);
        Ok(Reading::new(voltage, current, limiter))
    }
}
