//! KORAD / RND laboratory power supply driver
//!
//! Protocol Overview:
//! - Format: ASCII command/response over RS-232 / USB-CDC
//! - Baud: 9600, 8N1, no flow control
//! - Terminator: LF (\n)
//! - Commands: VSET:x, ISET:x, OUT:0/1
//! - Queries: *IDN?, VOUT?, IOUT?, STATUS? (binary status byte, bit 0 set = CV)

use crate::error::{AppResult, CurveTraceError};
use crate::error_recovery::RetryPolicy;
use crate::hardware::capabilities::{LimiterMode, ProtocolDriver, Reading, Setpoints};
use crate::hardware::device_spec::{lookup, DeviceSpec, SpecRow};
use crate::hardware::serial::{LineChannel, LineSettings, SerialConnector};
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

const VENDOR: &str = "KORAD";

static MODELS: [SpecRow; 1] = [SpecRow {
    model: "KWR103",
    limits: [0.0, 60.5, 15.0, 300.0],
    set_res: [0.001, 0.001],
    read_res: [0.001, 0.001],
    offsets: [0.0, 0.0],
    settle_ms: 3000,
}];

/// Driver for KORAD (and RND-branded) supplies.
pub struct KoradDriver {
    channel: LineChannel,
    model: String,
    spec: DeviceSpec,
    setpoints: Setpoints,
}

impl KoradDriver {
    /// Fixed baud rate of the KORAD interface
    pub const BAUD_RATE: u32 = 9600;

    /// Default line settings: LF framing, 10 s reply timeout.
    pub fn default_settings() -> LineSettings {
        LineSettings::lf()
            .with_timeout(Duration::from_secs(10))
            .with_retry(RetryPolicy::new(3, Duration::from_millis(100)))
    }

    /// Open the port, identify the model and switch the output off.
    ///
    /// # Errors
    /// - `CommunicationTimeout` if the device does not answer `*IDN?`
    /// - `UnknownModel` if the reply is not a known KORAD model
    pub async fn connect(connector: Box<dyn SerialConnector>, settings: LineSettings) -> AppResult<Self> {
        let mut channel = LineChannel::open(connector, Self::BAUD_RATE, settings).await?;
        channel.drain().await;
        let model = query_model(&mut channel).await?;
        let row = lookup(VENDOR, &MODELS, &model)?;
        let spec = row.to_spec(Duration::from_millis(row.settle_ms / 50));
        channel.set_device_name(format!("{} {}", VENDOR, model));
        info!("Connected to {} {} at {}", VENDOR, model, channel.baud_rate());

        let mut driver = Self {
            channel,
            model,
            spec,
            setpoints: Setpoints::default(),
        };
        driver.set_output(false).await?;
        Ok(driver)
    }

    async fn status_is_cv(&mut self) -> AppResult<bool> {
        let raw = self.channel.query_raw("STATUS?").await?;
        Ok(raw.first().is_some_and(|byte| byte & 0b0000_0001 != 0))
    }
}

async fn query_model(channel: &mut LineChannel) -> AppResult<String> {
    let idn = channel.query("*IDN?").await?;
    let mut tokens = idn.split_whitespace();
    match (tokens.next(), tokens.next()) {
        (Some(vendor), Some(model)) if vendor.eq_ignore_ascii_case(VENDOR) => Ok(model.to_string()),
        _ => Err(CurveTraceError::UnknownModel {
            vendor: VENDOR,
            model: idn,
        }),
    }
}

#[async_trait]
impl ProtocolDriver for KoradDriver {
    fn model(&self) -> &str {
        &self.model
    }

    fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    async fn identify(&mut self) -> AppResult<String> {
        query_model(&mut self.channel).await
    }

    async fn set_voltage(&mut self, volts: f64) -> AppResult<f64> {
        let value = self.spec.quantize_voltage(volts);
        self.channel
            .send(&format!("VSET:{:.*}", self.spec.voltage_decimals(), value))
            .await?;
        self.setpoints.voltage = Some(value);
        Ok(value)
    }

    async fn set_current(&mut self, amps: f64) -> AppResult<f64> {
        let value = self.spec.quantize_current(amps);
        self.channel
            .send(&format!("ISET:{:.*}", self.spec.current_decimals(), value))
            .await?;
        self.setpoints.current = Some(value);
        Ok(value)
    }

    async fn set_output(&mut self, on: bool) -> AppResult<()> {
        self.channel.send(&format!("OUT:{}", u8::from(on))).await
    }

    async fn read(&mut self) -> AppResult<Reading> {
        let voltage = self.channel.query_number("VOUT?").await?;
        let current = self.channel.query_number("IOUT?").await?;
        let limiter = if self.status_is_cv().await? {
            LimiterMode::ConstantVoltage
        } else {
            LimiterMode::ConstantCurrent
        };
        Ok(Reading::new(voltage, current, limiter))
    }
}
