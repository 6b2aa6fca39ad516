//! VOLTCRAFT PPS power supply driver
//!
//! Protocol Overview:
//! - Format: fixed-width ASCII fields, every reply acknowledged with "OK"
//! - Baud: 9600, 8N1
//! - Terminator: CR (\r)
//! - Commands: SOUTn (inverted: 0 = output on), VOLTnnn (tenths of a volt),
//!   CURRnnn (current times the model's current multiplier)
//! - Queries: GMAX (VVVIII, maximum voltage and current), GETD (VVVVIIIIM)
//!
//! The PPS has no identification string; the model is derived from its maximum
//! voltage and current.

use crate::error::{AppResult, CurveTraceError};
use crate::error_recovery::{Retry, RetryPolicy};
use crate::hardware::capabilities::{LimiterMode, ProtocolDriver, Reading};
use crate::hardware::device_spec::DeviceSpec;
use crate::hardware::serial::{LineChannel, LineSettings, SerialConnector};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

const VENDOR: &str = "VOLTCRAFT";
const ACK: &str = "OK";

/// Known models by (maximum voltage, maximum current)
const MODELS: [((f64, f64), &str); 6] = [
    ((36.2, 7.0), "PPS11360"),
    ((60.0, 2.5), "PPS11603"),
    ((18.0, 20.0), "PPS13610"),
    ((36.2, 12.0), "PPS16005"),
    ((60.0, 5.0), "PPS11815"),
    ((18.2, 12.0), "PPS11810"),
];

const UNTESTED: [&str; 3] = ["PPS11603", "PPS13610", "PPS11815"];

/// Maximum voltage/current as reported by GMAX.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Limits {
    v_max: f64,
    i_max: f64,
    /// counts per ampere in CURR and GMAX fields
    current_multiplier: f64,
}

fn parse_gmax(reply: &str) -> Option<Limits> {
    if reply.len() < 6 || !reply.is_ascii() {
        return None;
    }
    let volts: u32 = reply[0..3].parse().ok()?;
    let amps: u32 = reply[3..6].parse().ok()?;
    let current_multiplier = if reply == "362700" { 100.0 } else { 10.0 };
    Some(Limits {
        v_max: f64::from(volts) / 10.0,
        i_max: f64::from(amps) / current_multiplier,
        current_multiplier,
    })
}

fn parse_getd(reply: &str) -> Option<Reading> {
    if reply.len() < 9 || !reply.is_ascii() {
        return None;
    }
    let volts: u32 = reply[0..4].parse().ok()?;
    let amps: u32 = reply[4..8].parse().ok()?;
    let limiter = match &reply[8..9] {
        "0" => LimiterMode::ConstantVoltage,
        "1" => LimiterMode::ConstantCurrent,
        _ => return None,
    };
    Some(Reading::new(f64::from(volts) / 100.0, f64::from(amps) / 100.0, limiter))
}

fn model_for(limits: &Limits) -> Option<&'static str> {
    MODELS
        .iter()
        .find(|((v, i), _)| (v - limits.v_max).abs() < 1e-6 && (i - limits.i_max).abs() < 1e-6)
        .map(|(_, model)| *model)
}

/// Operating envelope determined experimentally on a PPS-16005.
fn spec_for(limits: &Limits) -> DeviceSpec {
    DeviceSpec {
        v_min: 0.9,
        v_max: limits.v_max,
        i_max: limits.i_max,
        p_max: (limits.v_max * limits.i_max).floor(),
        v_res_set: 0.1,
        i_res_set: 1.0 / limits.current_multiplier,
        v_res_read: 0.1,
        i_res_read: 0.01,
        v_offset_max: 0.0,
        i_offset_max: 0.0,
        max_settle: Duration::from_secs(5),
        read_idle: Duration::from_millis(200),
    }
}

/// Driver for VOLTCRAFT PPS supplies.
pub struct VoltcraftDriver {
    channel: LineChannel,
    model: String,
    spec: DeviceSpec,
    limits: Limits,
}

impl VoltcraftDriver {
    /// Fixed baud rate of the PPS interface
    pub const BAUD_RATE: u32 = 9600;

    /// Default line settings: CR framing, 2 s timeout, 10 attempts 0.2 s apart.
    pub fn default_settings() -> LineSettings {
        LineSettings::cr()
            .with_timeout(Duration::from_secs(2))
            .with_retry(RetryPolicy::new(10, Duration::from_millis(200)))
    }

    /// Open the port, determine the model from GMAX and switch the output off.
    pub async fn connect(connector: Box<dyn SerialConnector>, settings: LineSettings) -> AppResult<Self> {
        let mut channel = LineChannel::open(connector, Self::BAUD_RATE, settings).await?;
        channel.drain().await;
        let limits = query_limits(&mut channel).await?;
        let model = model_for(&limits).ok_or_else(|| CurveTraceError::UnknownModel {
            vendor: VENDOR,
            model: format!("max. {} V / {} A", limits.v_max, limits.i_max),
        })?;
        if UNTESTED.contains(&model) {
            warn!("Operation of {} {} is untested, be careful", VENDOR, model);
        }
        channel.set_device_name(format!("{} {}", VENDOR, model));
        info!("Connected to {} {}", VENDOR, model);

        let mut driver = Self {
            channel,
            model: model.to_string(),
            spec: spec_for(&limits),
            limits,
        };
        driver.set_output(false).await?;
        Ok(driver)
    }

    /// Send a command and wait for its acknowledgement.
    async fn command(&mut self, command: &str) -> AppResult<()> {
        self.channel.query_block(command, ACK).await.map(|_| ())
    }
}

async fn query_limits(channel: &mut LineChannel) -> AppResult<Limits> {
    let lines = channel.query_block("GMAX", ACK).await?;
    let reply = lines.concat();
    parse_gmax(&reply).ok_or_else(|| CurveTraceError::invalid_response(channel.device_name(), reply))
}

#[async_trait]
impl ProtocolDriver for VoltcraftDriver {
    fn model(&self) -> &str {
        &self.model
    }

    fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    async fn identify(&mut self) -> AppResult<String> {
        let limits = query_limits(&mut self.channel).await?;
        model_for(&limits)
            .map(str::to_string)
            .ok_or_else(|| CurveTraceError::UnknownModel {
                vendor: VENDOR,
                model: format!("max. {} V / {} A", limits.v_max, limits.i_max),
            })
    }

    async fn set_voltage(&mut self, volts: f64) -> AppResult<f64> {
        let value = self.spec.quantize_voltage(volts);
        let tenths = (value * 10.0).round() as u32;
        self.command(&format!("VOLT{:03}", tenths)).await?;
        Ok(value)
    }

    async fn set_current(&mut self, amps: f64) -> AppResult<f64> {
        let value = self.spec.quantize_current(amps);
        let counts = (value * self.limits.current_multiplier).round() as u32;
        self.command(&format!("CURR{:03}", counts)).await?;
        Ok(value)
    }

    async fn set_output(&mut self, on: bool) -> AppResult<()> {
        // SOUT0 switches the output on
        self.command(if on { "SOUT0" } else { "SOUT1" }).await
    }

    async fn read(&mut self) -> AppResult<Reading> {
        let policy = self.channel.settings().retry.clone();
        let mut retry = Retry::new(&policy);
        while retry.next_attempt().await {
            let reply = self.channel.query_block("GETD", ACK).await?.concat();
            match parse_getd(&reply) {
                Some(reading) => return Ok(reading),
                None => debug!(device = %self.channel.device_name(), "Garbled GETD reply '{}'", reply),
            }
        }
        Err(retry.exhausted(self.channel.device_name(), "GETD"))
    }
}
