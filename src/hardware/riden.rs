//! RIDEN (RUIDEN) RD60xx power supply driver
//!
//! Protocol Overview:
//! - Format: Modbus RTU, slave address 1
//! - Baud: 115200 (default of the units), 8N1
//! - Registers (holding):
//!   - 0: model id
//!   - 8 / 9: voltage / current setpoint
//!   - 10 / 11: output voltage / current
//!   - 17: 1 = CC
//!   - 18: output enable
//!   - 20: current range of the RD6012P (0 = 6 A, 1 = 12 A)
//!   - 82, 86, ..., 118: OVP of the memory groups, OCP at the following register
//!
//! Register values are physical values divided by the model's resolution.

use crate::error::{AppResult, CurveTraceError};
use crate::error_recovery::{Retry, RetryPolicy};
use crate::hardware::capabilities::{LimiterMode, ProtocolDriver, Reading};
use crate::hardware::device_spec::{lookup, DeviceSpec, SpecRow};
use crate::hardware::serial::{drain_serial_buffer, DynSerial, SerialConnector};
use async_trait::async_trait;
use rmodbus::client::ModbusRequest;
use rmodbus::ModbusProto;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, trace, warn};

const VENDOR: &str = "RIDEN";

const REG_MODEL: u16 = 0;
const REG_V_SET: u16 = 8;
const REG_I_SET: u16 = 9;
const REG_V_OUT: u16 = 10;
const REG_CC: u16 = 17;
const REG_OUTPUT: u16 = 18;
const REG_CURRENT_RANGE: u16 = 20;
const REG_OVP_FIRST: u16 = 82;
const REG_OVP_LAST: u16 = 118;

/// OVP preset that never limits a 60 V unit
const OVP_MAX: f64 = 61.0;

static MODELS: [SpecRow; 6] = [
    SpecRow {
        model: "RD6006",
        limits: [0.0, 60.0, 6.0, 360.0],
        set_res: [0.001, 0.001],
        read_res: [0.001, 0.001],
        offsets: [0.0, 0.0],
        settle_ms: 300,
    },
    SpecRow {
        model: "RD6006P",
        limits: [0.0, 60.0, 6.0, 360.0],
        set_res: [0.001, 0.0001],
        read_res: [0.001, 0.0001],
        offsets: [0.0, 0.0],
        settle_ms: 1500,
    },
    SpecRow {
        model: "RD6012",
        limits: [0.0, 60.0, 12.0, 720.0],
        set_res: [0.001, 0.001],
        read_res: [0.001, 0.001],
        offsets: [0.0, 0.0],
        settle_ms: 300,
    },
    SpecRow {
        model: "RD6012P_6A",
        limits: [0.0, 60.0, 6.0, 360.0],
        set_res: [0.001, 0.0001],
        read_res: [0.001, 0.0001],
        offsets: [0.0, 0.0],
        settle_ms: 1800,
    },
    SpecRow {
        model: "RD6012P_12A",
        limits: [0.0, 60.0, 12.0, 720.0],
        set_res: [0.001, 0.001],
        read_res: [0.001, 0.001],
        offsets: [0.0, 0.0],
        settle_ms: 1800,
    },
    SpecRow {
        model: "RD6018",
        limits: [0.0, 60.0, 18.0, 1080.0],
        set_res: [0.01, 0.01],
        read_res: [0.01, 0.01],
        offsets: [0.0, 0.0],
        settle_ms: 300,
    },
];

const UNTESTED: [&str; 3] = ["RD6006", "RD6012", "RD6018"];

/// Current range of the RD6012P.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CurrentRange {
    /// 0..6 A at 0.1 mA resolution
    #[default]
    Low,
    /// 0..12 A at 1 mA resolution
    High,
}

impl CurrentRange {
    /// Parse the "LOW"/"HIGH" mode string used in unit configuration.
    pub fn from_mode(mode: Option<&str>) -> Self {
        match mode.map(str::to_ascii_uppercase).as_deref() {
            Some("HIGH") => CurrentRange::High,
            _ => CurrentRange::Low,
        }
    }
}

/// Link parameters of a Modbus RTU device.
#[derive(Debug, Clone)]
pub struct ModbusSettings {
    /// Slave address
    pub unit_id: u8,
    /// How long to wait for one response frame
    pub timeout: Duration,
    /// Attempt ceiling and pause per transaction
    pub retry: RetryPolicy,
}

impl Default for ModbusSettings {
    fn default() -> Self {
        Self {
            unit_id: 1,
            timeout: Duration::from_secs(1),
            retry: RetryPolicy::new(10, Duration::from_millis(50)),
        }
    }
}

/// Modbus RTU request/response channel to one slave.
pub struct ModbusChannel {
    port: DynSerial,
    settings: ModbusSettings,
    device: String,
}

impl ModbusChannel {
    /// Open the port at `baud_rate`.
    pub async fn open(
        connector: Box<dyn SerialConnector>,
        baud_rate: u32,
        settings: ModbusSettings,
    ) -> AppResult<Self> {
        let port = connector.open(baud_rate).await?;
        Ok(Self {
            port,
            settings,
            device: connector.port_name().to_string(),
        })
    }

    /// Name used in errors and logs.
    pub fn set_device_name(&mut self, name: impl Into<String>) {
        self.device = name.into();
    }

    /// Read `count` consecutive holding registers starting at `register`.
    pub async fn read_holdings(&mut self, register: u16, count: u16) -> AppResult<Vec<u16>> {
        let mut req = ModbusRequest::new(self.settings.unit_id, ModbusProto::Rtu);
        let mut frame = Vec::new();
        req.generate_get_holdings(register, count, &mut frame)?;

        let policy = self.settings.retry.clone();
        let mut retry = Retry::new(&policy);
        while retry.next_attempt().await {
            if let Some(reply) = self.transact(&frame).await? {
                let mut values = Vec::new();
                match req.parse_u16(&reply, &mut values) {
                    Ok(()) if values.len() >= usize::from(count) => return Ok(values),
                    Ok(()) => debug!(device = %self.device, "Short reply reading register {}", register),
                    Err(e) => debug!(device = %self.device, "Bad reply reading register {}: {}", register, e),
                }
            }
            self.drain().await;
        }
        Err(retry.exhausted(&self.device, &format!("read register {register}")))
    }

    /// Write one holding register.
    pub async fn write_holding(&mut self, register: u16, value: u16) -> AppResult<()> {
        let mut req = ModbusRequest::new(self.settings.unit_id, ModbusProto::Rtu);
        let mut frame = Vec::new();
        req.generate_set_holding(register, value, &mut frame)?;

        let policy = self.settings.retry.clone();
        let mut retry = Retry::new(&policy);
        while retry.next_attempt().await {
            if let Some(reply) = self.transact(&frame).await? {
                match req.parse_ok(&reply) {
                    Ok(()) => return Ok(()),
                    Err(e) => debug!(device = %self.device, "Bad reply writing register {}: {}", register, e),
                }
            }
            self.drain().await;
        }
        Err(retry.exhausted(&self.device, &format!("write register {register}")))
    }

    /// Send one request frame and wait for the response frame. `None` on timeout.
    async fn transact(&mut self, frame: &[u8]) -> AppResult<Option<Vec<u8>>> {
        trace!(device = %self.device, "<- {:02X?}", frame);
        self.port.write_all(frame).await?;
        self.port.flush().await?;
        match tokio::time::timeout(self.settings.timeout, read_rtu_frame(&mut self.port)).await {
            Err(_) => Ok(None),
            Ok(Ok(reply)) => {
                trace!(device = %self.device, "-> {:02X?}", reply);
                Ok(Some(reply))
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn drain(&mut self) {
        let discarded = drain_serial_buffer(&mut self.port, 20).await;
        if discarded > 0 {
            debug!(device = %self.device, "Discarded {} stale bytes", discarded);
        }
    }
}

/// Read one response frame: address, function, payload and CRC.
async fn read_rtu_frame(port: &mut DynSerial) -> std::io::Result<Vec<u8>> {
    let mut frame = vec![0u8; 3];
    port.read_exact(&mut frame).await?;
    let remaining = if frame[1] & 0x80 != 0 {
        // exception: code already read, CRC follows
        2
    } else if frame[1] == 0x03 {
        usize::from(frame[2]) + 2
    } else {
        // echo of a single register write
        5
    };
    let start = frame.len();
    frame.resize(start + remaining, 0);
    port.read_exact(&mut frame[start..]).await?;
    Ok(frame)
}

/// Model table key for a model id register value.
fn resolve_model(model_id: u16, range: CurrentRange) -> AppResult<&'static str> {
    match model_id {
        60060..=60064 => Ok("RD6006"),
        60065 => Ok("RD6006P"),
        60120..=60124 => Ok("RD6012"),
        60125..=60129 => Ok(match range {
            CurrentRange::Low => "RD6012P_6A",
            CurrentRange::High => "RD6012P_12A",
        }),
        60180..=60189 => Ok("RD6018"),
        other => Err(CurveTraceError::UnknownModel {
            vendor: VENDOR,
            model: format!("model id {other}"),
        }),
    }
}

/// Register value of a physical quantity at the given resolution.
fn to_register(value: f64, resolution: f64) -> u16 {
    (value / resolution).round().clamp(0.0, f64::from(u16::MAX)) as u16
}

/// Driver for RIDEN RD6006(P), RD6012(P) and RD6018 supplies.
pub struct RidenDriver {
    bus: ModbusChannel,
    model: String,
    spec: DeviceSpec,
    range: CurrentRange,
}

impl RidenDriver {
    /// Factory default baud rate of the RD60xx
    pub const BAUD_RATE: u32 = 115_200;

    /// Identify the model, select the current range, raise the protection presets
    /// out of the way and switch the output off.
    pub async fn connect(
        connector: Box<dyn SerialConnector>,
        baud_rate: u32,
        settings: ModbusSettings,
        range: CurrentRange,
    ) -> AppResult<Self> {
        let mut bus = ModbusChannel::open(connector, baud_rate, settings).await?;
        let model_id = read_model_id(&mut bus).await?;
        let model = resolve_model(model_id, range)?;
        let row = lookup(VENDOR, &MODELS, model)?;
        let spec = row.to_spec(Duration::from_millis(row.settle_ms / 5));
        bus.set_device_name(format!("{} {}", VENDOR, model));
        if UNTESTED.contains(&model) {
            warn!("Operation of {} {} is untested, be careful", VENDOR, model);
        }
        info!("Connected to {} {} (model id {})", VENDOR, model, model_id);

        if model.starts_with("RD6012P") {
            let high = u16::from(range == CurrentRange::High);
            bus.write_holding(REG_CURRENT_RANGE, high).await?;
        }

        let ocp = spec.i_max + 0.1;
        info!("Adjusting OVP to {} V and OCP to {} A", OVP_MAX, ocp);
        for register in (REG_OVP_FIRST..=REG_OVP_LAST).step_by(4) {
            bus.write_holding(register, to_register(OVP_MAX, spec.v_res_set))
                .await?;
            bus.write_holding(register + 1, to_register(ocp, spec.i_res_set))
                .await?;
        }

        let mut driver = Self {
            bus,
            model: model.to_string(),
            spec,
            range,
        };
        driver.set_output(false).await?;
        Ok(driver)
    }
}

async fn read_model_id(bus: &mut ModbusChannel) -> AppResult<u16> {
    let values = bus.read_holdings(REG_MODEL, 1).await?;
    values
        .first()
        .copied()
        .ok_or_else(|| CurveTraceError::invalid_response(VENDOR, "empty model register"))
}

#[async_trait]
impl ProtocolDriver for RidenDriver {
    fn model(&self) -> &str {
        &self.model
    }

    fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    async fn identify(&mut self) -> AppResult<String> {
        let model_id = read_model_id(&mut self.bus).await?;
        resolve_model(model_id, self.range).map(str::to_string)
    }

    async fn set_voltage(&mut self, volts: f64) -> AppResult<f64> {
        let value = self.spec.quantize_voltage(volts);
        self.bus
            .write_holding(REG_V_SET, to_register(value, self.spec.v_res_set))
            .await?;
        Ok(value)
    }

    async fn set_current(&mut self, amps: f64) -> AppResult<f64> {
        let value = self.spec.quantize_current(amps);
        self.bus
            .write_holding(REG_I_SET, to_register(value, self.spec.i_res_set))
            .await?;
        Ok(value)
    }

    async fn set_output(&mut self, on: bool) -> AppResult<()> {
        self.bus.write_holding(REG_OUTPUT, u16::from(on)).await
    }

    async fn read(&mut self) -> AppResult<Reading> {
        let out = self.bus.read_holdings(REG_V_OUT, 2).await?;
        let cc = self.bus.read_holdings(REG_CC, 1).await?;
        let limiter = if cc.first() == Some(&1) {
            LimiterMode::ConstantCurrent
        } else {
            LimiterMode::ConstantVoltage
        };
        Ok(Reading::new(
            f64::from(out[0]) * self.spec.v_res_read,
            f64::from(out[1]) * self.spec.i_res_read,
            limiter,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn crc16(data: &[u8]) -> u16 {
        let mut crc = 0xFFFFu16;
        for byte in data {
            crc ^= u16::from(*byte);
            for _ in 0..8 {
                crc = if crc & 1 != 0 { (crc >> 1) ^ 0xA001 } else { crc >> 1 };
            }
        }
        crc
    }

    fn with_crc(mut frame: Vec<u8>) -> Vec<u8> {
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    /// Modbus slave with a flat register file.
    #[derive(Clone)]
    struct FakeSlave {
        registers: Arc<Mutex<Vec<u16>>>,
        silent: bool,
    }

    impl FakeSlave {
        fn new(model_id: u16) -> Self {
            let mut registers = vec![0u16; 128];
            registers[0] = model_id;
            Self {
                registers: Arc::new(Mutex::new(registers)),
                silent: false,
            }
        }

        fn reg(&self, register: usize) -> u16 {
            self.registers.lock().unwrap()[register]
        }

        fn set(&self, register: usize, value: u16) {
            self.registers.lock().unwrap()[register] = value;
        }
    }

    #[async_trait]
    impl SerialConnector for FakeSlave {
        async fn open(&self, _baud_rate: u32) -> AppResult<DynSerial> {
            let (host, mut device) = tokio::io::duplex(1024);
            let slave = self.clone();
            tokio::spawn(async move {
                let mut request = [0u8; 8];
                while device.read_exact(&mut request).await.is_ok() {
                    if slave.silent {
                        continue;
                    }
                    let register = usize::from(u16::from_be_bytes([request[2], request[3]]));
                    let arg = u16::from_be_bytes([request[4], request[5]]);
                    let reply = match request[1] {
                        0x03 => {
                            let regs = slave.registers.lock().unwrap();
                            let mut frame = vec![request[0], 0x03, (arg * 2) as u8];
                            for value in &regs[register..register + usize::from(arg)] {
                                frame.extend_from_slice(&value.to_be_bytes());
                            }
                            with_crc(frame)
                        }
                        0x06 => {
                            slave.set(register, arg);
                            request.to_vec()
                        }
                        _ => with_crc(vec![request[0], request[1] | 0x80, 0x01]),
                    };
                    if device.write_all(&reply).await.is_err() {
                        break;
                    }
                }
            });
            Ok(Box::new(host))
        }

        fn port_name(&self) -> &str {
            "fake-modbus"
        }
    }

    fn quick() -> ModbusSettings {
        ModbusSettings {
            unit_id: 1,
            timeout: Duration::from_millis(50),
            retry: RetryPolicy::new(3, Duration::from_millis(1)),
        }
    }

    #[test]
    fn model_ids() {
        assert_eq!(resolve_model(60062, CurrentRange::Low).unwrap(), "RD6006");
        assert_eq!(resolve_model(60065, CurrentRange::Low).unwrap(), "RD6006P");
        assert_eq!(resolve_model(60127, CurrentRange::High).unwrap(), "RD6012P_12A");
        assert_eq!(resolve_model(60181, CurrentRange::Low).unwrap(), "RD6018");
        assert!(resolve_model(12345, CurrentRange::Low).is_err());
        assert_eq!(CurrentRange::from_mode(Some("high")), CurrentRange::High);
    }

    #[tokio::test]
    async fn connect_raises_protection_presets() {
        let slave = FakeSlave::new(60065);
        slave.set(usize::from(REG_OUTPUT), 1);
        let psu = RidenDriver::connect(Box::new(slave.clone()), RidenDriver::BAUD_RATE, quick(), CurrentRange::Low)
            .await
            .unwrap();
        assert_eq!(psu.model(), "RD6006P");
        assert_eq!(psu.spec().read_idle, Duration::from_millis(300));
        assert_eq!(slave.reg(82), 61000);
        assert_eq!(slave.reg(83), 61000);
        assert_eq!(slave.reg(118), 61000);
        assert_eq!(slave.reg(119), 61000);
        assert_eq!(slave.reg(usize::from(REG_OUTPUT)), 0);
    }

    #[tokio::test]
    async fn rd6012p_range_register_follows_mode() {
        let slave = FakeSlave::new(60125);
        let psu = RidenDriver::connect(Box::new(slave.clone()), RidenDriver::BAUD_RATE, quick(), CurrentRange::High)
            .await
            .unwrap();
        assert_eq!(psu.model(), "RD6012P_12A");
        assert_eq!(slave.reg(usize::from(REG_CURRENT_RANGE)), 1);
        // OCP at 12.1 A with 1 mA resolution
        assert_eq!(slave.reg(83), 12100);
    }

    #[tokio::test]
    async fn setpoints_and_readback_are_scaled() {
        let slave = FakeSlave::new(60065);
        let mut psu = RidenDriver::connect(Box::new(slave.clone()), RidenDriver::BAUD_RATE, quick(), CurrentRange::Low)
            .await
            .unwrap();
        assert!((psu.set_voltage(12.3456).await.unwrap() - 12.346).abs() < 1e-9);
        psu.set_current(0.25).await.unwrap();
        assert_eq!(slave.reg(8), 12346);
        assert_eq!(slave.reg(9), 2500);

        slave.set(10, 5000);
        slave.set(11, 2500);
        slave.set(17, 1);
        let r = psu.read().await.unwrap();
        assert!((r.voltage - 5.0).abs() < 1e-9);
        assert!((r.current - 0.25).abs() < 1e-9);
        assert_eq!(r.limiter, LimiterMode::ConstantCurrent);
    }

    #[tokio::test]
    async fn silent_slave_times_out() {
        let mut slave = FakeSlave::new(60065);
        slave.silent = true;
        let err = RidenDriver::connect(Box::new(slave), RidenDriver::BAUD_RATE, quick(), CurrentRange::Low)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CurveTraceError::CommunicationTimeout { attempts: 3, .. }));
    }
}
