//! Heater block temperature sensing
//!
//! The heater block carries a DS18B20 on a one-wire bus. The bus is driven by a
//! plain UART (TX and RX tied together through a diode): every one-wire time slot
//! is one UART byte at 115200 baud, and the reset pulse is a 0xF0 byte at 9600 baud.
//! Devices on the bus pull the echo low, which is how bits are read back.
//!
//! The bus is a shared resource. [`Ds18b20`] holds the [`SharedBus`] lock for one
//! whole transaction only, and yields for [`BUS_RELEASE_PAUSE`] afterwards so other
//! users of the same adapter get their turn.

use crate::error::{AppResult, CurveTraceError};
use crate::hardware::serial::{drain_serial_buffer, DynSerial, SerialConnector};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Pause after releasing the bus lock.
pub const BUS_RELEASE_PAUSE: Duration = Duration::from_millis(13);

const RESET_BAUD: u32 = 9600;
const DATA_BAUD: u32 = 115_200;
const RESET_PULSE: u8 = 0xF0;

const CMD_SKIP_ROM: u8 = 0xCC;
const CMD_MATCH_ROM: u8 = 0x55;
const CMD_CONVERT_T: u8 = 0x44;
const CMD_READ_SCRATCHPAD: u8 = 0xBE;

/// Anything that reports a temperature in °C.
#[async_trait]
pub trait TemperatureSensor: Send {
    /// Take one temperature reading (°C).
    async fn temperature(&mut self) -> AppResult<f64>;
}

/// Byte-level access to a one-wire bus.
#[async_trait]
pub trait OneWireBus: Send {
    /// Issue a reset pulse. Returns whether any device answered with a presence pulse.
    async fn reset(&mut self) -> AppResult<bool>;

    /// Run eight time slots, LSB first, and return the bits seen on the bus.
    ///
    /// Writing 0xFF is a read: devices pull the 1-bits they want to send low.
    async fn touch_byte(&mut self, byte: u8) -> AppResult<u8>;

    /// Write one byte.
    async fn write_byte(&mut self, byte: u8) -> AppResult<()> {
        self.touch_byte(byte).await.map(|_| ())
    }

    /// Read one byte.
    async fn read_byte(&mut self) -> AppResult<u8> {
        self.touch_byte(0xFF).await
    }
}

/// One-wire bus shared between several users.
pub type SharedBus<B> = Arc<Mutex<B>>;

/// One-wire master on a UART adapter.
pub struct UartOneWire {
    connector: Box<dyn SerialConnector>,
    port: DynSerial,
    timeout: Duration,
}

impl UartOneWire {
    /// Open the adapter port.
    pub async fn open(connector: Box<dyn SerialConnector>) -> AppResult<Self> {
        let port = connector.open(DATA_BAUD).await?;
        Ok(Self {
            connector,
            port,
            timeout: Duration::from_millis(100),
        })
    }

    /// Wrap the adapter for shared use.
    pub fn shared(self) -> SharedBus<Self> {
        Arc::new(Mutex::new(self))
    }

    async fn reopen(&mut self, baud_rate: u32) -> AppResult<()> {
        let _ = self.port.shutdown().await;
        self.port = self.connector.open(baud_rate).await?;
        Ok(())
    }

    async fn exchange(&mut self, slots: &[u8]) -> AppResult<Option<Vec<u8>>> {
        self.port.write_all(slots).await?;
        self.port.flush().await?;
        let mut echo = vec![0u8; slots.len()];
        match tokio::time::timeout(self.timeout, self.port.read_exact(&mut echo)).await {
            Err(_) => Ok(None),
            Ok(Ok(_)) => Ok(Some(echo)),
            Ok(Err(e)) => Err(e.into()),
        }
    }
}

#[async_trait]
impl OneWireBus for UartOneWire {
    async fn reset(&mut self) -> AppResult<bool> {
        self.reopen(RESET_BAUD).await?;
        drain_serial_buffer(&mut self.port, 5).await;
        let echo = self.exchange(&[RESET_PULSE]).await?;
        self.reopen(DATA_BAUD).await?;
        let presence = matches!(echo.as_deref(), Some([byte]) if *byte != RESET_PULSE);
        trace!(port = %self.connector.port_name(), "reset echo {:02X?}, presence {}", echo, presence);
        Ok(presence)
    }

    async fn touch_byte(&mut self, byte: u8) -> AppResult<u8> {
        let slots: Vec<u8> = (0..8)
            .map(|bit| if byte >> bit & 1 == 1 { 0xFF } else { 0x00 })
            .collect();
        let echo = self.exchange(&slots).await?.ok_or_else(|| CurveTraceError::CommunicationTimeout {
            device: format!("one-wire adapter {}", self.connector.port_name()),
            command: format!("{byte:#04X}"),
            attempts: 1,
        })?;
        Ok(echo
            .iter()
            .enumerate()
            .fold(0u8, |acc, (bit, slot)| if *slot == 0xFF { acc | 1 << bit } else { acc }))
    }
}

/// Dallas/Maxim CRC-8 (polynomial x^8 + x^5 + x^4 + 1, reflected).
pub fn crc8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |mut crc, byte| {
        let mut b = *byte;
        for _ in 0..8 {
            let mix = (crc ^ b) & 1;
            crc >>= 1;
            if mix != 0 {
                crc ^= 0x8C;
            }
            b >>= 1;
        }
        crc
    })
}

/// Parse a 16-digit hex ROM code ("28FF1C6A50160426") into its 8 bytes.
pub fn parse_rom_code(code: &str) -> Option<[u8; 8]> {
    let code = code.trim();
    if code.len() != 16 || !code.is_ascii() {
        return None;
    }
    let mut rom = [0u8; 8];
    for (i, byte) in rom.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&code[2 * i..2 * i + 2], 16).ok()?;
    }
    Some(rom)
}

/// DS18B20 temperature sensor on a shared one-wire bus.
pub struct Ds18b20<B: OneWireBus> {
    bus: SharedBus<B>,
    rom: Option<[u8; 8]>,
    lock_timeout: Duration,
    conversion_time: Duration,
}

impl<B: OneWireBus> Ds18b20<B> {
    /// Sensor addressed by `rom`, or the only device on the bus if `None`.
    pub fn new(bus: SharedBus<B>, rom: Option<[u8; 8]>) -> Self {
        Self {
            bus,
            rom,
            lock_timeout: Duration::from_secs(5),
            conversion_time: Duration::from_millis(750),
        }
    }

    /// Give up on the bus lock after `timeout`.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    async fn select(bus: &mut B, rom: Option<[u8; 8]>) -> AppResult<()> {
        if !bus.reset().await? {
            return Err(CurveTraceError::NotConnected("no device on the one-wire bus".into()));
        }
        match rom {
            Some(rom) => {
                bus.write_byte(CMD_MATCH_ROM).await?;
                for byte in rom {
                    bus.write_byte(byte).await?;
                }
            }
            None => bus.write_byte(CMD_SKIP_ROM).await?,
        }
        Ok(())
    }

    async fn transaction(&self, bus: &mut B) -> AppResult<f64> {
        Self::select(bus, self.rom).await?;
        bus.write_byte(CMD_CONVERT_T).await?;
        tokio::time::sleep(self.conversion_time).await;

        Self::select(bus, self.rom).await?;
        bus.write_byte(CMD_READ_SCRATCHPAD).await?;
        let mut scratchpad = [0u8; 9];
        for byte in scratchpad.iter_mut() {
            *byte = bus.read_byte().await?;
        }
        if crc8(&scratchpad[..8]) != scratchpad[8] {
            return Err(CurveTraceError::invalid_response(
                "DS18B20",
                format!("scratchpad CRC mismatch {:02X?}", scratchpad),
            ));
        }
        Ok(f64::from(i16::from_le_bytes([scratchpad[0], scratchpad[1]])) / 16.0)
    }
}

#[async_trait]
impl<B: OneWireBus + 'static> TemperatureSensor for Ds18b20<B> {
    async fn temperature(&mut self) -> AppResult<f64> {
        let result = {
            let mut bus = tokio::time::timeout(self.lock_timeout, self.bus.lock())
                .await
                .map_err(|_| CurveTraceError::Heater("timed out waiting for the one-wire bus".into()))?;
            self.transaction(&mut bus).await
        };
        tokio::time::sleep(BUS_RELEASE_PAUSE).await;
        if let Ok(t) = &result {
            debug!("DS18B20: {:.4} °C", t);
        }
        result
    }
}
