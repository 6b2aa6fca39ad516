//! Serial transport shared by all ASCII command-set drivers.
//!
//! # Types
//!
//! - [`SerialPortIO`]: trait alias combining AsyncRead + AsyncWrite for serial ports
//! - [`DynSerial`]: type-erased boxed serial port
//! - [`SerialConnector`]: opens (and re-opens) the port of one device at a given baud rate
//! - [`LineChannel`]: line-framed command/response channel with bounded retries
//!
//! # Utilities
//!
//! - [`open_serial_async`]: open a serial port with spawn_blocking
//! - [`drain_serial_buffer`]: drain stale data from a serial port
//!
//! # Example
//!
//! ```rust,ignore
//! use psu_curvetrace::hardware::serial::{LineChannel, LineSettings, TokioSerialConnector};
//!
//! let connector = Box::new(TokioSerialConnector::new("/dev/ttyUSB0"));
//! let mut channel = LineChannel::open(connector, 9600, LineSettings::lf()).await?;
//! let idn = channel.query("*IDN?").await?;
//! ```

use crate::error::{AppResult, CurveTraceError};
use crate::error_recovery::{Retry, RetryPolicy};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, trace};

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Opens the port of one device.
///
/// Drivers that have to discover the baud rate close their port and call
/// [`SerialConnector::open`] again with the next candidate rate.
#[async_trait]
pub trait SerialConnector: Send + Sync {
    /// Open the port at `baud_rate` (8N1, no flow control).
    async fn open(&self, baud_rate: u32) -> AppResult<DynSerial>;

    /// Port path, used in log messages and errors
    fn port_name(&self) -> &str;
}

/// [`SerialConnector`] for a real serial port.
#[derive(Debug, Clone)]
pub struct TokioSerialConnector {
    path: String,
}

impl TokioSerialConnector {
    /// Connector for the port at `path` (e.g. "/dev/ttyUSB0", "COM3").
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SerialConnector for TokioSerialConnector {
    async fn open(&self, baud_rate: u32) -> AppResult<DynSerial> {
        let stream = open_serial_async(&self.path, baud_rate).await?;
        Ok(Box::new(stream))
    }

    fn port_name(&self) -> &str {
        &self.path
    }
}

/// Open a serial port asynchronously using spawn_blocking.
///
/// Standard settings are applied: 8N1, no flow control. On Unix the port is
/// claimed for exclusive access so no second process can talk to the device.
///
/// # Errors
///
/// Returns an error if the port cannot be opened or spawn_blocking fails.
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
) -> AppResult<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    let path = port_path.to_string();
    let opened = tokio::task::spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
    })
    .await
    .map_err(std::io::Error::other)?;

    #[allow(unused_mut)]
    let mut stream = opened?;
    #[cfg(unix)]
    stream.set_exclusive(true)?;
    Ok(stream)
}

/// Drain stale data from a serial port buffer.
///
/// Reads and discards data until nothing arrives within `timeout_ms`.
///
/// # Returns
///
/// Total number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    total_discarded
}

/// Framing and timing of a [`LineChannel`].
#[derive(Debug, Clone)]
pub struct LineSettings {
    /// Byte terminating commands and replies
    pub terminator: u8,
    /// How long to wait for one reply line
    pub timeout: Duration,
    /// Attempt ceiling and pause for queries
    pub retry: RetryPolicy,
    /// How long to keep draining stale input between attempts (ms)
    pub drain_ms: u64,
}

impl LineSettings {
    /// LF-terminated lines.
    pub fn lf() -> Self {
        Self {
            terminator: b'\n',
            timeout: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            drain_ms: 50,
        }
    }

    /// CR-terminated lines.
    pub fn cr() -> Self {
        Self {
            terminator: b'\r',
            ..Self::lf()
        }
    }

    /// Set the reply timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Line-framed command/response channel to one device.
pub struct LineChannel {
    connector: Box<dyn SerialConnector>,
    port: BufReader<DynSerial>,
    baud_rate: u32,
    settings: LineSettings,
    device: String,
}

impl LineChannel {
    /// Open the device port at `baud_rate`.
    pub async fn open(
        connector: Box<dyn SerialConnector>,
        baud_rate: u32,
        settings: LineSettings,
    ) -> AppResult<Self> {
        let port = connector.open(baud_rate).await?;
        let device = connector.port_name().to_string();
        Ok(Self {
            connector,
            port: BufReader::new(port),
            baud_rate,
            settings,
            device,
        })
    }

    /// Name used in errors and logs; defaults to the port path.
    pub fn set_device_name(&mut self, name: impl Into<String>) {
        self.device = name.into();
    }

    /// Name used in errors and logs.
    pub fn device_name(&self) -> &str {
        &self.device
    }

    /// Baud rate the port is currently open at.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Framing and timing in use.
    pub fn settings(&self) -> &LineSettings {
        &self.settings
    }

    /// Close the port and open it again at `baud_rate`.
    pub async fn reopen(&mut self, baud_rate: u32) -> AppResult<()> {
        let _ = self.port.get_mut().shutdown().await;
        let port = self.connector.open(baud_rate).await?;
        self.port = BufReader::new(port);
        self.baud_rate = baud_rate;
        Ok(())
    }

    /// Send one command line without waiting for a reply.
    pub async fn send(&mut self, command: &str) -> AppResult<()> {
        trace!(device = %self.device, "<- {}", command);
        let mut frame = Vec::with_capacity(command.len() + 1);
        frame.extend_from_slice(command.as_bytes());
        frame.push(self.settings.terminator);
        let port = self.port.get_mut();
        port.write_all(&frame).await?;
        port.flush().await?;
        Ok(())
    }

    /// Discard everything buffered or still arriving on the input side.
    pub async fn drain(&mut self) -> usize {
        let buffered = self.port.buffer().len();
        self.port.consume(buffered);
        let discarded = buffered + drain_serial_buffer(self.port.get_mut(), self.settings.drain_ms).await;
        if discarded > 0 {
            debug!(device = %self.device, "Discarded {} stale bytes", discarded);
        }
        discarded
    }

    /// Read one reply line. `None` on timeout, end of stream or an empty line.
    pub async fn read_line(&mut self) -> AppResult<Option<String>> {
        Ok(self.read_raw_line().await?.and_then(|raw| {
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            (!line.is_empty()).then_some(line)
        }))
    }

    /// Read one reply line as raw bytes, without line terminators.
    pub async fn read_raw_line(&mut self) -> AppResult<Option<Vec<u8>>> {
        let mut buf = Vec::new();
        let read = tokio::time::timeout(
            self.settings.timeout,
            self.port.read_until(self.settings.terminator, &mut buf),
        )
        .await;
        match read {
            Err(_) | Ok(Ok(0)) => Ok(None),
            Ok(Ok(_)) => {
                while matches!(buf.last(), Some(b'\r' | b'\n')) {
                    buf.pop();
                }
                trace!(device = %self.device, "-> {:?}", String::from_utf8_lossy(&buf));
                Ok((!buf.is_empty()).then_some(buf))
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }

    /// Send `command` and return the raw bytes of the reply line.
    ///
    /// For replies that carry binary status bytes instead of text.
    pub async fn query_raw(&mut self, command: &str) -> AppResult<Vec<u8>> {
        let policy = self.settings.retry.clone();
        let mut retry = Retry::new(&policy);
        while retry.next_attempt().await {
            self.send(command).await?;
            if let Some(raw) = self.read_raw_line().await? {
                return Ok(raw);
            }
            self.drain().await;
        }
        Err(retry.exhausted(&self.device, command))
    }

    /// Send `command` and return the first reply line, retrying per the channel policy.
    pub async fn query(&mut self, command: &str) -> AppResult<String> {
        let policy = self.settings.retry.clone();
        self.query_with(command, &policy).await
    }

    /// Send `command` and return the first reply line, retrying per `policy`.
    ///
    /// # Errors
    /// `CommunicationTimeout` once every attempt went unanswered.
    pub async fn query_with(&mut self, command: &str, policy: &RetryPolicy) -> AppResult<String> {
        let mut retry = Retry::new(policy);
        while retry.next_attempt().await {
            if retry.attempts() > 1 {
                debug!(device = %self.device, attempt = retry.attempts(), "Retrying '{}'", command);
            }
            self.send(command).await?;
            if let Some(line) = self.read_line().await? {
                return Ok(line);
            }
            self.drain().await;
        }
        Err(retry.exhausted(&self.device, command))
    }

    /// Send `command` and parse the reply as a number.
    ///
    /// Garbled replies are retried like missing ones.
    pub async fn query_number(&mut self, command: &str) -> AppResult<f64> {
        let policy = self.settings.retry.clone();
        let mut retry = Retry::new(&policy);
        while retry.next_attempt().await {
            self.send(command).await?;
            if let Some(line) = self.read_line().await? {
                match line.parse::<f64>() {
                    Ok(value) => return Ok(value),
                    Err(_) => debug!(device = %self.device, "Garbled reply '{}' to '{}'", line, command),
                }
            }
            self.drain().await;
        }
        Err(retry.exhausted(&self.device, command))
    }

    /// Find the baud rate the device answers `command` at.
    ///
    /// Tries every rate in order with a single attempt, closing and re-opening the
    /// port in between and pausing `pause` after every silent rate.
    ///
    /// # Returns
    /// The first reply received. The channel stays open at that rate.
    pub async fn probe_baud_rates(
        &mut self,
        rates: &[u32],
        command: &str,
        pause: Duration,
    ) -> AppResult<String> {
        for &rate in rates {
            if rate != self.baud_rate {
                self.reopen(rate).await?;
            }
            self.drain().await;
            match self.query_with(command, &RetryPolicy::single_shot()).await {
                Ok(reply) => {
                    debug!(device = %self.device, "Device answered at {} baud", rate);
                    return Ok(reply);
                }
                Err(CurveTraceError::CommunicationTimeout { .. }) => {
                    debug!(device = %self.device, "No answer at {} baud", rate);
                    tokio::time::sleep(pause).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(CurveTraceError::CommunicationTimeout {
            device: self.device.clone(),
            command: command.to_string(),
            attempts: rates.len() as u32,
        })
    }

    /// Send `command` and collect reply lines up to (excluding) `end_marker`.
    ///
    /// Used by devices that acknowledge every command with a fixed trailer line.
    pub async fn query_block(&mut self, command: &str, end_marker: &str) -> AppResult<Vec<String>> {
        let policy = self.settings.retry.clone();
        let mut retry = Retry::new(&policy);
        'attempts: while retry.next_attempt().await {
            if retry.attempts() > 1 {
                debug!(device = %self.device, attempt = retry.attempts(), "Retrying '{}'", command);
            }
            self.send(command).await?;
            let mut lines = Vec::new();
            loop {
                match self.read_line().await? {
                    Some(line) if line == end_marker => return Ok(lines),
                    Some(line) => lines.push(line),
                    None => {
                        self.drain().await;
                        continue 'attempts;
                    }
                }
            }
        }
        Err(retry.exhausted(&self.device, command))
    }
}

/// Scripted serial devices for driver tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Handler = dyn Fn(u32, &str) -> Option<String> + Send + Sync;

    /// A connector whose "device" is a closure answering command lines.
    ///
    /// The closure receives the baud rate the port was opened at and the command
    /// line without terminator; `None` means the device stays silent.
    #[derive(Clone)]
    pub(crate) struct FakeDevice {
        handler: Arc<Handler>,
        terminator: u8,
        pub log: Arc<Mutex<Vec<String>>>,
        pub opened_at: Arc<Mutex<Vec<u32>>>,
    }

    impl FakeDevice {
        pub(crate) fn new(
            terminator: u8,
            handler: impl Fn(u32, &str) -> Option<String> + Send + Sync + 'static,
        ) -> Self {
            Self {
                handler: Arc::new(handler),
                terminator,
                log: Arc::new(Mutex::new(Vec::new())),
                opened_at: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub(crate) fn commands(&self) -> Vec<String> {
            self.log.lock().map(|l| l.clone()).unwrap_or_default()
        }

        pub(crate) fn boxed(&self) -> Box<dyn SerialConnector> {
            Box::new(self.clone())
        }
    }

    #[async_trait]
    impl SerialConnector for FakeDevice {
        async fn open(&self, baud_rate: u32) -> AppResult<DynSerial> {
            if let Ok(mut opened) = self.opened_at.lock() {
                opened.push(baud_rate);
            }
            let (host, device) = tokio::io::duplex(4096);
            let handler = self.handler.clone();
            let log = self.log.clone();
            let terminator = self.terminator;
            tokio::spawn(async move {
                let (rx, mut tx) = tokio::io::split(device);
                let mut rx = BufReader::new(rx);
                loop {
                    let mut buf = Vec::new();
                    match rx.read_until(terminator, &mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                    let line = String::from_utf8_lossy(&buf).trim().to_string();
                    if let Ok(mut log) = log.lock() {
                        log.push(line.clone());
                    }
                    if let Some(reply) = handler(baud_rate, &line) {
                        if tx.write_all(reply.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                }
            });
            Ok(Box::new(host))
        }

        fn port_name(&self) -> &str {
            "fake"
        }
    }

    /// Fast settings for tests: short timeout, few attempts.
    pub(crate) fn quick(settings: LineSettings) -> LineSettings {
        settings
            .with_timeout(Duration::from_millis(50))
            .with_retry(RetryPolicy::new(3, Duration::from_millis(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{quick, FakeDevice};
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn query_returns_first_line() {
        let dev = FakeDevice::new(b'\n', |_, cmd| match cmd {
            "*IDN?" => Some("ACME PSU1\n".into()),
            _ => None,
        });
        let mut ch = LineChannel::open(dev.boxed(), 9600, quick(LineSettings::lf()))
            .await
            .unwrap();
        assert_eq!(ch.query("*IDN?").await.unwrap(), "ACME PSU1");
        assert_eq!(dev.commands(), vec!["*IDN?".to_string()]);
    }

    #[tokio::test]
    async fn query_retries_dropped_replies() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let dev = FakeDevice::new(b'\n', move |_, _| {
            // drop the first reply
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                None
            } else {
                Some("1.234\n".into())
            }
        });
        let mut ch = LineChannel::open(dev.boxed(), 9600, quick(LineSettings::lf()))
            .await
            .unwrap();
        assert_eq!(ch.query("VOUT?").await.unwrap(), "1.234");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn silent_device_times_out_with_attempt_count() {
        let dev = FakeDevice::new(b'\n', |_, _| None);
        let mut ch = LineChannel::open(dev.boxed(), 9600, quick(LineSettings::lf()))
            .await
            .unwrap();
        match ch.query("VOUT?").await {
            Err(CurveTraceError::CommunicationTimeout { attempts, command, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(command, "VOUT?");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn query_block_collects_until_marker() {
        let dev = FakeDevice::new(b'\r', |_, cmd| match cmd {
            "GETD" => Some("060001230\rOK\r".into()),
            _ => Some("OK\r".into()),
        });
        let mut ch = LineChannel::open(dev.boxed(), 9600, quick(LineSettings::cr()))
            .await
            .unwrap();
        assert_eq!(ch.query_block("GETD", "OK").await.unwrap(), vec!["060001230"]);
        assert!(ch.query_block("SOUT0", "OK").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reopen_switches_baud_rate() {
        let dev = FakeDevice::new(b'\n', |baud, _| (baud == 19200).then(|| "hello\n".to_string()));
        let mut ch = LineChannel::open(dev.boxed(), 9600, quick(LineSettings::lf()))
            .await
            .unwrap();
        assert!(ch.query_with("*IDN?", &RetryPolicy::single_shot()).await.is_err());
        ch.reopen(19200).await.unwrap();
        assert_eq!(ch.baud_rate(), 19200);
        assert_eq!(ch.query("*IDN?").await.unwrap(), "hello");
        assert_eq!(*dev.opened_at.lock().unwrap(), vec![9600, 19200]);
    }

    #[tokio::test]
    async fn garbled_numbers_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let dev = FakeDevice::new(b'\n', move |_, _| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Some("1.2#4\n".into())
            } else {
                Some("1.234\n".into())
            }
        });
        let mut ch = LineChannel::open(dev.boxed(), 9600, quick(LineSettings::lf()))
            .await
            .unwrap();
        assert_eq!(ch.query_number("MEASURE:VOLTAGE?").await.unwrap(), 1.234);
    }

    #[tokio::test(start_paused = true)]
    async fn baud_probe_walks_the_list() {
        let dev = FakeDevice::new(b'\n', |baud, _| (baud == 38400).then(|| "B&K PRECISION,9120A\n".to_string()));
        let mut ch = LineChannel::open(dev.boxed(), 57600, quick(LineSettings::lf()))
            .await
            .unwrap();
        let reply = ch
            .probe_baud_rates(&[57600, 38400, 19200], "*IDN?", Duration::from_millis(1500))
            .await
            .unwrap();
        assert_eq!(reply, "B&K PRECISION,9120A");
        assert_eq!(ch.baud_rate(), 38400);
        assert_eq!(*dev.opened_at.lock().unwrap(), vec![57600, 38400]);
    }

    #[tokio::test(start_paused = true)]
    async fn baud_probe_gives_up() {
        let dev = FakeDevice::new(b'\n', |_, _| None);
        let mut ch = LineChannel::open(dev.boxed(), 9600, quick(LineSettings::lf()))
            .await
            .unwrap();
        let err = ch
            .probe_baud_rates(&[9600, 4800], "*IDN?", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CurveTraceError::CommunicationTimeout { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_drain_serial_buffer() {
        let (mut host, mut device) = tokio::io::duplex(64);
        host.write_all(b"stale data 12345").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(drain_serial_buffer(&mut device, 50).await, 16);
    }
}
