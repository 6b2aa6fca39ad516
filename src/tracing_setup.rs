//! Logging setup for the curve tracer.
//!
//! The library only emits `tracing` events; the binary (or a test) installs the
//! subscriber once with [`init`]. Levels used across the crate:
//!
//! - `trace`: serial wire traffic of the drivers
//! - `debug`: retries, settle polls, heater control steps
//! - `info`: run lifecycle and every data row
//! - `warn`: adjusted profile values, settle timeouts, dropped plot messages
//!
//! `RUST_LOG` takes precedence over everything configured here.
//!
//! # Example
//! ```no_run
//! use psu_curvetrace::{config::TesterConfig, tracing_setup};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TesterConfig::load_from("config/tester.toml")?;
//! tracing_setup::init_from_config(&config)?;
//! info!("Curve tracer started");
//! # Ok(())
//! # }
//! ```

use crate::config::TesterConfig;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Module emitting the wire traffic of the serial drivers
const WIRE_TARGET: &str = "psu_curvetrace::hardware";

/// Log line layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, colored (interactive sessions)
    Pretty,
    /// One line per event (unattended runs, the default)
    Compact,
    /// JSON lines (log collection)
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("Unknown log format '{other}'. Must be one of: pretty, compact, json")),
        }
    }
}

/// Subscriber settings.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Level of the curve tracer's own events
    pub level: Level,
    /// Line layout
    pub format: OutputFormat,
    /// Log span open/close events
    pub with_span_events: bool,
    /// Log serial wire traffic regardless of `level`
    pub wire_trace: bool,
    /// Source file and line of every event
    pub with_file_and_line: bool,
    /// Colors (Pretty only)
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            wire_trace: false,
            with_file_and_line: false,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Settings for the configured `application.log_level`.
    pub fn from_tester_config(config: &TesterConfig) -> Result<Self, String> {
        Ok(Self::new(parse_log_level(&config.application.log_level)?))
    }

    /// Settings with `level` and defaults otherwise.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set the line layout.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Log span open/close events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Log the serial traffic of every driver.
    pub fn with_wire_trace(mut self, enabled: bool) -> Self {
        self.wire_trace = enabled;
        self
    }

    /// Include source locations.
    pub fn with_file_and_line(mut self, enabled: bool) -> Self {
        self.with_file_and_line = enabled;
        self
    }

    /// Enable or disable colors.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    /// `EnvFilter` directives: the configured level for this crate, warnings for
    /// everything else.
    pub fn filter_directives(&self) -> String {
        let level = self.level.as_str().to_ascii_lowercase();
        let mut directives = format!("warn,psu_curvetrace={level}");
        if self.wire_trace {
            directives.push_str(&format!(",{WIRE_TARGET}=trace"));
        }
        directives
    }
}

/// Install the subscriber for a tester configuration.
pub fn init_from_config(config: &TesterConfig) -> Result<(), String> {
    init(TracingConfig::from_tester_config(config)?)
}

/// Install the global subscriber.
///
/// A second call is a no-op, so tests may call it freely.
pub fn init(config: TracingConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    match tracing_subscriber::registry()
        .with(format_layer(&config).with_filter(filter))
        .try_init()
    {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("global default trace dispatcher has already been set") => Ok(()),
        Err(e) => Err(format!("Failed to initialize logging: {e}")),
    }
}

fn format_layer(config: &TracingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let layer = fmt::layer()
        .with_span_events(span_events)
        .with_target(config.with_file_and_line)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line);

    match config.format {
        OutputFormat::Pretty => layer.pretty().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Compact => layer.compact().with_ansi(false).boxed(),
        OutputFormat::Json => layer.json().boxed(),
    }
}

/// Parse trace|debug|info|warn|error, case-insensitive.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    Level::from_str(level.trim())
        .ok()
        .filter(|_| !level.trim().chars().all(|c| c.is_ascii_digit()))
        .ok_or_else(|| {
            format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                level
            )
        })
}
