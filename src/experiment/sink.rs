//! Data file writer.
//!
//! Plain text, one sweep point per line, whitespace-separated columns. Header and
//! annotation lines start with `%`. Every line is flushed as soon as it is written,
//! so an aborted run leaves a readable file.

use super::point::{ColumnFormat, SweepPoint};
use crate::error::AppResult;
use chrono::{DateTime, Local};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Column descriptions, in column order.
pub const COLUMN_TITLES: [&str; 11] = [
    "PSU1 nominal voltage setting (V)",
    "PSU1 current limit (A)",
    "PSU1 measured voltage (V)",
    "PSU1 measured current (A)",
    "PSU1 limiter flag (1 = limited)",
    "PSU2 nominal voltage setting (V)",
    "PSU2 current limit (A)",
    "PSU2 measured voltage (V)",
    "PSU2 measured current (A)",
    "PSU2 limiter flag (1 = limited)",
    "Heaterblock temperature (°C)",
];

/// Run description written at the top of a data file.
#[derive(Debug, Clone)]
pub struct RunHeader {
    /// Sample name
    pub sample: String,
    /// Start of the run
    pub started: DateTime<Local>,
    /// Control resistor between PSU2 and the DUT (Ω)
    pub r2control: Option<f64>,
    /// Pre-heat only, no sweep
    pub quick: bool,
}

/// Operating point reached at the end of a regulated pre-heat / idle period.
///
/// `U0`/`I0` belong to the supply held at its fixed idle voltage, `Uc`/`Ic` to the
/// regulating supply. Values include the supply polarity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OperatingPoint {
    /// Fixed supply voltage (V)
    pub u0: f64,
    /// Fixed supply current (A)
    pub i0: f64,
    /// Regulating supply voltage (V)
    pub uc: f64,
    /// Regulating supply current (A)
    pub ic: f64,
    /// Read decimals of the fixed supply
    pub fix_format: ColumnFormat,
    /// Read decimals of the regulating supply
    pub reg_format: ColumnFormat,
    /// Heater block temperature (°C)
    pub temperature: Option<f64>,
}

/// Writes sweep points and annotations to a data file.
pub struct DataFileWriter<W: Write> {
    out: W,
    psu1: ColumnFormat,
    psu2: ColumnFormat,
}

impl DataFileWriter<BufWriter<File>> {
    /// Create a new data file; an existing file is never overwritten.
    pub fn create(path: &Path, psu1: ColumnFormat, psu2: ColumnFormat) -> AppResult<Self> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        info!("Logging output to {}", path.display());
        Ok(Self::new(BufWriter::new(file), psu1, psu2))
    }
}

impl<W: Write> DataFileWriter<W> {
    /// Writer on top of any byte sink.
    pub fn new(out: W, psu1: ColumnFormat, psu2: ColumnFormat) -> Self {
        Self { out, psu1, psu2 }
    }

    /// Write one `%` comment line.
    pub fn comment(&mut self, text: &str) -> io::Result<()> {
        writeln!(self.out, "% {text}")?;
        self.out.flush()
    }

    /// Write the run header and, unless in quick mode, the column descriptions.
    pub fn write_header(&mut self, header: &RunHeader) -> io::Result<()> {
        self.comment(&format!("* Sample: {}", header.sample))?;
        self.comment(&format!(
            "* Date / time: {}",
            header.started.format("%Y-%m-%d %H:%M:%S")
        ))?;
        match header.r2control {
            Some(ohms) => self.comment(&format!("* R2CONTROL = {ohms} Ohm"))?,
            None => self.comment("* R2CONTROL = NOT SPECIFIED")?,
        }
        if header.quick {
            self.comment("* Running in quick mode (pre-heating only, no curve tracing)")?;
        } else {
            for (k, title) in COLUMN_TITLES.iter().enumerate() {
                self.comment(&format!("Column {:>2}: {}", k + 1, title))?;
            }
        }
        Ok(())
    }

    /// Write the operating point reached at the end of pre-heat / idle.
    pub fn write_operating_point(&mut self, op: &OperatingPoint) -> io::Result<()> {
        let t = op
            .temperature
            .map_or_else(|| "NA".to_string(), |t| format!("{t:.2}"));
        self.comment(&format!(
            "* OPERATING POINT AT END OF PREHEAT / IDLE: U0 = {:.*} V  I0 = {:.*} A  Uc = {:.*} V  Ic = {:.*} A  T = {} °C",
            op.fix_format.v_read,
            op.u0,
            op.fix_format.i_read,
            op.i0,
            op.reg_format.v_read,
            op.uc,
            op.reg_format.i_read,
            op.ic,
            t
        ))
    }

    /// Append one data row.
    pub fn write_point(&mut self, point: &SweepPoint) -> io::Result<()> {
        writeln!(self.out, "{}", point.format_row(&self.psu1, &self.psu2))?;
        self.out.flush()
    }

    /// Give back the underlying sink.
    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Data file name of a sample: `<dir>/<base>.dat`, or `<dir>/<base>_<step>.dat` in
/// batch mode.
pub fn data_file_path(dir: &Path, base: &str, step: Option<u32>) -> PathBuf {
    let name = match step {
        Some(step) => format!("{base}_{step}.dat"),
        None => format!("{base}.dat"),
    };
    dir.join(name)
}

/// Sample name matching [`data_file_path`].
pub fn sample_name(base: &str, step: Option<u32>) -> String {
    match step {
        Some(step) => format!("{base}_{step}"),
        None => base.to_string(),
    }
}
