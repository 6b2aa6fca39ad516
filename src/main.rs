//! CLI entry point of the curve tracer.
//!
//! # Usage
//!
//! Trace curves with the supplies of a tester configuration:
//! ```bash
//! curvetrace run --config config/tester.toml --dut config/dut_npn.toml
//! ```
//!
//! Batch mode, one data file per DUT, prompting between runs:
//! ```bash
//! curvetrace run --config config/tester.toml --dut config/dut_npn.toml --batch
//! ```
//!
//! Show what is connected:
//! ```bash
//! curvetrace identify --config config/tester.toml
//! ```
//!
//! Try a DUT file without hardware:
//! ```bash
//! curvetrace simulate --dut config/dut_npn.toml --heater
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use psu_curvetrace::config::{DutConfig, TesterConfig};
use psu_curvetrace::experiment::{
    data_file_path, sample_name, spawn_consumer, CancelFlag, DataFileWriter, SweepEngine, TracingRenderer,
};
use psu_curvetrace::hardware::connect_unit;
use psu_curvetrace::heater::HeaterController;
use psu_curvetrace::supply::LogicalSupply;
use psu_curvetrace::tracing_setup::{self, OutputFormat, TracingConfig};
use psu_curvetrace::CurveTraceError;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "curvetrace")]
#[command(about = "I-V curve tracer for bench power supplies", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log layout: pretty, compact or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: OutputFormat,

    /// Log the serial traffic of every driver
    #[arg(long, global = true)]
    wire_trace: bool,
}

impl Cli {
    fn init_logging(&self, tester: &TesterConfig) -> Result<()> {
        let config = TracingConfig::from_tester_config(tester)
            .map_err(anyhow::Error::msg)?
            .with_format(self.log_format)
            .with_wire_trace(self.wire_trace);
        tracing_setup::init(config).map_err(anyhow::Error::msg)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Trace curves with the configured hardware
    Run {
        /// Tester configuration (TOML)
        #[arg(long)]
        config: PathBuf,

        /// DUT configuration (TOML)
        #[arg(long)]
        dut: PathBuf,

        #[command(flatten)]
        options: RunOptions,
    },

    /// Connect every configured unit and print its model and envelope
    Identify {
        /// Tester configuration (TOML)
        #[arg(long)]
        config: PathBuf,
    },

    /// Trace curves on simulated supplies
    Simulate {
        /// DUT configuration (TOML)
        #[arg(long)]
        dut: PathBuf,

        /// Load resistance of the simulated PSU1 (Ω)
        #[arg(long, default_value_t = 100.0)]
        load1: f64,

        /// Load resistance of the simulated PSU2 (Ω)
        #[arg(long, default_value_t = 1000.0)]
        load2: f64,

        /// Add a simulated heater block
        #[arg(long)]
        heater: bool,

        /// Directory for the data files
        #[arg(long)]
        data_dir: Option<PathBuf>,

        #[command(flatten)]
        options: RunOptions,
    },
}

#[derive(clap::Args, Debug, Clone)]
struct RunOptions {
    /// Sample name; overrides the DUT file
    #[arg(long)]
    sample: Option<String>,

    /// Pre-heat only, no sweep
    #[arg(long)]
    quick: bool,

    /// Test several samples in a row, one data file each
    #[arg(long)]
    batch: bool,

    /// Data file (single runs only); `<data_dir>/<sample>.dat` if unset
    #[arg(long, conflicts_with = "batch")]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run { config, dut, options } => {
            let tester = TesterConfig::load_from(config)
                .with_context(|| format!("loading tester configuration {}", config.display()))?;
            tester
                .validate()
                .map_err(anyhow::Error::msg)
                .context("invalid tester configuration")?;
            cli.init_logging(&tester)?;
            let dut = load_dut(dut)?;
            run_session(tester, dut, options.clone()).await
        }
        Commands::Identify { config } => {
            let tester = TesterConfig::load_from(config)
                .with_context(|| format!("loading tester configuration {}", config.display()))?;
            tester
                .validate()
                .map_err(anyhow::Error::msg)
                .context("invalid tester configuration")?;
            cli.init_logging(&tester)?;
            identify(&tester).await
        }
        Commands::Simulate {
            dut,
            load1,
            load2,
            heater,
            data_dir,
            options,
        } => {
            let mut tester = TesterConfig::simulated(*load1, *load2, *heater);
            if let Some(dir) = data_dir {
                tester.application.data_dir = dir.clone();
            }
            cli.init_logging(&tester)?;
            let dut = load_dut(dut)?;
            run_session(tester, dut, options.clone()).await
        }
    }
}

fn load_dut(path: &Path) -> Result<DutConfig> {
    let dut = DutConfig::load_from(path).with_context(|| format!("loading DUT configuration {}", path.display()))?;
    dut.validate()
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("invalid DUT configuration {}", path.display()))?;
    Ok(dut)
}

async fn identify(tester: &TesterConfig) -> Result<()> {
    let heater_units = tester.heaterblock.as_ref().map(|h| &h.units[..]).unwrap_or(&[]);
    let groups = [
        ("PSU1", tester.psu1.as_ref().map(|s| &s.units[..]).unwrap_or(&[])),
        ("PSU2", tester.psu2.as_ref().map(|s| &s.units[..]).unwrap_or(&[])),
        ("HEATER", heater_units),
    ];
    for (label, units) in groups {
        for (k, unit) in units.iter().enumerate() {
            let mut driver = connect_unit(unit)
                .await
                .with_context(|| format!("connecting {label} unit {}", k + 1))?;
            let id = driver.identify().await?;
            let spec = driver.spec();
            println!("{label} unit {} on '{}': {}", k + 1, unit.port, id);
            println!(
                "  {} to {} V, {} A, {} W; set resolution {} V / {} A, read resolution {} V / {} A",
                spec.v_min,
                spec.v_max,
                spec.i_max,
                spec.p_max,
                spec.v_res_set,
                spec.i_res_set,
                spec.v_res_read,
                spec.i_res_read
            );
            driver.set_output(false).await?;
        }
    }
    Ok(())
}

async fn run_session(tester: TesterConfig, mut dut: DutConfig, options: RunOptions) -> Result<()> {
    if options.quick {
        dut.run.quick = true;
    }
    let base = options.sample.clone().unwrap_or_else(|| dut.run.sample.clone());
    let data_dir = tester.application.data_dir.clone();
    std::fs::create_dir_all(&data_dir).with_context(|| format!("creating data directory {}", data_dir.display()))?;

    let psu1 = match &tester.psu1 {
        Some(cfg) => Some(LogicalSupply::connect("PSU1", cfg).await.context("connecting PSU1")?),
        None => None,
    };
    let psu2 = match &tester.psu2 {
        Some(cfg) => Some(LogicalSupply::connect("PSU2", cfg).await.context("connecting PSU2")?),
        None => None,
    };
    let heater = match &tester.heaterblock {
        Some(cfg) => Some(
            HeaterController::connect(cfg)
                .await
                .context("connecting heater block")?
                .spawn(),
        ),
        None => None,
    };

    let cancel = CancelFlag::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after the current step");
                cancel.cancel();
            }
        })
    };

    let (plot, plot_task) = spawn_consumer(TracingRenderer);
    let engine = SweepEngine::new(psu1, psu2, heater, cancel.clone()).with_plot(plot);
    let batch = Batch {
        base,
        data_dir,
        output: options.output,
        batch: options.batch,
    };
    let mut input = BufReader::new(tokio::io::stdin());
    let outcome = run_batch(engine, &dut, &batch, &cancel, &mut input).await;

    ctrl_c.abort();
    if plot_task.await.is_err() {
        warn!("Plot consumer ended abnormally");
    }
    outcome
}

/// Where the data files of a session go.
struct Batch {
    base: String,
    data_dir: PathBuf,
    output: Option<PathBuf>,
    batch: bool,
}

/// Run one sample, or a batch of samples prompted for on `input`, then shut the
/// engine down. The engine is shut down on every path; the first error is returned.
async fn run_batch<R: AsyncBufRead + Unpin>(
    mut engine: SweepEngine,
    dut: &DutConfig,
    batch: &Batch,
    cancel: &CancelFlag,
    input: &mut R,
) -> Result<()> {
    let mut step = batch.batch.then_some(1u32);
    let mut outcome = Ok(());
    loop {
        let sample = sample_name(&batch.base, step);
        let path = match &batch.output {
            Some(path) => path.clone(),
            None => data_file_path(&batch.data_dir, &batch.base, step),
        };
        let (format1, format2) = engine.column_formats();
        let mut sink = match DataFileWriter::create(&path, format1, format2) {
            Ok(sink) => sink,
            Err(e) => {
                outcome = Err(anyhow::Error::from(e).context(format!("creating data file {}", path.display())));
                break;
            }
        };

        match engine.run(dut, &sample, &mut sink).await {
            Ok(summary) => info!("{}: {} point(s) in {}", sample, summary.points, path.display()),
            Err(CurveTraceError::Cancelled) => break,
            Err(e) => {
                outcome = Err(anyhow::Error::from(e).context(format!("run '{sample}' failed")));
                break;
            }
        }

        let Some(current) = step else { break };
        match prompt_next_sample(current + 1, input).await {
            Ok(true) if !cancel.is_cancelled() => {}
            Ok(_) => break,
            Err(e) => {
                outcome = Err(e);
                break;
            }
        }
        step = Some(current + 1);
        engine.next_batch_step().await;
    }

    let shutdown = engine.shutdown().await.context("shutting down");
    outcome.and(shutdown)
}

/// Ask for the next sample of a batch. `false` ends the batch.
async fn prompt_next_sample<R: AsyncBufRead + Unpin>(next: u32, input: &mut R) -> Result<bool> {
    println!("Insert sample {next} and press ENTER to continue, or enter 'q' to quit");
    let mut line = String::new();
    let read = input.read_line(&mut line).await.context("reading from stdin")?;
    if read == 0 {
        return Ok(false);
    }
    Ok(!line.trim().eq_ignore_ascii_case("q"))
}
