//! Sweep engine.
//!
//! Drives PSU1 (inner loop) and PSU2 (outer loop) through their voltage steps,
//! takes the repeated readings of every point, and hands accepted points to the
//! data file and the plotting channel.
//!
//! ## Run Lifecycle
//!
//! 1. **Configuring**: DUT profiles are checked against the supply envelopes.
//! 2. **PreHeating**: the idle point is held for the pre-heat time (optional).
//! 3. **Sweeping**: the nested voltage sweep (skipped in quick mode).
//! 4. **Finalizing**: all supply outputs are forced off, on every path.
//!
//! A point whose supplies hit their limits is still written; once
//! [`REPEATED_LIMIT_HITS`] limited points follow each other, the rest of the
//! inner sweep is skipped and the limited point is dropped.

use super::idle::{check_idle_roles, IdleRegulator};
use super::plot::PlotSender;
use super::point::{ColumnFormat, PointAccumulator, SweepPoint};
use super::profile::{voltage_steps, TestProfile};
use super::sink::{DataFileWriter, OperatingPoint, RunHeader};
use super::state::{CancelFlag, SweepState};
use crate::config::{DutConfig, TestProfileConfig};
use crate::error::{AppResult, CurveTraceError};
use crate::heater::HeaterHandle;
use crate::supply::LogicalSupply;
use chrono::Local;
use std::io::Write;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Consecutive limited points that end the inner sweep
pub const REPEATED_LIMIT_HITS: u32 = 2;

/// What a finished run produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Data rows written
    pub points: usize,
    /// Inner sweeps ended early by repeated limiter hits
    pub limited_sweeps: usize,
    /// Operating point reached at the end of pre-heat
    pub operating_point: Option<OperatingPoint>,
}

/// Owns the supplies of the tester and runs sweeps on them.
pub struct SweepEngine {
    psu1: Option<LogicalSupply>,
    psu2: Option<LogicalSupply>,
    heater: Option<HeaterHandle>,
    plot: Option<PlotSender>,
    idle: IdleRegulator,
    state: SweepState,
    cancel: CancelFlag,
}

impl SweepEngine {
    /// Engine on connected supplies. Either supply may be missing from the tester.
    pub fn new(
        psu1: Option<LogicalSupply>,
        psu2: Option<LogicalSupply>,
        heater: Option<HeaterHandle>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            psu1,
            psu2,
            heater,
            plot: None,
            idle: IdleRegulator::new(),
            state: SweepState::Idle,
            cancel,
        }
    }

    /// Send accepted points to a plotting consumer.
    pub fn with_plot(mut self, plot: PlotSender) -> Self {
        self.plot = Some(plot);
        self
    }

    /// Current lifecycle state
    pub fn state(&self) -> SweepState {
        self.state
    }

    /// Cancellation flag polled by the engine
    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// PSU1, if wired up
    pub fn psu1(&self) -> Option<&LogicalSupply> {
        self.psu1.as_ref()
    }

    /// PSU2, if wired up
    pub fn psu2(&self) -> Option<&LogicalSupply> {
        self.psu2.as_ref()
    }

    /// Heater block controller, if present
    pub fn heater(&self) -> Option<&HeaterHandle> {
        self.heater.as_ref()
    }

    /// Plotting channel, if attached
    pub fn plot(&self) -> Option<&PlotSender> {
        self.plot.as_ref()
    }

    /// Data column decimals of PSU1 and PSU2.
    pub fn column_formats(&self) -> (ColumnFormat, ColumnFormat) {
        let format = |s: Option<&LogicalSupply>| s.map(|s| ColumnFormat::for_spec(s.envelope())).unwrap_or_default();
        (format(self.psu1.as_ref()), format(self.psu2.as_ref()))
    }

    /// Prepare the next run of a batch: the regulated idle voltage starts over and
    /// the plotted curve moves to the background.
    pub async fn next_batch_step(&mut self) {
        self.idle.reset();
        if let Some(plot) = &self.plot {
            plot.clear_foreground().await;
        }
    }

    /// Apply the DUT profiles to the supplies.
    ///
    /// # Errors
    /// `ConfigurationInconsistent` if no supply ends up configured, if a profile
    /// names a supply the tester does not have, or if both supplies regulate their
    /// idle voltage.
    pub fn configure(&mut self, dut: &DutConfig) -> AppResult<()> {
        let needs_idle = dut.run.needs_idle();
        configure_supply("PSU1", self.psu1.as_mut(), dut.psu1.as_ref(), needs_idle)?;
        configure_supply("PSU2", self.psu2.as_mut(), dut.psu2.as_ref(), needs_idle)?;

        if !configured(self.psu1.as_ref()) && !configured(self.psu2.as_ref()) {
            return Err(CurveTraceError::ConfigurationInconsistent(
                "neither PSU1 nor PSU2 is configured for this DUT".into(),
            ));
        }
        if needs_idle {
            check_idle_roles(self.psu1.as_ref(), self.psu2.as_ref())?;
        }
        Ok(())
    }

    /// Run one test: header, pre-heat, sweep. All outputs are off afterwards, also
    /// when the run fails or is cancelled.
    ///
    /// # Errors
    /// The first fatal error of the run, or `Cancelled`.
    pub async fn run<W: Write>(
        &mut self,
        dut: &DutConfig,
        sample: &str,
        sink: &mut DataFileWriter<W>,
    ) -> AppResult<RunSummary> {
        if !self.state.can_begin() {
            return Err(CurveTraceError::ConfigurationInconsistent(format!(
                "cannot start a run while {}",
                self.state
            )));
        }
        self.state = SweepState::Configuring;
        let result = self.execute(dut, sample, sink).await;

        self.state = SweepState::Finalizing;
        self.finalize().await;

        match &result {
            Ok(summary) => {
                info!("Run '{}' finished: {} point(s) written", sample, summary.points);
                self.state = SweepState::Idle;
            }
            Err(CurveTraceError::Cancelled) => {
                warn!("Run '{}' cancelled", sample);
                if let Err(e) = sink.comment("* Run cancelled by user") {
                    warn!("Could not note the cancellation in the data file: {}", e);
                }
                self.state = SweepState::Aborted;
            }
            Err(e) => {
                error!("Run '{}' aborted: {}", sample, e);
                if let Err(write_err) = sink.comment(&format!("* Run aborted: {e}")) {
                    warn!("Could not note the abort in the data file: {}", write_err);
                }
                self.state = SweepState::Aborted;
            }
        }
        result
    }

    async fn execute<W: Write>(
        &mut self,
        dut: &DutConfig,
        sample: &str,
        sink: &mut DataFileWriter<W>,
    ) -> AppResult<RunSummary> {
        self.configure(dut)?;
        let settings = &dut.run;
        let mut summary = RunSummary::default();

        sink.write_header(&RunHeader {
            sample: sample.to_string(),
            started: Local::now(),
            r2control: settings.r2control,
            quick: settings.quick,
        })?;

        if let Some(heater) = &self.heater {
            heater.set_target(settings.t_target, settings.t_tolerance);
            match settings.t_target {
                Some(t) => {
                    info!("Heater block target {} °C (± {} K)", t, settings.t_tolerance);
                    heater.turn_on();
                    heater.wait_for_stable_temperature(None, &self.cancel).await?;
                }
                None => heater.turn_off(),
            }
        }

        for supply in [self.psu1.as_mut(), self.psu2.as_mut()].into_iter().flatten() {
            if supply.is_configured() {
                supply.set_current(0.0, false).await?;
                supply.set_voltage(supply.envelope().v_min, false).await?;
                supply.turn_on().await?;
            }
        }

        if settings.preheat_secs > 0.0 {
            self.state = SweepState::PreHeating;
            info!("Pre-heating for {} s", settings.preheat_secs);
            summary.operating_point = self
                .idle
                .run(
                    self.psu1.as_mut().filter(|p| p.is_configured()),
                    self.psu2.as_mut().filter(|p| p.is_configured()),
                    self.heater.as_ref(),
                    Duration::from_secs_f64(settings.preheat_secs),
                    settings.t_target.is_some(),
                    &self.cancel,
                )
                .await?;
            if let Some(op) = &summary.operating_point {
                sink.write_operating_point(op)?;
            }
        }

        if settings.quick {
            info!("Quick mode, skipping the sweep");
        } else {
            self.state = SweepState::Sweeping;
            self.sweep(dut, sink, &mut summary).await?;
        }
        Ok(summary)
    }

    async fn sweep<W: Write>(
        &mut self,
        dut: &DutConfig,
        sink: &mut DataFileWriter<W>,
        summary: &mut RunSummary,
    ) -> AppResult<()> {
        let settings = &dut.run;
        let steps1 = steps_of(self.psu1.as_ref());
        let steps2 = steps_of(self.psu2.as_ref());
        let (format1, format2) = self.column_formats();
        let idle_duration = Duration::from_secs_f64(settings.idle_secs);

        for &v2 in &steps2 {
            self.cancel.check()?;
            let i2_limit = limit_at(self.psu2.as_ref(), v2);
            if let Some(psu2) = self.psu2.as_mut().filter(|p| p.is_configured()) {
                psu2.set_current(i2_limit, false).await?;
                psu2.set_voltage(v2, true).await?;
            }

            let mut limit_hits = 0;
            for &v1 in &steps1 {
                self.cancel.check()?;
                let i1_limit = limit_at(self.psu1.as_ref(), v1);
                let mut acc = PointAccumulator::new();

                for _ in 0..settings.repeats {
                    if let Some(heater) = &self.heater {
                        heater
                            .wait_for_stable_temperature(
                                self.psu1.as_mut().filter(|p| p.is_configured()),
                                &self.cancel,
                            )
                            .await?;
                    }

                    if settings.idle_secs > 0.0 {
                        self.idle
                            .run(
                                self.psu1.as_mut().filter(|p| p.is_configured()),
                                self.psu2.as_mut().filter(|p| p.is_configured()),
                                self.heater.as_ref(),
                                idle_duration,
                                false,
                                &self.cancel,
                            )
                            .await?;
                        if let Some(psu2) = self.psu2.as_mut().filter(|p| p.is_configured()) {
                            psu2.set_current(i2_limit, false).await?;
                            psu2.set_voltage(v2, true).await?;
                        }
                    }

                    if let Some(psu1) = self.psu1.as_mut().filter(|p| p.is_configured()) {
                        psu1.set_current(i1_limit, false).await?;
                        psu1.set_voltage(v1, true).await?;
                    }

                    let r1 = measure(self.psu1.as_mut()).await?;
                    let r2 = measure(self.psu2.as_mut()).await?;
                    let temperature = self.heater.as_ref().and_then(HeaterHandle::temperature);
                    acc.push(r1, r2, temperature);
                }

                let point = acc.finish(settings.averaging, (v1, i1_limit), (v2, i2_limit));
                if point.is_limited() {
                    limit_hits += 1;
                    if limit_hits >= REPEATED_LIMIT_HITS {
                        info!("Repeatedly hitting the current or power limit, skipping to the next curve");
                        summary.limited_sweeps += 1;
                        break;
                    }
                } else {
                    limit_hits = 0;
                }

                let point = SweepPoint {
                    psu1: point.psu1.with_polarity(polarity_of(self.psu1.as_ref())),
                    psu2: point.psu2.with_polarity(polarity_of(self.psu2.as_ref())),
                    temperature: point.temperature,
                };
                info!("{}", point.format_row(&format1, &format2));
                sink.write_point(&point)?;
                if let Some(plot) = &self.plot {
                    plot.point(point).await;
                }
                summary.points += 1;
            }
        }
        Ok(())
    }

    /// Force every supply output off. Failures are logged; the remaining supplies
    /// are still turned off.
    pub async fn finalize(&mut self) {
        for supply in [self.psu1.as_mut(), self.psu2.as_mut()].into_iter().flatten() {
            if let Err(e) = supply.turn_off().await {
                error!("Failed to turn off {}: {}", supply.label(), e);
            }
        }
        debug!("All supply outputs off");
    }

    /// End of the session: stop the heater controller, release the supplies and
    /// terminate the plotting consumer.
    pub async fn shutdown(mut self) -> AppResult<()> {
        let mut first_error = None;
        if let Some(mut heater) = self.heater.take() {
            if let Err(e) = heater.terminate().await {
                error!("Heater controller did not stop cleanly: {}", e);
                first_error.get_or_insert(e);
            }
        }
        for supply in [self.psu1.as_mut(), self.psu2.as_mut()].into_iter().flatten() {
            if let Err(e) = supply.disconnect().await {
                first_error.get_or_insert(e);
            }
        }
        if let Some(plot) = &self.plot {
            plot.terminate().await;
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn configure_supply(
    label: &str,
    supply: Option<&mut LogicalSupply>,
    config: Option<&TestProfileConfig>,
    needs_idle: bool,
) -> AppResult<()> {
    match (supply, config) {
        (Some(supply), Some(config)) => {
            let profile = TestProfile::configure(
                label,
                config,
                supply.envelope(),
                supply.wiring_polarity(),
                supply.num_stable_readings(),
                needs_idle,
            );
            info!(
                "{}: {} V to {} V in steps of {} V, I limit {} A, P limit {} W",
                label, profile.v_start, profile.v_end, profile.v_step, profile.i_limit, profile.p_limit
            );
            supply.set_profile(profile);
            Ok(())
        }
        (Some(supply), None) => {
            info!("{} is not used for this DUT", label);
            supply.clear_profile();
            Ok(())
        }
        (None, Some(_)) => Err(CurveTraceError::ConfigurationInconsistent(format!(
            "the DUT configuration has a {label} profile, but the tester has no {label}"
        ))),
        (None, None) => Ok(()),
    }
}

fn configured(supply: Option<&LogicalSupply>) -> bool {
    supply.is_some_and(LogicalSupply::is_configured)
}

fn steps_of(supply: Option<&LogicalSupply>) -> Vec<f64> {
    match supply {
        Some(s) => voltage_steps(s.profile(), Some(s.envelope())),
        None => voltage_steps(None, None),
    }
}

fn limit_at(supply: Option<&LogicalSupply>, volts: f64) -> f64 {
    supply
        .and_then(|s| s.profile().map(|p| p.current_limit_at(volts, s.envelope().p_max)))
        .unwrap_or(0.0)
}

fn polarity_of(supply: Option<&LogicalSupply>) -> i8 {
    supply.filter(|s| s.is_configured()).map_or(1, LogicalSupply::polarity)
}

async fn measure(supply: Option<&mut LogicalSupply>) -> AppResult<Option<crate::hardware::Reading>> {
    match supply.filter(|s| s.is_configured()) {
        Some(s) => {
            let n = s.num_stable_readings();
            Ok(Some(s.read(n).await?))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::plot::spawn_consumer;
    use crate::experiment::plot::TracingRenderer;
    use crate::experiment::profile::RunSettings;
    use crate::hardware::mock::{bench_spec, Load, SimulatedHandle};
    use crate::supply::tests::sim_unit;
    use crate::supply::CalibrationSet;
    use tracing_test::traced_test;

    fn supply(label: &str, v_max: f64, i_max: f64, load: Load) -> (LogicalSupply, SimulatedHandle) {
        let (unit, handle) = sim_unit(bench_spec(v_max, i_max), load, CalibrationSet::default());
        (LogicalSupply::new(label, vec![unit], 1, 1).unwrap(), handle)
    }

    fn profile(v_start: f64, v_end: f64, v_step: f64, i_limit: f64, p_limit: f64) -> TestProfileConfig {
        TestProfileConfig {
            v_start,
            v_end,
            v_step,
            i_limit,
            p_limit,
            ..Default::default()
        }
    }

    fn rows(out: Vec<u8>) -> Vec<Vec<f64>> {
        String::from_utf8(out)
            .unwrap()
            .lines()
            .filter(|l| !l.starts_with('%'))
            .map(|l| l.split_whitespace().take(10).map(|f| f.parse().unwrap()).collect())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn nested_sweep_emits_every_point_in_order() {
        let (psu1, h1) = supply("PSU1", 30.0, 1.0, Load::Resistive(100.0));
        let (psu2, h2) = supply("PSU2", 12.0, 0.5, Load::Resistive(100.0));
        let mut engine = SweepEngine::new(Some(psu1), Some(psu2), None, CancelFlag::new());
        let dut = DutConfig {
            psu1: Some(profile(0.0, 10.0, 5.0, 1.0, 30.0)),
            psu2: Some(profile(0.0, 6.0, 3.0, 0.5, 6.0)),
            run: RunSettings::default(),
        };
        let (f1, f2) = engine.column_formats();
        let mut sink = DataFileWriter::new(Vec::new(), f1, f2);

        let summary = engine.run(&dut, "test", &mut sink).await.unwrap();
        assert_eq!(summary.points, 9);
        assert_eq!(engine.state(), SweepState::Idle);
        assert!(!h1.output_on());
        assert!(!h2.output_on());

        let rows = rows(sink.into_inner());
        let order: Vec<(f64, f64)> = rows.iter().map(|r| (r[0], r[5])).collect();
        assert_eq!(
            order,
            vec![
                (0.0, 0.0),
                (5.0, 0.0),
                (10.0, 0.0),
                (0.0, 3.0),
                (5.0, 3.0),
                (10.0, 3.0),
                (0.0, 6.0),
                (5.0, 6.0),
                (10.0, 6.0),
            ]
        );
        let last = &rows[8];
        assert!((last[2] - 10.0).abs() < 1e-3);
        assert!((last[3] - 0.1).abs() < 1e-3);
        assert!((last[8] - 0.06).abs() < 1e-3);
        assert!(rows.iter().all(|r| r[4] == 0.0 && r[9] == 0.0));
    }

    #[traced_test]
    #[tokio::test(start_paused = true)]
    async fn repeated_limit_hits_end_the_inner_sweep() {
        // 10 Ω load: the 0.15 A limit is exceeded from 2 V on.
        let (psu1, h1) = supply("PSU1", 30.0, 1.0, Load::Resistive(10.0));
        let mut engine = SweepEngine::new(Some(psu1), None, None, CancelFlag::new());
        let dut = DutConfig {
            psu1: Some(profile(0.0, 5.0, 1.0, 0.15, 30.0)),
            ..Default::default()
        };
        let (f1, f2) = engine.column_formats();
        let mut sink = DataFileWriter::new(Vec::new(), f1, f2);

        let summary = engine.run(&dut, "limits", &mut sink).await.unwrap();
        let rows = rows(sink.into_inner());
        // 0 V and 1 V are clean, 2 V is the first limited point, 3 V ends the sweep.
        assert_eq!(summary.limited_sweeps, 1);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2][4], 1.0);
        assert!(!h1.output_on());
        assert!(logs_contain("skipping to the next curve"));
    }

    /// Data file on a full disk.
    struct FullDisk;

    impl Write for FullDisk {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::StorageFull, "no space left on device"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[traced_test]
    #[tokio::test(start_paused = true)]
    async fn unwritable_data_file_aborts_and_is_logged() {
        let (psu1, h1) = supply("PSU1", 30.0, 1.0, Load::Resistive(100.0));
        let mut engine = SweepEngine::new(Some(psu1), None, None, CancelFlag::new());
        let dut = DutConfig {
            psu1: Some(profile(0.0, 2.0, 1.0, 1.0, 30.0)),
            ..Default::default()
        };
        let mut sink = DataFileWriter::new(FullDisk, Default::default(), Default::default());

        let err = engine.run(&dut, "full", &mut sink).await.unwrap_err();
        assert!(matches!(err, CurveTraceError::Io(_)));
        assert_eq!(engine.state(), SweepState::Aborted);
        assert!(!h1.output_on());
        assert!(logs_contain("Could not note the abort in the data file"));
    }

    #[tokio::test(start_paused = true)]
    async fn unconfigured_supply_reports_zeros() {
        let (psu1, _h1) = supply("PSU1", 30.0, 1.0, Load::Resistive(100.0));
        let (psu2, h2) = supply("PSU2", 12.0, 0.5, Load::Resistive(100.0));
        let mut engine = SweepEngine::new(Some(psu1), Some(psu2), None, CancelFlag::new());
        let dut = DutConfig {
            psu1: Some(profile(1.0, 2.0, 1.0, 1.0, 30.0)),
            ..Default::default()
        };
        let mut sink = DataFileWriter::new(Vec::new(), ColumnFormat::default(), ColumnFormat::default());

        engine.run(&dut, "single", &mut sink).await.unwrap();
        let rows = rows(sink.into_inner());
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r[5..10].iter().all(|v| *v == 0.0)));
        assert!(!h2.output_on());
    }

    #[tokio::test(start_paused = true)]
    async fn negative_polarity_flips_the_values() {
        let (psu1, _h1) = supply("PSU1", 30.0, 1.0, Load::Resistive(100.0));
        let mut engine = SweepEngine::new(Some(psu1), None, None, CancelFlag::new());
        let mut p = profile(5.0, 5.0, 0.0, 1.0, 30.0);
        p.polarity = Some(-1);
        let dut = DutConfig {
            psu1: Some(p),
            ..Default::default()
        };
        let (f1, f2) = engine.column_formats();
        let mut sink = DataFileWriter::new(Vec::new(), f1, f2);

        engine.run(&dut, "pnp", &mut sink).await.unwrap();
        let rows = rows(sink.into_inner());
        assert_eq!(rows[0][0], -5.0);
        assert!((rows[0][3] + 0.05).abs() < 1e-3);
    }

    #[tokio::test]
    async fn nothing_configured_is_inconsistent() {
        let (psu1, h1) = supply("PSU1", 30.0, 1.0, Load::Open);
        let mut engine = SweepEngine::new(Some(psu1), None, None, CancelFlag::new());
        let mut sink = DataFileWriter::new(Vec::new(), ColumnFormat::default(), ColumnFormat::default());

        let err = engine.run(&DutConfig::default(), "none", &mut sink).await.unwrap_err();
        assert!(matches!(err, CurveTraceError::ConfigurationInconsistent(_)));
        assert_eq!(engine.state(), SweepState::Aborted);
        assert!(!h1.output_on());
    }

    #[tokio::test]
    async fn profile_for_a_missing_supply_is_inconsistent() {
        let (psu1, _h1) = supply("PSU1", 30.0, 1.0, Load::Open);
        let mut engine = SweepEngine::new(Some(psu1), None, None, CancelFlag::new());
        let dut = DutConfig {
            psu2: Some(profile(0.0, 1.0, 1.0, 0.1, 1.0)),
            ..Default::default()
        };
        assert!(matches!(
            engine.configure(&dut),
            Err(CurveTraceError::ConfigurationInconsistent(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_and_turns_outputs_off() {
        let (psu1, h1) = supply("PSU1", 30.0, 1.0, Load::Resistive(100.0));
        let cancel = CancelFlag::new();
        let mut engine = SweepEngine::new(Some(psu1), None, None, cancel.clone());
        let dut = DutConfig {
            psu1: Some(profile(0.0, 10.0, 1.0, 1.0, 30.0)),
            ..Default::default()
        };
        let mut sink = DataFileWriter::new(Vec::new(), ColumnFormat::default(), ColumnFormat::default());
        cancel.cancel();

        let err = engine.run(&dut, "cancelled", &mut sink).await.unwrap_err();
        assert!(matches!(err, CurveTraceError::Cancelled));
        assert_eq!(engine.state(), SweepState::Aborted);
        assert!(!h1.output_on());
        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert!(text.contains("% * Run cancelled by user"));
    }

    #[tokio::test(start_paused = true)]
    async fn quick_mode_only_writes_the_header() {
        let (psu1, _h1) = supply("PSU1", 30.0, 1.0, Load::Resistive(100.0));
        let mut engine = SweepEngine::new(Some(psu1), None, None, CancelFlag::new());
        let dut = DutConfig {
            psu1: Some(profile(0.0, 10.0, 1.0, 1.0, 30.0)),
            run: RunSettings {
                quick: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut sink = DataFileWriter::new(Vec::new(), ColumnFormat::default(), ColumnFormat::default());

        let summary = engine.run(&dut, "quick", &mut sink).await.unwrap();
        assert_eq!(summary.points, 0);
        assert!(rows(sink.into_inner()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn points_reach_the_plot_and_batches_clear_it() {
        let (psu1, _h1) = supply("PSU1", 30.0, 1.0, Load::Resistive(100.0));
        let (tx, task) = spawn_consumer(TracingRenderer);
        let mut engine = SweepEngine::new(Some(psu1), None, None, CancelFlag::new()).with_plot(tx);
        let dut = DutConfig {
            psu1: Some(profile(0.0, 2.0, 1.0, 1.0, 30.0)),
            ..Default::default()
        };

        let mut sink = DataFileWriter::new(Vec::new(), ColumnFormat::default(), ColumnFormat::default());
        engine.run(&dut, "b_1", &mut sink).await.unwrap();
        engine.next_batch_step().await;
        let mut sink = DataFileWriter::new(Vec::new(), ColumnFormat::default(), ColumnFormat::default());
        engine.run(&dut, "b_2", &mut sink).await.unwrap();
        engine.shutdown().await.unwrap();

        let consumer = task.await.unwrap();
        assert_eq!(consumer.background().len(), 3);
        assert_eq!(consumer.foreground().len(), 3);
    }
}
