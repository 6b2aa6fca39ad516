//! End-to-end sweeps on simulated supplies, written to real data files.

use psu_curvetrace::config::{DutConfig, TestProfileConfig};
use psu_curvetrace::experiment::{
    data_file_path, spawn_consumer, CancelFlag, DataFileWriter, RunSettings, SweepEngine, SweepState,
    TracingRenderer,
};
use psu_curvetrace::hardware::mock::{bench_spec, Load, SimulatedHandle, SimulatedSupply};
use psu_curvetrace::supply::{CalibrationSet, LogicalSupply, PhysicalUnit};
use psu_curvetrace::CurveTraceError;

fn simulated(label: &str, v_max: f64, i_max: f64, load: Load) -> (LogicalSupply, SimulatedHandle) {
    let psu = SimulatedSupply::new(format!("SIM{v_max}V"), bench_spec(v_max, i_max), load);
    let handle = psu.handle();
    let unit = PhysicalUnit::new(Box::new(psu), CalibrationSet::default());
    (LogicalSupply::new(label, vec![unit], 1, 1).unwrap(), handle)
}

fn sweep(v_start: f64, v_end: f64, v_step: f64, i_limit: f64, p_limit: f64) -> TestProfileConfig {
    TestProfileConfig {
        v_start,
        v_end,
        v_step,
        i_limit,
        p_limit,
        ..Default::default()
    }
}

fn data_rows(text: &str) -> Vec<Vec<String>> {
    text.lines()
        .filter(|l| !l.starts_with('%'))
        .map(|l| l.split_whitespace().map(str::to_string).collect())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn two_supply_sweep_writes_nine_points() {
    let (psu1, h1) = simulated("PSU1", 30.0, 1.0, Load::Resistive(100.0));
    let (psu2, h2) = simulated("PSU2", 12.0, 0.5, Load::Resistive(100.0));
    let mut engine = SweepEngine::new(Some(psu1), Some(psu2), None, CancelFlag::new());
    let dut = DutConfig {
        psu1: Some(sweep(0.0, 10.0, 5.0, 1.0, 30.0)),
        psu2: Some(sweep(0.0, 6.0, 3.0, 0.5, 6.0)),
        run: RunSettings {
            sample: "BD139".into(),
            ..Default::default()
        },
    };

    let dir = tempfile::tempdir().unwrap();
    let path = data_file_path(dir.path(), "BD139", None);
    let (f1, f2) = engine.column_formats();
    let mut sink = DataFileWriter::create(&path, f1, f2).unwrap();
    let summary = engine.run(&dut, "BD139", &mut sink).await.unwrap();
    drop(sink);

    assert_eq!(summary.points, 9);
    assert_eq!(summary.limited_sweeps, 0);
    assert_eq!(engine.state(), SweepState::Idle);
    assert!(!h1.output_on(), "PSU1 output left on");
    assert!(!h2.output_on(), "PSU2 output left on");

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("% * Sample: BD139\n"));
    assert!(text.contains("% * R2CONTROL = NOT SPECIFIED"));

    let rows = data_rows(&text);
    assert_eq!(rows.len(), 9);
    let setpoints: Vec<(&str, &str)> = rows.iter().map(|r| (r[0].as_str(), r[5].as_str())).collect();
    assert_eq!(
        setpoints,
        vec![
            ("0.000", "0.000"),
            ("5.000", "0.000"),
            ("10.000", "0.000"),
            ("0.000", "3.000"),
            ("5.000", "3.000"),
            ("10.000", "3.000"),
            ("0.000", "6.000"),
            ("5.000", "6.000"),
            ("10.000", "6.000"),
        ]
    );
    for row in &rows {
        assert_eq!(row.len(), 11);
        assert_eq!(row[4], "0", "PSU1 limited in {row:?}");
        assert_eq!(row[9], "0", "PSU2 limited in {row:?}");
        assert_eq!(row[10], "NA");
    }
    assert_eq!(rows[8][3], "0.100");
    assert_eq!(rows[8][8], "0.060");
}

#[tokio::test(start_paused = true)]
async fn power_limit_reduces_the_current_limit() {
    let (psu1, _h1) = simulated("PSU1", 30.0, 1.0, Load::Resistive(1000.0));
    let mut engine = SweepEngine::new(Some(psu1), None, None, CancelFlag::new());
    let dut = DutConfig {
        psu1: Some(sweep(10.0, 20.0, 10.0, 0.5, 1.0)),
        ..Default::default()
    };
    let (f1, f2) = engine.column_formats();
    let mut sink = DataFileWriter::new(Vec::new(), f1, f2);
    engine.run(&dut, "power", &mut sink).await.unwrap();

    let rows = data_rows(&String::from_utf8(sink.into_inner()).unwrap());
    // 1 W at 10 V and 20 V
    assert_eq!(rows[0][1], "0.100");
    assert_eq!(rows[1][1], "0.050");
}

#[tokio::test(start_paused = true)]
async fn failing_supply_aborts_with_outputs_off() {
    let (psu1, h1) = simulated("PSU1", 30.0, 1.0, Load::Resistive(100.0));
    let (psu2, h2) = simulated("PSU2", 12.0, 0.5, Load::Resistive(100.0));
    let mut engine = SweepEngine::new(Some(psu1), Some(psu2), None, CancelFlag::new());
    let dut = DutConfig {
        psu1: Some(sweep(0.0, 10.0, 5.0, 1.0, 30.0)),
        psu2: Some(sweep(0.0, 6.0, 3.0, 0.5, 6.0)),
        ..Default::default()
    };

    // PSU2 dies before the run; PSU1 must still be switched off afterwards.
    h2.set_silent(true);
    let mut sink = DataFileWriter::new(Vec::new(), Default::default(), Default::default());
    let err = engine.run(&dut, "broken", &mut sink).await.unwrap_err();

    assert!(matches!(err, CurveTraceError::CommunicationTimeout { .. }));
    assert!(err.is_fatal());
    assert_eq!(engine.state(), SweepState::Aborted);
    assert!(!h1.output_on());
    let text = String::from_utf8(sink.into_inner()).unwrap();
    assert!(text.contains("% * Run aborted"));
}

#[tokio::test(start_paused = true)]
async fn batch_runs_share_the_engine() {
    let (psu1, _h1) = simulated("PSU1", 30.0, 1.0, Load::Resistive(100.0));
    let (plot, plot_task) = spawn_consumer(TracingRenderer);
    let mut engine = SweepEngine::new(Some(psu1), None, None, CancelFlag::new()).with_plot(plot);
    let dut = DutConfig {
        psu1: Some(sweep(0.0, 4.0, 2.0, 1.0, 30.0)),
        ..Default::default()
    };
    let dir = tempfile::tempdir().unwrap();

    for step in 1..=2 {
        let path = data_file_path(dir.path(), "2N3055", Some(step));
        let mut sink = DataFileWriter::create(&path, Default::default(), Default::default()).unwrap();
        engine.run(&dut, &format!("2N3055_{step}"), &mut sink).await.unwrap();
        engine.next_batch_step().await;
    }
    engine.shutdown().await.unwrap();

    assert!(dir.path().join("2N3055_1.dat").exists());
    assert!(dir.path().join("2N3055_2.dat").exists());
    let consumer = plot_task.await.unwrap();
    assert_eq!(consumer.background().len(), 6);
    assert!(consumer.foreground().is_empty());
}
