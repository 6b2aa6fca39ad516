//! Heater block controller driving a simulated block, alone and inside a sweep.

use psu_curvetrace::config::{DutConfig, HeaterblockConfig, TestProfileConfig};
use psu_curvetrace::experiment::{CancelFlag, DataFileWriter, RunSettings, SweepEngine};
use psu_curvetrace::hardware::mock::{bench_spec, Load, SimulatedHandle, SimulatedSensor, SimulatedSupply};
use psu_curvetrace::heater::{ControllerState, HeaterController, HeaterSettings};
use psu_curvetrace::supply::{CalibrationSet, LogicalSupply, PhysicalUnit};
use std::time::Duration;

fn simulated(label: &str, v_max: f64, i_max: f64, load: Load) -> (LogicalSupply, SimulatedHandle) {
    let psu = SimulatedSupply::new(format!("SIM{v_max}V"), bench_spec(v_max, i_max), load);
    let handle = psu.handle();
    let unit = PhysicalUnit::new(Box::new(psu), CalibrationSet::default());
    (LogicalSupply::new(label, vec![unit], 1, 1).unwrap(), handle)
}

/// 10 Ω heater on a 30 V / 2 A supply; block at 22 °C, 2 K/W, 60 s time constant.
fn heater_block() -> (HeaterController, SimulatedHandle) {
    let (supply, handle) = simulated("HEATER", 30.0, 2.0, Load::Resistive(10.0));
    let sensor = SimulatedSensor::new(handle.clone(), 22.0, 2.0, Duration::from_secs(60));
    let settings = HeaterSettings {
        interval: Duration::from_secs(1),
        buffer_interval: Duration::from_secs(1),
        buffer_len: 5,
        stable_timeout: Duration::from_secs(3600),
        bus_lock_timeout: Duration::from_secs(1),
        heater_resistance: 10.0,
        max_power: Some(40.0),
        kp: 4.0,
        ki: 0.2,
        kd: 0.0,
    };
    (HeaterController::new(supply, Box::new(sensor), settings), handle)
}

#[tokio::test(start_paused = true)]
async fn sweep_rows_carry_the_stable_block_temperature() {
    let (controller, heater_output) = heater_block();
    let heater = controller.spawn();
    let (psu1, psu1_output) = simulated("PSU1", 30.0, 1.0, Load::Resistive(100.0));
    let mut engine = SweepEngine::new(Some(psu1), None, Some(heater), CancelFlag::new());
    let dut = DutConfig {
        psu1: Some(TestProfileConfig {
            v_start: 0.0,
            v_end: 2.0,
            v_step: 1.0,
            i_limit: 0.1,
            p_limit: 1.0,
            ..Default::default()
        }),
        run: RunSettings {
            t_target: Some(35.0),
            t_tolerance: 0.5,
            ..Default::default()
        },
        ..Default::default()
    };

    let mut sink = DataFileWriter::new(Vec::new(), Default::default(), Default::default());
    let summary = engine.run(&dut, "heated", &mut sink).await.unwrap();
    assert_eq!(summary.points, 3);

    let text = String::from_utf8(sink.into_inner()).unwrap();
    for row in text.lines().filter(|l| !l.starts_with('%')) {
        let t: f64 = row.split_whitespace().last().unwrap().parse().unwrap();
        assert!((t - 35.0).abs() <= 0.5, "temperature {t} outside tolerance");
    }
    assert!(heater_output.output_on(), "heater keeps running between runs");
    assert!(!psu1_output.output_on());

    engine.shutdown().await.unwrap();
    assert!(!heater_output.output_on(), "heater left on after shutdown");
}

#[tokio::test(start_paused = true)]
async fn controller_stops_when_terminated() {
    let (controller, heater_output) = heater_block();
    let mut heater = controller.spawn();
    heater.set_target(Some(30.0), 0.5);
    heater.turn_on();

    let waited = heater
        .wait_for_stable_temperature(None, &CancelFlag::new())
        .await
        .unwrap();
    assert!(waited > Duration::ZERO);
    assert!(heater.is_stable());
    assert!(heater.state().power > 0.0);

    heater.terminate().await.unwrap();
    assert_eq!(heater.controller_state(), ControllerState::Stopped);
    assert!(!heater_output.output_on());
}

#[tokio::test(start_paused = true)]
async fn simulated_block_from_configuration() {
    let config = HeaterblockConfig::simulated();
    let controller = HeaterController::connect(&config).await.unwrap();
    assert_eq!(controller.max_power(), 40.0);

    let mut heater = controller.spawn();
    assert_eq!(heater.controller_state(), ControllerState::Running);
    assert!(!heater.is_on());
    heater.terminate().await.unwrap();
}
