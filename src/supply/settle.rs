//! Settle and stability detection.
//!
//! After a setpoint change the output needs some time to get there, and it may
//! never get there if the other limiter takes over (a voltage that cannot be
//! reached under the present current limit). The waits here poll the stack at its
//! read-idle interval and stop on the first of:
//!
//! - the reading is within `1.3 × read resolution + max offset` of the target
//! - the other limiter has been active for more than [`LIMITER_STREAK_LIMIT`] polls
//! - the settle time of the slowest unit has elapsed (logged, not an error)

use super::LogicalSupply;
use crate::error::AppResult;
use crate::hardware::capabilities::{LimiterMode, Reading};
use std::collections::VecDeque;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Consecutive polls with the opposite limiter after which a setpoint is accepted
/// as unreachable.
pub const LIMITER_STREAK_LIMIT: u32 = 2;

/// How a settle wait ended. Every variant carries the last reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SettleOutcome {
    /// Output reached the setpoint
    Stable(Reading),
    /// Setpoint is out of reach because the other limiter is active
    Limited(Reading),
    /// Settle time elapsed without either of the above
    TimedOut(Reading),
}

impl SettleOutcome {
    /// Last reading taken during the wait.
    pub fn reading(&self) -> Reading {
        match self {
            SettleOutcome::Stable(r) | SettleOutcome::Limited(r) | SettleOutcome::TimedOut(r) => *r,
        }
    }

    /// Whether the wait ended on the settle timeout.
    pub fn timed_out(&self) -> bool {
        matches!(self, SettleOutcome::TimedOut(_))
    }
}

#[derive(Debug, Clone, Copy)]
enum Quantity {
    Voltage,
    Current,
}

impl Quantity {
    fn value(self, reading: &Reading) -> f64 {
        match self {
            Quantity::Voltage => reading.voltage,
            Quantity::Current => reading.current,
        }
    }

    /// Limiter mode that makes a setpoint of this quantity unreachable.
    fn blocking_limiter(self) -> LimiterMode {
        match self {
            Quantity::Voltage => LimiterMode::ConstantCurrent,
            Quantity::Current => LimiterMode::ConstantVoltage,
        }
    }

    fn unit(self) -> &'static str {
        match self {
            Quantity::Voltage => "V",
            Quantity::Current => "A",
        }
    }
}

impl LogicalSupply {
    /// Wait until the output voltage has settled at `target`.
    pub async fn settle_voltage(&mut self, target: f64) -> AppResult<SettleOutcome> {
        let env = self.envelope();
        let tolerance = 1.3 * env.v_res_read + env.v_offset_max;
        self.settle(Quantity::Voltage, target, tolerance).await
    }

    /// Wait until the output current has settled at `target`.
    pub async fn settle_current(&mut self, target: f64) -> AppResult<SettleOutcome> {
        let env = self.envelope();
        let tolerance = 1.3 * env.i_res_read + env.i_offset_max;
        self.settle(Quantity::Current, target, tolerance).await
    }

    async fn settle(&mut self, quantity: Quantity, target: f64, tolerance: f64) -> AppResult<SettleOutcome> {
        let max_settle = self.envelope().max_settle;
        let read_idle = self.envelope().read_idle;
        let start = Instant::now();
        let mut streak = 0u32;

        loop {
            sleep(read_idle).await;
            let reading = self.read_once().await?;

            if (quantity.value(&reading) - target).abs() <= tolerance {
                return Ok(SettleOutcome::Stable(reading));
            }

            if reading.limiter == quantity.blocking_limiter() {
                streak += 1;
                if streak > LIMITER_STREAK_LIMIT {
                    debug!(
                        "{}: {} {} out of reach ({} active)",
                        self.label(),
                        target,
                        quantity.unit(),
                        reading.limiter
                    );
                    return Ok(SettleOutcome::Limited(reading));
                }
            } else {
                streak = 0;
            }

            if start.elapsed() > max_settle {
                warn!(
                    "{}: output did not settle at {} {} within {:?} (last reading {} {})",
                    self.label(),
                    target,
                    quantity.unit(),
                    max_settle,
                    quantity.value(&reading),
                    quantity.unit()
                );
                return Ok(SettleOutcome::TimedOut(reading));
            }
        }
    }

    /// Take a consistent, averaged reading.
    ///
    /// Samples every unit until its last `n` raw voltage readings agree within twice
    /// the voltage read resolution and its last `n` raw current readings agree within
    /// twice the current read resolution. The window means are calibrated and
    /// combined like [`LogicalSupply::read_once`].
    pub async fn read(&mut self, n: usize) -> AppResult<Reading> {
        let n = n.max(1);
        let max_settle = self.envelope().max_settle;
        let read_idle = self.envelope().read_idle;
        let start = Instant::now();
        let mut windows: Vec<VecDeque<Reading>> = vec![VecDeque::with_capacity(n + 1); self.units.len()];
        let mut streak = 0u32;

        loop {
            let mut limited = false;
            for (unit, window) in self.units.iter_mut().zip(windows.iter_mut()) {
                let raw = unit.read_raw().await?;
                limited |= raw.is_current_limited();
                window.push_back(raw);
                if window.len() > n {
                    window.pop_front();
                }
            }

            let consistent = self
                .units
                .iter()
                .zip(windows.iter())
                .all(|(unit, window)| window.len() == n && window_is_consistent(window, unit.spec()));
            if consistent {
                break;
            }

            streak = if limited { streak + 1 } else { 0 };
            if streak > LIMITER_STREAK_LIMIT {
                debug!("{}: current limiter active, accepting readings", self.label());
                break;
            }

            if start.elapsed() > max_settle {
                info!(
                    "{}: readings not consistent within {:?}, using the mean of what was collected",
                    self.label(),
                    max_settle
                );
                break;
            }
            sleep(read_idle).await;
        }

        let readings: Vec<Reading> = self
            .units
            .iter()
            .zip(windows.iter())
            .map(|(unit, window)| unit.correct(window_mean(window)))
            .collect();
        Ok(super::combine_readings(&readings))
    }
}

fn window_is_consistent(window: &VecDeque<Reading>, spec: &crate::hardware::DeviceSpec) -> bool {
    let spread = |f: fn(&Reading) -> f64| {
        let (lo, hi) = window
            .iter()
            .map(f)
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), x| (lo.min(x), hi.max(x)));
        hi - lo
    };
    spread(|r| r.voltage) <= 2.0 * spec.v_res_read && spread(|r| r.current) <= 2.0 * spec.i_res_read
}

fn window_mean(window: &VecDeque<Reading>) -> Reading {
    let count = window.len().max(1) as f64;
    let voltage = window.iter().map(|r| r.voltage).sum::<f64>() / count;
    let current = window.iter().map(|r| r.current).sum::<f64>() / count;
    let limiter = window.back().map_or(LimiterMode::Unknown, |r| r.limiter);
    Reading::new(voltage, current, limiter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{bench_spec, Load};
    use crate::supply::tests::sim_unit;
    use crate::supply::CalibrationSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn single(load: Load) -> (LogicalSupply, crate::hardware::mock::SimulatedHandle) {
        let (unit, handle) = sim_unit(bench_spec(30.0, 1.0), load, CalibrationSet::default());
        (LogicalSupply::new("PSU1", vec![unit], 1, 1).unwrap(), handle)
    }

    fn read_count(handle: &crate::hardware::mock::SimulatedHandle) -> usize {
        handle.commands().iter().filter(|c| c.as_str() == "READ").count()
    }

    #[tokio::test(start_paused = true)]
    async fn reachable_voltage_settles_quickly() {
        let (mut psu, handle) = single(Load::Resistive(100.0));
        psu.set_current(1.0, false).await.unwrap();
        psu.turn_on().await.unwrap();
        let outcome = psu.set_voltage(10.0, true).await.unwrap().unwrap();
        assert!(matches!(outcome, SettleOutcome::Stable(_)));
        assert!((outcome.reading().voltage - 10.0).abs() < 0.002);

        let spec = bench_spec(30.0, 1.0);
        let max_polls = (spec.max_settle.as_millis() / spec.read_idle.as_millis()) as usize;
        assert!(read_count(&handle) <= max_polls);
    }

    #[tokio::test(start_paused = true)]
    async fn current_limit_ends_voltage_wait_early() {
        let (mut psu, handle) = single(Load::Resistive(100.0));
        psu.set_current(0.05, false).await.unwrap();
        psu.turn_on().await.unwrap();

        let start = Instant::now();
        let outcome = psu.set_voltage(10.0, true).await.unwrap().unwrap();
        assert!(matches!(outcome, SettleOutcome::Limited(_)));
        assert!((outcome.reading().voltage - 5.0).abs() < 1e-9);
        assert_eq!(read_count(&handle), LIMITER_STREAK_LIMIT as usize + 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_setpoint_times_out_with_warning() {
        // Output stays off, so the voltage never follows the setpoint.
        let (mut psu, _handle) = single(Load::Open);
        let start = Instant::now();
        let outcome = psu.set_voltage(10.0, true).await.unwrap().unwrap();
        assert!(outcome.timed_out());
        assert_eq!(outcome.reading().voltage, 0.0);
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn voltage_limit_ends_current_wait_early() {
        let (mut psu, _handle) = single(Load::Resistive(100.0));
        psu.set_voltage(1.0, false).await.unwrap();
        psu.turn_on().await.unwrap();
        let outcome = psu.set_current(0.5, true).await.unwrap().unwrap();
        assert!(matches!(outcome, SettleOutcome::Limited(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn averaged_read_of_constant_output() {
        let (mut psu, _handle) = single(Load::Resistive(50.0));
        psu.set_current(1.0, false).await.unwrap();
        psu.set_voltage(5.0, false).await.unwrap();
        psu.turn_on().await.unwrap();
        for n in [1, 2, 5] {
            let reading = psu.read(n).await.unwrap();
            assert!((reading.voltage - 5.0).abs() < 1e-9);
            assert!((reading.current - 0.1).abs() < 1e-9);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drifting_output_is_averaged_once_it_calms_down() {
        let (mut psu, handle) = single(Load::Open);
        psu.set_current(1.0, false).await.unwrap();
        psu.set_voltage(5.0, false).await.unwrap();
        psu.turn_on().await.unwrap();

        // current decays by 10 mA per sample for the first few samples, then stays put
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        handle.set_load(Load::Custom(Arc::new(move |_v| {
            let k = counter.fetch_add(1, Ordering::SeqCst).min(5);
            0.2 - 0.01 * k as f64
        })));

        let reading = psu.read(3).await.unwrap();
        assert!((reading.current - 0.15).abs() < 1e-9);
        assert!(calls.load(Ordering::SeqCst) >= 8);
    }

    #[tokio::test(start_paused = true)]
    async fn inconsistent_readings_give_up_after_settle_time() {
        let (mut psu, handle) = single(Load::Open);
        psu.set_current(1.0, false).await.unwrap();
        psu.set_voltage(5.0, false).await.unwrap();
        psu.turn_on().await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        handle.set_load(Load::Custom(Arc::new(move |_v| {
            if counter.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                0.1
            } else {
                0.2
            }
        })));

        let start = Instant::now();
        let reading = psu.read(2).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!((reading.current - 0.15).abs() < 1e-9);
    }
}
