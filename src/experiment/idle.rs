//! Idle / pre-heat regulation.
//!
//! Before the sweep (pre-heat) and optionally before every reading, the DUT is held
//! at an idle operating point. If one supply has a variable idle voltage range, it
//! regulates ("REG") so that the other supply ("FIX"), sitting at its fixed idle
//! voltage, delivers its idle current. Otherwise both supplies are parked at their
//! idle points and the time is simply waited out.

use super::point::ColumnFormat;
use super::profile::{current_limit, IdleProfile};
use super::sink::OperatingPoint;
use super::state::CancelFlag;
use crate::error::{AppResult, CurveTraceError};
use crate::heater::HeaterHandle;
use crate::supply::LogicalSupply;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// Fraction of the estimated correction applied per regulation tick
pub const REGULATION_GAIN: f64 = 0.65;

/// Longest uninterrupted sleep of a fixed idle period, so cancellation is noticed
const DWELL_TICK: Duration = Duration::from_millis(250);

enum Roles<'a> {
    /// `reg` tracks the idle current of `fix`
    Regulated {
        fix: &'a mut LogicalSupply,
        reg: &'a mut LogicalSupply,
    },
    /// Fixed idle points only
    Fixed(Vec<&'a mut LogicalSupply>),
}

fn idle_of(supply: &LogicalSupply) -> Option<IdleProfile> {
    supply.profile().and_then(|p| p.idle)
}

fn is_regulating(supply: &LogicalSupply) -> bool {
    idle_of(supply).is_some_and(|idle| idle.is_variable())
}

fn roles<'a>(psu1: Option<&'a mut LogicalSupply>, psu2: Option<&'a mut LogicalSupply>) -> Roles<'a> {
    let psu1 = psu1.filter(|p| idle_of(p).is_some());
    let psu2 = psu2.filter(|p| idle_of(p).is_some());
    match (psu1, psu2) {
        (Some(p1), Some(p2)) if is_regulating(&*p1) => Roles::Regulated { fix: p2, reg: p1 },
        (Some(p1), Some(p2)) if is_regulating(&*p2) => Roles::Regulated { fix: p1, reg: p2 },
        (p1, p2) => Roles::Fixed(p1.into_iter().chain(p2).collect()),
    }
}

/// Holds the idle operating point and remembers the last regulated voltage.
#[derive(Debug, Default, Clone)]
pub struct IdleRegulator {
    reg_voltage: Option<f64>,
}

impl IdleRegulator {
    /// Regulator starting from the configured idle voltage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Regulated voltage reached at the end of the last idle period
    pub fn regulated_voltage(&self) -> Option<f64> {
        self.reg_voltage
    }

    /// Forget the last regulated voltage.
    pub fn reset(&mut self) {
        self.reg_voltage = None;
    }

    /// Idle for `duration`.
    ///
    /// With `wait_for_temperature`, every regulation tick first waits for a stable
    /// heater block temperature; the time spent there extends the idle period.
    ///
    /// # Returns
    /// The operating point at the end of a regulated idle period, `None` for fixed
    /// idle points.
    pub async fn run(
        &mut self,
        psu1: Option<&mut LogicalSupply>,
        psu2: Option<&mut LogicalSupply>,
        heater: Option<&HeaterHandle>,
        duration: Duration,
        wait_for_temperature: bool,
        cancel: &CancelFlag,
    ) -> AppResult<Option<OperatingPoint>> {
        match roles(psu1, psu2) {
            Roles::Fixed(supplies) => {
                for supply in supplies {
                    if let Some(idle) = idle_of(supply) {
                        supply.set_current(idle.current, false).await?;
                        supply.set_voltage(idle.voltage, false).await?;
                    }
                }
                dwell(duration, cancel).await?;
                Ok(None)
            }
            Roles::Regulated { fix, reg } => {
                self.regulate(fix, reg, heater, wait_for_temperature, duration, cancel)
                    .await
            }
        }
    }

    async fn regulate(
        &mut self,
        fix: &mut LogicalSupply,
        reg: &mut LogicalSupply,
        heater: Option<&HeaterHandle>,
        wait_for_temperature: bool,
        duration: Duration,
        cancel: &CancelFlag,
    ) -> AppResult<Option<OperatingPoint>> {
        let (Some(fix_idle), Some(reg_idle)) = (idle_of(fix), idle_of(reg)) else {
            return Ok(None);
        };
        let Some(gm) = reg_idle.transconductance else {
            return Ok(None);
        };
        let fix_i_limit = fix.profile().map_or(fix_idle.current, |p| p.i_limit);
        let i_fix_ceiling = current_limit(fix_i_limit, fix_idle.p_limit, fix.envelope().p_max, fix_idle.voltage);

        fix.set_current(i_fix_ceiling, false).await?;
        fix.set_voltage(fix_idle.voltage, true).await?;

        let mut reg_voltage = reg_idle.clamp(self.reg_voltage.unwrap_or(reg_idle.voltage));
        reg.set_current(reg_idle.current, false).await?;
        reg.set_voltage(reg_voltage, true).await?;

        info!(
            "Idling {:.1} s: {} at {} V / {} A, {} regulating within [{}, {}] V",
            duration.as_secs_f64(),
            fix.label(),
            fix_idle.voltage,
            fix_idle.current,
            reg.label(),
            reg_idle.v_min,
            reg_idle.v_max
        );

        let start = Instant::now();
        let mut heater_delays = Duration::ZERO;
        let mut last = None;
        while start.elapsed() < duration + heater_delays {
            cancel.check()?;
            if let Some(heater) = heater.filter(|_| wait_for_temperature) {
                heater_delays += heater.wait_for_stable_temperature(None, cancel).await?;
            }

            let f = fix.read(fix.num_stable_readings()).await?;
            let r = reg.read(reg.num_stable_readings()).await?;

            let mut i_fix = f.current;
            if f.is_current_limited() && fix_idle.voltage > 0.0 {
                i_fix = i_fix_ceiling * (1.0 + (fix_idle.voltage - f.voltage) / fix_idle.voltage);
            }
            let temperature = heater.and_then(HeaterHandle::temperature);
            debug!(
                "Idling ({:.1} of {:.1} s): U0 = {} V  I0 = {} A  Uc = {} V  Ic = {} A",
                (start.elapsed().saturating_sub(heater_delays)).as_secs_f64(),
                duration.as_secs_f64(),
                f.voltage,
                i_fix,
                r.voltage,
                r.current
            );
            last = Some((f.voltage, i_fix, r.voltage, r.current, temperature));

            let deviation = i_fix - fix_idle.current;
            if deviation != 0.0 {
                let correction = REGULATION_GAIN * deviation / gm;
                reg_voltage = reg_idle.clamp(reg_voltage - correction);
                reg.set_voltage(reg_voltage, true).await?;
            } else {
                sleep(fix.envelope().read_idle).await;
            }
        }
        self.reg_voltage = Some(reg_voltage);

        let fix_polarity = f64::from(fix.polarity());
        let reg_polarity = f64::from(reg.polarity());
        Ok(last.map(|(u0, i0, uc, ic, temperature)| OperatingPoint {
            u0: fix_polarity * u0,
            i0: fix_polarity * i0,
            uc: reg_polarity * uc,
            ic: reg_polarity * ic,
            fix_format: ColumnFormat::for_spec(fix.envelope()),
            reg_format: ColumnFormat::for_spec(reg.envelope()),
            temperature,
        }))
    }
}

/// Wait out a fixed idle period, checking for cancellation.
async fn dwell(duration: Duration, cancel: &CancelFlag) -> AppResult<()> {
    let deadline = Instant::now() + duration;
    loop {
        cancel.check()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        sleep((deadline - now).min(DWELL_TICK)).await;
    }
}

/// Fail if both supplies need a regulated idle point.
pub fn check_idle_roles(psu1: Option<&LogicalSupply>, psu2: Option<&LogicalSupply>) -> AppResult<()> {
    if psu1.is_some_and(is_regulating) && psu2.is_some_and(is_regulating) {
        return Err(CurveTraceError::ConfigurationInconsistent(
            "PSU1 and PSU2 cannot both regulate their idle voltage".into(),
        ));
    }
    Ok(())
}
