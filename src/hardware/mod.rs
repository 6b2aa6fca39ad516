//! Hardware layer: serial transport, vendor drivers and sensors.
//!
//! Each physical power supply is reached through exactly one [`ProtocolDriver`]
//! implementation, chosen once by [`connect_unit`] from the configured
//! [`CommandSet`]. Everything above this module only sees `Box<dyn ProtocolDriver>`.

pub mod bk_precision;
pub mod capabilities;
pub mod device_spec;
pub mod korad;
pub mod mock;
pub mod riden;
pub mod saluki;
pub mod serial;
pub mod temperature;
pub mod voltcraft;

pub use capabilities::{LimiterMargins, LimiterMode, ProtocolDriver, Reading};
pub use device_spec::DeviceSpec;

use crate::config::{CommandSet, UnitConfig};
use crate::error::AppResult;
use bk_precision::{BkOptions, BkPrecisionDriver, VoltageRange};
use korad::KoradDriver;
use mock::{bench_spec, Load, SimulatedSupply};
use riden::{CurrentRange, ModbusSettings, RidenDriver};
use saluki::SalukiDriver;
use serial::TokioSerialConnector;
use std::time::Duration;
use tracing::info;
use voltcraft::VoltcraftDriver;

/// Pause after a SALUKI baud rate that did not answer
const SALUKI_PROBE_PAUSE: Duration = Duration::from_secs(1);

/// Connect to one configured unit and return its driver.
///
/// The driver has identified the model, applied its vendor initialization and
/// switched the output off.
///
/// # Errors
/// - `CommunicationTimeout` if the device does not answer
/// - `UnknownModel` if it answers with a model the command set does not know
/// - `Serial` if the port cannot be opened
pub async fn connect_unit(unit: &UnitConfig) -> AppResult<Box<dyn ProtocolDriver>> {
    info!("Connecting {} unit on '{}'", unit.command_set, unit.port);
    let connector = || Box::new(TokioSerialConnector::new(unit.port.clone()));
    let driver: Box<dyn ProtocolDriver> = match unit.command_set {
        CommandSet::Korad => {
            Box::new(KoradDriver::connect(connector(), KoradDriver::default_settings()).await?)
        }
        CommandSet::BkPrecision => {
            let options = BkOptions {
                range: VoltageRange::from_mode(unit.mode.as_deref()),
                margins: unit.limiter_margins,
                ..Default::default()
            };
            Box::new(
                BkPrecisionDriver::connect(connector(), BkPrecisionDriver::default_settings(), options)
                    .await?,
            )
        }
        CommandSet::Saluki => Box::new(
            SalukiDriver::connect(
                connector(),
                SalukiDriver::default_settings(),
                unit.limiter_margins,
                SALUKI_PROBE_PAUSE,
            )
            .await?,
        ),
        CommandSet::Voltcraft => Box::new(
            VoltcraftDriver::connect(connector(), VoltcraftDriver::default_settings()).await?,
        ),
        CommandSet::Riden => Box::new(
            RidenDriver::connect(
                connector(),
                unit.baud.unwrap_or(RidenDriver::BAUD_RATE),
                ModbusSettings::default(),
                CurrentRange::from_mode(unit.mode.as_deref()),
            )
            .await?,
        ),
        CommandSet::Simulated => Box::new(simulated_unit(unit, None)),
    };
    Ok(driver)
}

/// Build the simulated supply described by a SIMULATED unit.
///
/// `fallback_load` is used when the unit does not configure a load resistance.
pub fn simulated_unit(unit: &UnitConfig, fallback_load: Option<f64>) -> SimulatedSupply {
    let sim = &unit.simulation;
    let load = match sim.load_ohms.or(fallback_load) {
        Some(ohms) => Load::Resistive(ohms),
        None => Load::Open,
    };
    let model = format!("SIM{}V{}A", sim.v_max, sim.i_max);
    SimulatedSupply::new(model, bench_spec(sim.v_max, sim.i_max), load)
}
