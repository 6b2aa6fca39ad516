//! Experiment layer: test profiles, the sweep engine and its outputs.
//!
//! [`SweepEngine`] owns the supplies for the duration of a session. Every run
//! writes one data file through [`DataFileWriter`] and, optionally, streams its
//! points to a plotting consumer over a bounded channel.

pub mod engine;
pub mod idle;
pub mod plot;
pub mod point;
pub mod profile;
pub mod sink;
pub mod state;

pub use engine::{RunSummary, SweepEngine, REPEATED_LIMIT_HITS};
pub use idle::IdleRegulator;
pub use plot::{spawn_consumer, CurveRenderer, PlotMessage, PlotSender, TracingRenderer};
pub use point::{Averaging, ColumnFormat, SweepPoint};
pub use profile::{RunSettings, TestProfile};
pub use sink::{data_file_path, sample_name, DataFileWriter, OperatingPoint, RunHeader};
pub use state::{CancelFlag, SweepState};
