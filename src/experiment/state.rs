//! Sweep lifecycle state and cooperative cancellation.

use crate::error::{AppResult, CurveTraceError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Sweep engine execution state.
///
/// # State Machine
///
/// ```text
/// Idle ──> Configuring ──> PreHeating ──> Sweeping ──> Finalizing ──> Idle
///               │               │             │
///               └───────────────┴─────────────┴──(fatal error)──> Aborted
/// ```
///
/// `PreHeating` is skipped without a pre-heat time, `Sweeping` in quick mode.
/// `Finalizing` runs on every path, including after an abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepState {
    /// No run active
    Idle,
    /// Checking profiles against the supply envelopes
    Configuring,
    /// Holding the idle point before the sweep
    PreHeating,
    /// Running the nested voltage sweep
    Sweeping,
    /// Forcing all outputs off
    Finalizing,
    /// Run ended on a fatal error or cancellation
    Aborted,
}

impl std::fmt::Display for SweepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SweepState::Idle => write!(f, "Idle"),
            SweepState::Configuring => write!(f, "Configuring"),
            SweepState::PreHeating => write!(f, "PreHeating"),
            SweepState::Sweeping => write!(f, "Sweeping"),
            SweepState::Finalizing => write!(f, "Finalizing"),
            SweepState::Aborted => write!(f, "Aborted"),
        }
    }
}

impl SweepState {
    /// Check if the state allows starting a new run.
    pub fn can_begin(&self) -> bool {
        matches!(self, SweepState::Idle | SweepState::Aborted)
    }

    /// Check if hardware may be driven in this state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SweepState::Configuring | SweepState::PreHeating | SweepState::Sweeping
        )
    }
}

/// Shared cancellation request, set by the Ctrl-C handler and polled by the engine.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// New, unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> AppResult<()> {
        if self.is_cancelled() {
            Err(CurveTraceError::Cancelled)
        } else {
            Ok(())
        }
    }
}
