//! Calibration polynomials.
//!
//! A polynomial maps a nominal value to its corrected value:
//! `corrected(x) = a0 + a1·x + a2·x² + …`. Set polynomials are applied before a
//! setpoint is transmitted, read polynomials after a reading is received.

use crate::config::UnitConfig;
use serde::{Deserialize, Serialize};

/// Correction polynomial with coefficients in ascending order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPolynomial {
    coefficients: Vec<f64>,
}

impl Default for CalibrationPolynomial {
    fn default() -> Self {
        Self::identity()
    }
}

impl CalibrationPolynomial {
    /// `corrected(x) = x`
    pub fn identity() -> Self {
        Self {
            coefficients: vec![0.0, 1.0],
        }
    }

    /// Polynomial from coefficients `a0, a1, …`. No coefficients is the identity.
    pub fn new(coefficients: Vec<f64>) -> Self {
        if coefficients.is_empty() {
            Self::identity()
        } else {
            Self { coefficients }
        }
    }

    /// Coefficients `a0, a1, …`
    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    /// Evaluate the polynomial at `x` (Horner's scheme).
    pub fn apply(&self, x: f64) -> f64 {
        self.coefficients
            .iter()
            .rev()
            .fold(0.0, |acc, a| acc * x + a)
    }

    /// Whether the polynomial leaves every value unchanged.
    pub fn is_identity(&self) -> bool {
        self.coefficients
            .iter()
            .enumerate()
            .all(|(k, a)| if k == 1 { *a == 1.0 } else { *a == 0.0 })
            && self.coefficients.len() >= 2
    }
}

/// The four polynomials of one physical unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationSet {
    /// Applied to voltage setpoints before transmission
    pub v_set: CalibrationPolynomial,
    /// Applied to voltage readings after reception
    pub v_read: CalibrationPolynomial,
    /// Applied to current setpoints before transmission
    pub i_set: CalibrationPolynomial,
    /// Applied to current readings after reception
    pub i_read: CalibrationPolynomial,
}

impl CalibrationSet {
    /// Polynomials configured for `unit`.
    pub fn from_unit(unit: &UnitConfig) -> Self {
        Self {
            v_set: CalibrationPolynomial::new(unit.v_set_calpoly.clone()),
            v_read: CalibrationPolynomial::new(unit.v_read_calpoly.clone()),
            i_set: CalibrationPolynomial::new(unit.i_set_calpoly.clone()),
            i_read: CalibrationPolynomial::new(unit.i_read_calpoly.clone()),
        }
    }
}
