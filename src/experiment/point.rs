//! Sweep points: one emitted row of measurements.

use crate::hardware::capabilities::Reading;
use crate::hardware::device_spec::{decimals_for, DeviceSpec};
use serde::{Deserialize, Serialize};

/// How repeated readings of one sweep point are reduced to a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Averaging {
    /// Arithmetic mean
    #[default]
    Mean,
    /// Median, robust against single outliers
    Median,
}

impl Averaging {
    /// Reduce `values`; `None` if there are none.
    pub fn reduce(self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        match self {
            Averaging::Mean => Some(values.iter().sum::<f64>() / values.len() as f64),
            Averaging::Median => {
                let mut sorted = values.to_vec();
                sorted.sort_by(f64::total_cmp);
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    Some((sorted[mid - 1] + sorted[mid]) / 2.0)
                } else {
                    Some(sorted[mid])
                }
            }
        }
    }
}

/// Setpoints and measurements of one supply at one sweep point.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SupplySample {
    /// Nominal voltage setting (V)
    pub v_set: f64,
    /// Current limit (A)
    pub i_limit: f64,
    /// Measured voltage (V)
    pub v_meas: f64,
    /// Measured current (A)
    pub i_meas: f64,
    /// Current limiter was active, or the limit was exceeded
    pub limited: bool,
}

impl SupplySample {
    /// Sample with all values multiplied by `polarity`.
    pub fn with_polarity(self, polarity: i8) -> Self {
        let p = f64::from(polarity);
        Self {
            v_set: self.v_set * p,
            i_limit: self.i_limit * p,
            v_meas: self.v_meas * p,
            i_meas: self.i_meas * p,
            limited: self.limited,
        }
    }
}

/// Decimals of the four value columns of one supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColumnFormat {
    /// Voltage setting
    pub v_set: usize,
    /// Current limit
    pub i_set: usize,
    /// Voltage reading
    pub v_read: usize,
    /// Current reading
    pub i_read: usize,
}

impl ColumnFormat {
    /// Decimals matching the set and read resolutions of a supply.
    pub fn for_spec(spec: &DeviceSpec) -> Self {
        Self {
            v_set: decimals_for(spec.v_res_set),
            i_set: decimals_for(spec.i_res_set),
            v_read: decimals_for(spec.v_res_read),
            i_read: decimals_for(spec.i_res_read),
        }
    }

    fn write(&self, sample: &SupplySample, out: &mut Vec<String>) {
        out.push(format!("{:.*}", self.v_set, sample.v_set));
        out.push(format!("{:.*}", self.i_set, sample.i_limit));
        out.push(format!("{:.*}", self.v_read, sample.v_meas));
        out.push(format!("{:.*}", self.i_read, sample.i_meas));
        out.push(u8::from(sample.limited).to_string());
    }
}

/// One emitted row: both supplies plus the heater block temperature.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SweepPoint {
    /// Primary supply (inner loop)
    pub psu1: SupplySample,
    /// Secondary supply (outer loop)
    pub psu2: SupplySample,
    /// Heater block temperature (°C)
    pub temperature: Option<f64>,
}

impl SweepPoint {
    /// Whether either supply was limited.
    pub fn is_limited(&self) -> bool {
        self.psu1.limited || self.psu2.limited
    }

    /// Whitespace-separated data row.
    pub fn format_row(&self, psu1: &ColumnFormat, psu2: &ColumnFormat) -> String {
        let mut fields = Vec::with_capacity(11);
        psu1.write(&self.psu1, &mut fields);
        psu2.write(&self.psu2, &mut fields);
        fields.push(match self.temperature {
            Some(t) => format!("{t:.2}"),
            None => "NA".to_string(),
        });
        fields.join(" ")
    }
}

/// Collects the repeated readings of one sweep point.
#[derive(Debug, Default)]
pub struct PointAccumulator {
    v1: Vec<f64>,
    i1: Vec<f64>,
    v2: Vec<f64>,
    i2: Vec<f64>,
    cc1: bool,
    cc2: bool,
    temperatures: Vec<f64>,
    temperature_missing: bool,
}

impl PointAccumulator {
    /// Empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one repeat. A supply without a reading contributes zeros.
    pub fn push(&mut self, psu1: Option<Reading>, psu2: Option<Reading>, temperature: Option<f64>) {
        let zero = Reading::new(0.0, 0.0, crate::hardware::LimiterMode::Unknown);
        let r1 = psu1.unwrap_or(zero);
        let r2 = psu2.unwrap_or(zero);
        self.v1.push(r1.voltage);
        self.i1.push(r1.current);
        self.v2.push(r2.voltage);
        self.i2.push(r2.current);
        self.cc1 |= r1.is_current_limited();
        self.cc2 |= r2.is_current_limited();
        match temperature {
            Some(t) => self.temperatures.push(t),
            None => self.temperature_missing = true,
        }
    }

    /// Reduce the repeats to a sweep point (before polarity).
    ///
    /// A supply is flagged limited if it reported CC in any repeat, or if the
    /// reduced current exceeds its limit.
    pub fn finish(&self, averaging: Averaging, psu1: (f64, f64), psu2: (f64, f64)) -> SweepPoint {
        let sample = |set: (f64, f64), v: &[f64], i: &[f64], cc: bool| {
            let i_meas = averaging.reduce(i).unwrap_or(0.0);
            SupplySample {
                v_set: set.0,
                i_limit: set.1,
                v_meas: averaging.reduce(v).unwrap_or(0.0),
                i_meas,
                limited: cc || i_meas > set.1,
            }
        };
        SweepPoint {
            psu1: sample(psu1, &self.v1, &self.i1, self.cc1),
            psu2: sample(psu2, &self.v2, &self.i2, self.cc2),
            temperature: if self.temperature_missing {
                None
            } else {
                averaging.reduce(&self.temperatures)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::LimiterMode;

    #[test]
    fn median_and_mean() {
        assert_eq!(Averaging::Mean.reduce(&[1.0, 2.0, 6.0]), Some(3.0));
        assert_eq!(Averaging::Median.reduce(&[6.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(Averaging::Median.reduce(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(Averaging::Mean.reduce(&[]), None);
    }

    #[test]
    fn row_uses_resolution_decimals() {
        let f1 = ColumnFormat {
            v_set: 2,
            i_set: 3,
            v_read: 3,
            i_read: 4,
        };
        let f2 = ColumnFormat::default();
        let point = SweepPoint {
            psu1: SupplySample {
                v_set: 5.0,
                i_limit: 0.1,
                v_meas: 4.9991,
                i_meas: 0.05,
                limited: false,
            },
            psu2: SupplySample::default(),
            temperature: Some(25.456),
        };
        assert_eq!(point.format_row(&f1, &f2), "5.00 0.100 4.999 0.0500 0 0 0 0 0 0 25.46");

        let no_temp = SweepPoint {
            temperature: None,
            ..point
        };
        assert!(no_temp.format_row(&f1, &f2).ends_with(" NA"));
    }

    #[test]
    fn polarity_flips_values_not_flags() {
        let s = SupplySample {
            v_set: 1.0,
            i_limit: 0.2,
            v_meas: 0.9,
            i_meas: 0.1,
            limited: true,
        }
        .with_polarity(-1);
        assert_eq!((s.v_set, s.i_limit, s.v_meas, s.i_meas), (-1.0, -0.2, -0.9, -0.1));
        assert!(s.limited);
    }

    #[test]
    fn limit_flag_from_cc_or_overcurrent() {
        let mut acc = PointAccumulator::new();
        acc.push(
            Some(Reading::new(5.0, 0.11, LimiterMode::ConstantVoltage)),
            Some(Reading::new(2.0, 0.01, LimiterMode::ConstantCurrent)),
            Some(30.0),
        );
        acc.push(
            Some(Reading::new(5.0, 0.10, LimiterMode::ConstantVoltage)),
            Some(Reading::new(2.0, 0.01, LimiterMode::ConstantVoltage)),
            Some(31.0),
        );
        let point = acc.finish(Averaging::Mean, (5.0, 0.1), (2.0, 0.5));
        assert!(point.psu1.limited, "mean current 0.105 exceeds 0.1 A");
        assert!(point.psu2.limited, "one repeat reported CC");
        assert_eq!(point.temperature, Some(30.5));
    }

    #[test]
    fn missing_temperature_in_any_repeat_gives_none() {
        let mut acc = PointAccumulator::new();
        acc.push(None, None, Some(30.0));
        acc.push(None, None, None);
        let point = acc.finish(Averaging::Mean, (0.0, 0.0), (0.0, 0.0));
        assert_eq!(point.temperature, None);
        assert!(!point.is_limited());
    }
}
