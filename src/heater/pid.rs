//! PID primitive of the heater loop.
//!
//! Positional form with the integral term clamped to the output range and the
//! derivative taken on the measurement, so setpoint changes do not kick the output.

use tokio::time::Instant;

/// PID controller with a clamped output.
#[derive(Debug, Clone)]
pub struct Pid {
    kp: f64,
    ki: f64,
    kd: f64,
    output_min: f64,
    output_max: f64,
    integral: f64,
    last_input: Option<f64>,
    last_time: Option<Instant>,
}

impl Pid {
    /// Controller with gains `kp`, `ki` (per second), `kd` (seconds) and output
    /// range `[output_min, output_max]`.
    pub fn new(kp: f64, ki: f64, kd: f64, output_min: f64, output_max: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            output_min,
            output_max: output_max.max(output_min),
            integral: 0.0,
            last_input: None,
            last_time: None,
        }
    }

    /// Output range
    pub fn output_limits(&self) -> (f64, f64) {
        (self.output_min, self.output_max)
    }

    /// Forget the integral and derivative history.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_input = None;
        self.last_time = None;
    }

    /// New output for measurement `input` towards `setpoint` at time `now`.
    pub fn update(&mut self, setpoint: f64, input: f64, now: Instant) -> f64 {
        let dt = self
            .last_time
            .map_or(0.0, |last| now.saturating_duration_since(last).as_secs_f64());
        let error = setpoint - input;

        self.integral = (self.integral + self.ki * error * dt).clamp(self.output_min, self.output_max);

        let derivative = match self.last_input {
            Some(last) if dt > 0.0 => -(input - last) / dt,
            _ => 0.0,
        };

        self.last_input = Some(input);
        self.last_time = Some(now);

        let output = self.kp * error + self.integral + self.kd * derivative;
        if output.is_finite() {
            output.clamp(self.output_min, self.output_max)
        } else {
            self.output_min
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn output_stays_within_limits() {
        let mut pid = Pid::new(5.0, 1.0, 2.0, 0.0, 30.0);
        let mut now = Instant::now();
        for (setpoint, input) in [(40.0, 20.0), (40.0, -100.0), (40.0, 200.0), (0.0, 50.0), (1e6, 0.0)] {
            now += Duration::from_secs(1);
            let out = pid.update(setpoint, input, now);
            assert!((0.0..=30.0).contains(&out), "output {out} out of range");
        }
    }

    #[test]
    fn integral_removes_steady_error() {
        let mut pid = Pid::new(0.0, 0.5, 0.0, 0.0, 100.0);
        let mut now = Instant::now();
        let mut out = pid.update(10.0, 8.0, now);
        assert_eq!(out, 0.0);
        for _ in 0..4 {
            now += Duration::from_secs(1);
            out = pid.update(10.0, 8.0, now);
        }
        assert!((out - 4.0).abs() < 1e-9);
    }

    #[test]
    fn integral_does_not_wind_up() {
        let mut pid = Pid::new(1.0, 1.0, 0.0, 0.0, 10.0);
        let mut now = Instant::now();
        for _ in 0..1000 {
            now += Duration::from_secs(1);
            pid.update(100.0, 0.0, now);
        }
        now += Duration::from_secs(1);
        // Above the setpoint the output drops right away.
        assert!(pid.update(100.0, 111.0, now) < 1e-9);
    }

    #[test]
    fn reset_clears_history() {
        let mut pid = Pid::new(0.0, 1.0, 0.0, 0.0, 10.0);
        let mut now = Instant::now();
        pid.update(5.0, 0.0, now);
        now += Duration::from_secs(2);
        assert!(pid.update(5.0, 0.0, now) > 0.0);
        pid.reset();
        assert_eq!(pid.update(5.0, 0.0, now), 0.0);
        assert_eq!(pid.output_limits(), (0.0, 10.0));
    }
}
