//! PI servo converting a phase offset (nanoseconds) into a frequency
//! adjustment (parts per billion).

use std::time::Instant;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// How the servo derives its integration interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TauMethod {
    /// Fixed interval of one second.
    None,
    /// Use the interval the caller passes in.
    Constant,
    /// Measure the interval from the monotonic clock, capped at
    /// `max_tau` times the nominal interval.
    Measured,
}

pub struct PiServo {
    pub kp: f64,
    pub ki: f64,
    pub max_output: f64,
    pub tau_method: TauMethod,
    pub max_tau: f64,
    /// Multiplier on the integration interval, used when updates arrive
    /// at a lower rate than the nominal interval.
    pub delay_factor: f64,

    pub input: f64,
    pub output: f64,
    integral: f64,
    tau: f64,
    running_max_output: bool,
    last_update: Option<Instant>,
    updated: bool,
}

impl PiServo {
    pub fn new(kp: f64, ki: f64, max_output: f64) -> Self {
        PiServo {
            kp,
            ki,
            max_output,
            tau_method: TauMethod::Constant,
            max_tau: 30.0,
            delay_factor: 1.0,
            input: 0.0,
            output: 0.0,
            integral: 0.0,
            tau: 1.0,
            running_max_output: false,
            last_update: None,
            updated: false,
        }
    }

    fn clamp(&self, value: f64) -> f64 {
        value.clamp(-self.max_output, self.max_output)
    }

    fn effective_tau(&mut self, tau: f64) -> f64 {
        let t = match self.tau_method {
            TauMethod::Measured => {
                let now = Instant::now();
                let measured = match self.last_update {
                    Some(prev) => now.duration_since(prev).as_secs_f64(),
                    None => 1.0,
                };
                self.last_update = Some(now);
                measured.min(self.max_tau * tau)
            }
            TauMethod::Constant => tau,
            TauMethod::None => 1.0,
        };
        if t <= 0.0 {
            1.0
        } else {
            t
        }
    }

    /// Feed one offset sample (nanoseconds) observed over interval `tau`
    /// (seconds). Returns the frequency adjustment in ppb, clamped to
    /// `max_output`.
    pub fn feed(&mut self, input_ns: f64, tau: f64) -> f64 {
        self.input = input_ns;
        self.tau = self.effective_tau(tau);

        // gains must stay strictly positive
        if self.kp < 1e-6 {
            self.kp = 1e-6;
        }
        if self.ki < 1e-6 {
            self.ki = 1e-6;
        }

        self.integral += self.tau * self.delay_factor * input_ns * self.ki;
        self.integral = self.clamp(self.integral);

        self.output = self.clamp(self.kp * input_ns + self.integral);

        let saturated = self.output.abs() >= self.max_output;
        if saturated && !self.running_max_output {
            warn!(
                "servo: now running at maximum output ({:.0} ppb)",
                self.max_output
            );
        }
        self.running_max_output = saturated;
        self.updated = true;

        debug!(
            "servo: input {:.0} ns tau {:.3} integral {:.3} output {:.3} ppb",
            input_ns, self.tau, self.integral, self.output
        );

        self.output
    }

    /// Predict the output for a sample without changing servo state.
    pub fn simulate(&self, input_ns: f64) -> f64 {
        let integral =
            self.clamp(self.integral + self.tau * self.delay_factor * input_ns * self.ki);
        self.clamp(self.kp * input_ns + integral)
    }

    /// Preload the integral term, typically from a stored frequency,
    /// so the servo starts from a known-good adjustment.
    pub fn prime(&mut self, integral: f64) {
        self.integral = self.clamp(integral);
        self.output = self.integral;
        self.running_max_output = self.output.abs() >= self.max_output;
    }

    pub fn reset(&mut self) {
        self.input = 0.0;
        self.output = 0.0;
        self.integral = 0.0;
        self.updated = false;
        self.running_max_output = false;
        self.last_update = None;
        self.delay_factor = 1.0;
    }

    pub fn running_max_output(&self) -> bool {
        self.running_max_output
    }

    /// True once the servo has produced at least one adjustment.
    pub fn updated(&self) -> bool {
        self.updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proportional_term() {
        let mut servo = PiServo::new(0.1, 1e-9, 500_000.0);
        // 1000 ns offset, kp 0.1: P term dominates at 100 ppb
        let out = servo.feed(1000.0, 1.0);
        assert!((out - 100.0).abs() < 0.01, "out = {}", out);
    }

    #[test]
    fn test_integral_accumulation() {
        let mut servo = PiServo::new(1e-6, 0.01, 500_000.0);
        let first = servo.feed(1000.0, 1.0);
        let second = servo.feed(1000.0, 1.0);
        // the integral grows by 10 ppb per sample
        assert!(second > first);
        assert!((second - first - 10.0).abs() < 0.01);
    }

    #[test]
    fn test_output_clamped() {
        let mut servo = PiServo::new(1.0, 1e-6, 500_000.0);
        let out = servo.feed(1_000_000_000.0, 1.0);
        assert_eq!(out, 500_000.0);
        assert!(servo.running_max_output());

        let out = servo.feed(-1_000_000_000.0, 1.0);
        assert_eq!(out, -500_000.0);
    }

    #[test]
    fn test_integral_clamped_before_proportional() {
        let mut servo = PiServo::new(1e-6, 1.0, 100.0);
        servo.feed(1_000_000.0, 1.0);
        // integral alone is clamped to max_output
        let out = servo.feed(0.0, 1.0);
        assert!((out - 100.0).abs() < 0.001);
    }

    #[test]
    fn test_prime_and_reset() {
        let mut servo = PiServo::new(0.1, 0.001, 500_000.0);
        servo.prime(-42.5);
        assert_eq!(servo.output, -42.5);
        let out = servo.feed(0.0, 1.0);
        assert!((out - -42.5).abs() < 0.001);
        assert!(servo.updated());

        servo.reset();
        assert_eq!(servo.output, 0.0);
        assert!(!servo.updated());
        assert_eq!(servo.feed(0.0, 1.0), 0.0);
    }

    #[test]
    fn test_gain_floor() {
        let mut servo = PiServo::new(0.0, 0.0, 500_000.0);
        servo.feed(1000.0, 1.0);
        assert!(servo.kp >= 1e-6);
        assert!(servo.ki >= 1e-6);
    }

    #[test]
    fn test_simulate_does_not_mutate() {
        let mut servo = PiServo::new(0.1, 0.01, 500_000.0);
        servo.feed(500.0, 1.0);
        let before = servo.output;
        let sim = servo.simulate(500.0);
        assert_eq!(servo.output, before);
        assert!(sim > before);
    }
}
