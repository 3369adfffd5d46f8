//! Hardware abstraction for adjustable clocks.
//!
//! A `ClockHardware` implementation adapts one physical or virtual time
//! source. The driver layer on top owns the state machine and servo; this
//! trait is only the raw capability set.

use anyhow::Result;

use crate::time::{Timestamp, NS_PER_SEC};

/// Leap second action to arm in the underlying clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeapAction {
    None,
    Insert,
    Delete,
}

#[cfg_attr(test, mockall::automock)]
pub trait ClockHardware {
    /// Read the clock.
    fn get_time(&self) -> Result<Timestamp>;

    /// Read a monotonic counter with arbitrary epoch.
    fn get_time_monotonic(&self) -> Result<Timestamp>;

    /// Set the absolute time.
    fn set_time(&mut self, time: &Timestamp) -> Result<()>;

    /// Shift the clock by a signed delta.
    fn set_offset(&mut self, delta: &Timestamp) -> Result<()>;

    /// Apply a frequency adjustment in parts per billion.
    fn set_frequency(&mut self, ppb: f64) -> Result<()>;

    /// Current frequency adjustment in parts per billion.
    fn get_frequency(&self) -> f64;

    /// Arm or clear a leap second in the clock, where supported.
    fn set_leap(&mut self, action: LeapAction) -> Result<()> {
        let _ = action;
        Ok(())
    }

    /// True when the clock is usable.
    fn health_check(&mut self) -> bool {
        true
    }
}

/// Software-only clock backed by the process monotonic counter plus an
/// accumulated offset and frequency. Useful as a discipline target that
/// must not touch the system clock, and as the test stand-in for real
/// hardware.
pub struct VirtualClock {
    origin: std::time::Instant,
    /// Accumulated offset from the monotonic base, nanoseconds.
    offset_ns: f64,
    frequency_ppb: f64,
    last_read: f64,
    healthy: bool,
}

impl VirtualClock {
    pub fn new() -> Self {
        VirtualClock {
            origin: std::time::Instant::now(),
            offset_ns: 0.0,
            frequency_ppb: 0.0,
            last_read: 0.0,
            healthy: true,
        }
    }

    pub fn set_healthy(&mut self, healthy: bool) {
        self.healthy = healthy;
    }

    fn elapsed_secs(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    /// Advance the accumulated frequency effect up to now.
    fn settle(&mut self) {
        let now = self.elapsed_secs();
        let dt = now - self.last_read;
        if dt > 0.0 {
            self.offset_ns += self.frequency_ppb * dt;
            self.last_read = now;
        }
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockHardware for VirtualClock {
    fn get_time(&self) -> Result<Timestamp> {
        let base = self.elapsed_secs();
        let dt = base - self.last_read;
        let total_ns = base * NS_PER_SEC as f64 + self.offset_ns + self.frequency_ppb * dt;
        Ok(Timestamp::from_nanos(total_ns as i64))
    }

    fn get_time_monotonic(&self) -> Result<Timestamp> {
        Ok(Timestamp::from_secs_f64(self.elapsed_secs()))
    }

    fn set_time(&mut self, time: &Timestamp) -> Result<()> {
        self.settle();
        let now = self.elapsed_secs() * NS_PER_SEC as f64;
        self.offset_ns = time.as_nanos() as f64 - now;
        Ok(())
    }

    fn set_offset(&mut self, delta: &Timestamp) -> Result<()> {
        self.settle();
        self.offset_ns += delta.as_nanos() as f64;
        Ok(())
    }

    fn set_frequency(&mut self, ppb: f64) -> Result<()> {
        self.settle();
        self.frequency_ppb = ppb;
        Ok(())
    }

    fn get_frequency(&self) -> f64 {
        self.frequency_ppb
    }

    fn health_check(&mut self) -> bool {
        self.healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_clock_step() {
        let mut clock = VirtualClock::new();
        let before = clock.get_time().unwrap();
        clock.set_offset(&Timestamp::new(5, 0)).unwrap();
        let after = clock.get_time().unwrap();
        let moved = after.sub(&before);
        assert!(moved.seconds >= 4);
    }

    #[test]
    fn test_virtual_clock_set_time() {
        let mut clock = VirtualClock::new();
        clock.set_time(&Timestamp::new(1_000_000, 0)).unwrap();
        let t = clock.get_time().unwrap();
        assert!((t.seconds - 1_000_000).abs() <= 1);
    }

    #[test]
    fn test_virtual_clock_frequency_readback() {
        let mut clock = VirtualClock::new();
        clock.set_frequency(1500.0).unwrap();
        assert_eq!(clock.get_frequency(), 1500.0);
    }

    #[test]
    fn test_health_toggle() {
        let mut clock = VirtualClock::new();
        assert!(clock.health_check());
        clock.set_healthy(false);
        assert!(!clock.health_check());
    }
}
