//! Sliding-window statistics used by the clock discipline path.
//!
//! Software timestamps carry jitter from scheduler preemption and
//! interrupt latency. Real oscillator frequency changes are limited by
//! thermal inertia, so large single-sample excursions are measurement
//! noise. The MAD (median absolute deviation) reducer drives an outlier
//! gate that is robust against exactly that kind of spike, while the
//! mean and median reducers provide plain smoothing.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterType {
    Mean,
    Median,
    Mad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowType {
    /// Continuous sliding window.
    Sliding,
    /// Fill, produce one output, clear.
    Interval,
}

fn median_of(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Sliding-window statistic over f64 samples with a pluggable reducer.
///
/// Carries the blocking bookkeeping the outlier gate needs: how long and
/// how many consecutive samples have been rejected against this window.
pub struct MovingStatFilter {
    filter_type: FilterType,
    window_type: WindowType,
    window_size: usize,
    window: VecDeque<f64>,

    /// Last computed statistic. For the MAD reducer this is the MAD
    /// itself; `median` holds the window median alongside it.
    pub output: f64,
    pub median: f64,
    pub count: u64,

    pub last_blocked: bool,
    pub consecutive_blocked: u32,
    pub blocking_time: f64,
}

impl MovingStatFilter {
    pub fn new(filter_type: FilterType, window_type: WindowType, window_size: usize) -> Self {
        MovingStatFilter {
            filter_type,
            window_type,
            window_size: window_size.max(2),
            window: VecDeque::with_capacity(window_size.max(2) + 1),
            output: 0.0,
            median: 0.0,
            count: 0,
            last_blocked: false,
            consecutive_blocked: 0,
            blocking_time: 0.0,
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Feed one sample. Returns true once the window holds enough samples
    /// for the statistic to be valid; `output` is updated on every true
    /// return.
    pub fn feed(&mut self, sample: f64) -> bool {
        self.count += 1;
        self.window.push_back(sample);
        if self.window.len() > self.window_size {
            self.window.pop_front();
        }

        if self.window.len() < self.window_size {
            return false;
        }

        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        self.median = median_of(&sorted);

        self.output = match self.filter_type {
            FilterType::Mean => sorted.iter().sum::<f64>() / sorted.len() as f64,
            FilterType::Median => self.median,
            FilterType::Mad => {
                let mut dev: Vec<f64> =
                    sorted.iter().map(|v| (v - self.median).abs()).collect();
                dev.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                median_of(&dev)
            }
        };

        if self.window_type == WindowType::Interval {
            self.window.clear();
        }

        true
    }

    pub fn mark_blocked(&mut self, tau: f64) {
        if self.last_blocked {
            self.consecutive_blocked += 1;
            self.blocking_time += tau;
        }
        self.last_blocked = true;
    }

    pub fn mark_passed(&mut self) {
        self.last_blocked = false;
        self.consecutive_blocked = 0;
        self.blocking_time = 0.0;
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.output = 0.0;
        self.median = 0.0;
        self.count = 0;
        self.last_blocked = false;
        self.consecutive_blocked = 0;
        self.blocking_time = 0.0;
    }
}

/// Running Allan deviation over frequency samples.
///
/// Feeds on successive frequency readings; adev is computed from the
/// accumulated squared first differences.
#[derive(Debug, Default, Clone)]
pub struct AdevAccumulator {
    pub count: u64,
    last: f64,
    sum_sq: f64,
    pub adev: f64,
}

impl AdevAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, frequency: f64) -> f64 {
        if self.count > 0 {
            let delta = frequency - self.last;
            self.sum_sq += delta * delta;
            self.adev = (self.sum_sq / (2.0 * self.count as f64)).sqrt();
        }
        self.last = frequency;
        self.count += 1;
        self.adev
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.last = 0.0;
        self.sum_sq = 0.0;
        self.adev = 0.0;
    }
}

/// Permanent running mean, used by the frequency estimation stage.
#[derive(Debug, Default, Clone)]
pub struct RunningMean {
    pub count: u64,
    pub mean: f64,
}

impl RunningMean {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, sample: f64) -> f64 {
        self.count += 1;
        self.mean += (sample - self.mean) / self.count as f64;
        self.mean
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.mean = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_filter() {
        let mut f = MovingStatFilter::new(FilterType::Mean, WindowType::Sliding, 4);
        assert!(!f.feed(1.0));
        assert!(!f.feed(2.0));
        assert!(!f.feed(3.0));
        assert!(f.feed(4.0));
        assert!((f.output - 2.5).abs() < 1e-12);

        // window slides: {2,3,4,5}
        assert!(f.feed(5.0));
        assert!((f.output - 3.5).abs() < 1e-12);
    }

    #[test]
    fn test_median_filter_odd_window() {
        let mut f = MovingStatFilter::new(FilterType::Median, WindowType::Sliding, 5);
        for v in [10.0, 1.0, 7.0, 3.0] {
            assert!(!f.feed(v));
        }
        assert!(f.feed(1000.0));
        // median of {10,1,7,3,1000} is 7 despite the outlier
        assert!((f.output - 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_mad_filter() {
        let mut f = MovingStatFilter::new(FilterType::Mad, WindowType::Sliding, 5);
        for v in [1.0, 2.0, 3.0, 4.0] {
            f.feed(v);
        }
        assert!(f.feed(5.0));
        // median 3, deviations {2,1,0,1,2}, MAD = 1
        assert!((f.median - 3.0).abs() < 1e-12);
        assert!((f.output - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_interval_window_clears() {
        let mut f = MovingStatFilter::new(FilterType::Mean, WindowType::Interval, 3);
        f.feed(1.0);
        f.feed(2.0);
        assert!(f.feed(3.0));
        assert_eq!(f.len(), 0);
        assert!(!f.feed(10.0));
    }

    #[test]
    fn test_blocking_bookkeeping() {
        let mut f = MovingStatFilter::new(FilterType::Mad, WindowType::Sliding, 3);
        f.mark_blocked(1.0);
        assert!(f.last_blocked);
        assert_eq!(f.consecutive_blocked, 0);
        f.mark_blocked(1.0);
        f.mark_blocked(1.0);
        assert_eq!(f.consecutive_blocked, 2);
        assert!((f.blocking_time - 2.0).abs() < 1e-12);
        f.mark_passed();
        assert_eq!(f.consecutive_blocked, 0);
        assert_eq!(f.blocking_time, 0.0);
    }

    #[test]
    fn test_adev_constant_frequency_is_zero() {
        let mut a = AdevAccumulator::new();
        for _ in 0..10 {
            a.feed(12.5);
        }
        assert_eq!(a.adev, 0.0);
    }

    #[test]
    fn test_adev_alternating_frequency() {
        let mut a = AdevAccumulator::new();
        // alternating +1/-1: every first difference is 2
        for i in 0..9 {
            a.feed(if i % 2 == 0 { 1.0 } else { -1.0 });
        }
        // sum_sq = 8 * 4 = 32, count at last feed = 8, adev = sqrt(32/16) = sqrt 2
        assert!((a.adev - 2.0f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_running_mean() {
        let mut m = RunningMean::new();
        m.feed(10.0);
        m.feed(20.0);
        m.feed(30.0);
        assert!((m.mean - 20.0).abs() < 1e-12);
        m.reset();
        assert_eq!(m.count, 0);
    }
}
