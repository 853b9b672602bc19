//! Fixed-window moving average used to smooth per-iteration metrics.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct RollingAverage {
    period: usize,
    samples: VecDeque<f64>,
    sum: f64,
}

impl RollingAverage {
    /// A zero period is treated as 1.
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            samples: VecDeque::with_capacity(period),
            sum: 0.0,
        }
    }

    /// Window size picked from the expected number of samples, so that long
    /// runs produce a smooth curve with a bounded number of distinct points.
    pub fn adaptive_period(expected_samples: u64) -> usize {
        match expected_samples {
            0..=199 => 10,
            200..=999 => 25,
            1000..=1999 => 50,
            2000..=4999 => 100,
            _ => 500,
        }
    }

    /// `configured` 0 selects [`RollingAverage::adaptive_period`].
    pub fn for_run(configured: usize, expected_samples: u64) -> Self {
        if configured == 0 {
            Self::new(Self::adaptive_period(expected_samples))
        } else {
            Self::new(configured)
        }
    }

    pub fn accumulate(&mut self, value: f64) {
        self.samples.push_back(value);
        if self.samples.len() > self.period {
            self.samples.pop_front();
        }
        // Recomputed rather than adjusted incrementally so float drift never builds up.
        self.sum = self.samples.iter().sum();
    }

    /// Mean of the current window, `None` before the first sample.
    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.sum / self.samples.len() as f64)
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
