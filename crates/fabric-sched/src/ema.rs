//! Running exponential moving average
//!
//! The weight of the n-th sample is `k = 2 / (n + 1)`, so the first sample
//! becomes the average outright and later samples weigh progressively less:
//! `ema_n = x_n * k + ema_{n-1} * (1 - k)`, starting from `ema_0 = 0`.

use serde::{Deserialize, Serialize};

/// Exponential moving average with a sample-count-driven weight
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExponentialMovingAverage {
    samples: u64,
    value: f64,
}

impl ExponentialMovingAverage {
    /// Empty average
    #[must_use]
    pub const fn new() -> Self {
        Self {
            samples: 0,
            value: 0.0,
        }
    }

    /// Feed one sample and return the updated average
    pub fn update(&mut self, sample: f64) -> f64 {
        self.samples += 1;
        #[allow(clippy::cast_precision_loss)]
        let k = 2.0 / (self.samples as f64 + 1.0);
        self.value = sample * k + self.value * (1.0 - k);
        self.value
    }

    /// Current average, 0 before any sample
    #[must_use]
    pub const fn value(&self) -> f64 {
        self.value
    }

    /// Number of samples seen
    #[must_use]
    pub const fn samples(&self) -> u64 {
        self.samples
    }
}
