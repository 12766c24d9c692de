// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rolling window of recent queue-wait durations.
//!
//! The average over this window is sent to the server on every request so it can
//! size its batches to how fast the downstream queue is draining.

use std::collections::VecDeque;
use std::time::Duration;

pub const DEFAULT_WINDOW_SIZE: usize = 20;

#[derive(Debug, Clone)]
pub struct TimingTracker {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl Default for TimingTracker {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

impl TimingTracker {
    /// A zero capacity is bumped to one so the window can always hold the latest sample.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, sample: Duration) {
        self.record_secs(sample.as_secs_f64());
    }

    pub fn record_secs(&mut self, secs: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(secs);
    }

    /// Mean of the retained samples rounded to `precision` decimal digits, `0.0` when empty.
    #[must_use]
    pub fn average(&self, precision: u32) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let mean = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        round_to(mean, precision)
    }
}

pub(crate) fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(i32::try_from(precision).unwrap_or(i32::MAX).min(15));
    (value * factor).round() / factor
}
