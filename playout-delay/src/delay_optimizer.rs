/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

use std::fmt;
use std::sync::Arc;

use crate::config::{DelayConfig, HistogramConfig};
use crate::histogram::Histogram;
use crate::tick_timer::{new_stopwatch, Clock, Stopwatch};
use crate::Result;

/// Turns a stream of relative arrival delays into a recommended target
/// delay.
pub trait DelayOptimizer: fmt::Debug {
    /// Feed one relative delay observation in milliseconds.
    fn update(&mut self, relative_delay_ms: i32);

    /// Current recommendation, or `None` before enough data has been seen.
    fn optimal_delay_ms(&self) -> Option<i32>;

    fn reset(&mut self);
}

/// Build the default optimizer for `config`.
pub fn create_underrun_optimizer(
    clock: Arc<dyn Clock>,
    config: &DelayConfig,
) -> Box<dyn DelayOptimizer + Send> {
    Box::new(UnderrunOptimizer::from_config(clock, config))
}

/// Picks the delay that keeps underruns below a target probability.
///
/// Relative delays are binned into a decaying histogram; the recommendation
/// is the upper edge of the bucket holding the configured quantile.
#[derive(Debug)]
pub struct UnderrunOptimizer {
    clock: Arc<dyn Clock>,
    histogram: Histogram,
    histogram_quantile: i32,
    bucket_size_ms: i32,
    resample_interval_ms: Option<i32>,
    resample_stopwatch: Option<Stopwatch>,
    max_delay_in_interval_ms: i32,
    optimal_delay_ms: Option<i32>,
}

impl UnderrunOptimizer {
    /// Build an optimizer with the default bucket layout.
    ///
    /// Fails when the quantile, forget factor or start weight is out of
    /// range.
    pub fn new(
        clock: Arc<dyn Clock>,
        histogram_quantile_q30: i32,
        forget_factor_q15: i32,
        start_forget_weight: Option<f64>,
        resample_interval_ms: Option<i32>,
    ) -> Result<Self> {
        let config = DelayConfig {
            histogram: HistogramConfig {
                quantile_q30: histogram_quantile_q30,
                forget_factor_q15,
                start_forget_weight,
            },
            resample_interval_ms,
            ..Default::default()
        };
        config.validate()?;
        Ok(Self::from_config(clock, &config))
    }

    pub fn from_config(clock: Arc<dyn Clock>, config: &DelayConfig) -> Self {
        Self {
            clock,
            histogram: Histogram::from_config(config.num_buckets, &config.histogram),
            histogram_quantile: config.histogram.quantile_q30,
            bucket_size_ms: config.bucket_size_ms,
            resample_interval_ms: config.resample_interval_ms,
            resample_stopwatch: None,
            max_delay_in_interval_ms: 0,
            optimal_delay_ms: None,
        }
    }

    pub fn histogram(&self) -> &Histogram {
        &self.histogram
    }

    pub fn bucket_size_ms(&self) -> i32 {
        self.bucket_size_ms
    }

    /// Returns the value to register this round, if any.
    ///
    /// When resampling, relative delay swings between high values and near
    /// zero under heavy jitter; the maximum per interval captures the peaks.
    fn next_histogram_sample(&mut self, relative_delay_ms: i32) -> Option<i32> {
        let Some(interval_ms) = self.resample_interval_ms else {
            return Some(relative_delay_ms);
        };

        let stopwatch = self
            .resample_stopwatch
            .get_or_insert_with(|| new_stopwatch(&self.clock));

        let mut sample = None;
        if stopwatch.elapsed_ms_i32() > interval_ms {
            sample = Some(self.max_delay_in_interval_ms);
            *stopwatch = new_stopwatch(&self.clock);
            self.max_delay_in_interval_ms = 0;
        }
        self.max_delay_in_interval_ms = self.max_delay_in_interval_ms.max(relative_delay_ms);
        sample
    }
}

impl DelayOptimizer for UnderrunOptimizer {
    fn update(&mut self, relative_delay_ms: i32) {
        let Some(sample) = self.next_histogram_sample(relative_delay_ms) else {
            return;
        };

        if sample < 0 {
            return;
        }
        let index = (sample / self.bucket_size_ms) as usize;
        if index < self.histogram.num_buckets() {
            // Delays beyond the last bucket (2000 ms by default) are dropped.
            self.histogram.add(index);
        }

        let bucket_index = self.histogram.quantile(self.histogram_quantile) as i32;
        self.optimal_delay_ms = Some((1 + bucket_index) * self.bucket_size_ms);
    }

    fn optimal_delay_ms(&self) -> Option<i32> {
        self.optimal_delay_ms
    }

    fn reset(&mut self) {
        self.histogram.reset();
        self.resample_stopwatch = None;
        self.max_delay_in_interval_ms = 0;
        self.optimal_delay_ms = None;
    }
}
