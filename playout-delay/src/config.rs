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

use serde::{Deserialize, Serialize};

use crate::{DelayError, Result};

/// Initial target delay before the histogram has seen any traffic.
///
/// 80 ms holds four 20 ms packets, enough to ride out typical jitter until
/// the statistics settle.
pub const K_START_DELAY_MS: i32 = 80;

pub const K_DELAY_BUCKETS: usize = 100;
pub const K_BUCKET_SIZE_MS: i32 = 20;

/// Oldest packet, in RTP time, kept when computing relative arrival delay.
pub const K_MAX_HISTORY_MS: i32 = 2000;

/// Consecutive reordered packets tolerated before the reference moves.
pub const K_MAX_REORDERED_PACKETS: u32 = 10;

pub const K_MIN_BASE_MINIMUM_DELAY_MS: i32 = 0;
pub const K_MAX_BASE_MINIMUM_DELAY_MS: i32 = 10000;

/// 0.97 in Q30.
pub const K_DEFAULT_QUANTILE_Q30: i32 = 1041529569;
/// 0.9993 in Q15.
pub const K_DEFAULT_FORGET_FACTOR_Q15: i32 = 32745;
pub const K_DEFAULT_START_FORGET_WEIGHT: f64 = 2.0;

const HISTOGRAM_CONFIG_PREFIX: &str = "Enabled-";

/// Convert a percentile in `[0, 100]` to a Q30 quantile.
pub fn percentile_to_quantile(percentile: f64) -> i32 {
    ((1u64 << 30) as f64 * percentile / 100.0 + 0.5) as i32
}

/// Histogram policy used by the underrun optimizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramConfig {
    /// Target quantile in Q30
    pub quantile_q30: i32,
    /// Steady-state forget factor in Q15
    pub forget_factor_q15: i32,
    /// Ramp weight for the forget factor; `None` selects the step ramp
    pub start_forget_weight: Option<f64>,
}

impl Default for HistogramConfig {
    fn default() -> Self {
        Self {
            quantile_q30: K_DEFAULT_QUANTILE_Q30,
            forget_factor_q15: K_DEFAULT_FORGET_FACTOR_Q15,
            start_forget_weight: Some(K_DEFAULT_START_FORGET_WEIGHT),
        }
    }
}

impl HistogramConfig {
    /// Parse a compact override of the form
    /// `Enabled-<percentile>-<forget_factor>[-<start_forget_weight>]`,
    /// e.g. `Enabled-96-0.998-1.5`.
    ///
    /// A start weight below 1 disables the weighted ramp.
    pub fn parse(value: &str) -> Result<Self> {
        let fields = value
            .trim()
            .strip_prefix(HISTOGRAM_CONFIG_PREFIX)
            .ok_or_else(|| {
                DelayError::InvalidHistogramConfig(format!(
                    "expected '{HISTOGRAM_CONFIG_PREFIX}' prefix in '{value}'"
                ))
            })?;

        let numbers = fields
            .split('-')
            .map(|field| {
                field.parse::<f64>().map_err(|e| {
                    DelayError::InvalidHistogramConfig(format!("bad number '{field}': {e}"))
                })
            })
            .collect::<Result<Vec<f64>>>()?;

        let (percentile, forget_factor, start_forget_weight) = match numbers.as_slice() {
            [p, f] => (*p, *f, None),
            [p, f, w] => (*p, *f, Some(*w)),
            _ => {
                return Err(DelayError::InvalidHistogramConfig(format!(
                    "expected 2 or 3 fields, got {}",
                    numbers.len()
                )))
            }
        };

        if !(0.0..=100.0).contains(&percentile) {
            return Err(DelayError::InvalidHistogramConfig(format!(
                "percentile {percentile} outside [0, 100]"
            )));
        }
        if !(0.0..=1.0).contains(&forget_factor) {
            return Err(DelayError::InvalidHistogramConfig(format!(
                "forget factor {forget_factor} outside [0, 1]"
            )));
        }

        Ok(Self {
            quantile_q30: percentile_to_quantile(percentile),
            // A factor of exactly 1.0 would never forget; keep it just below.
            forget_factor_q15: (((1 << 15) as f64 * forget_factor) as i32).min((1 << 15) - 1),
            start_forget_weight: start_forget_weight.filter(|w| *w >= 1.0),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !(0..=(1 << 30)).contains(&self.quantile_q30) {
            return Err(DelayError::InvalidConfig(format!(
                "quantile_q30 {} outside [0, 1 << 30]",
                self.quantile_q30
            )));
        }
        if !(0..(1 << 15)).contains(&self.forget_factor_q15) {
            return Err(DelayError::InvalidConfig(format!(
                "forget_factor_q15 {} outside [0, 1 << 15)",
                self.forget_factor_q15
            )));
        }
        if let Some(weight) = self.start_forget_weight {
            if weight.is_nan() || weight < 1.0 {
                return Err(DelayError::InvalidConfig(format!(
                    "start_forget_weight {weight} must be at least 1"
                )));
            }
        }
        Ok(())
    }
}

/// Configuration for the delay manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayConfig {
    /// Histogram quantile and forgetting policy
    pub histogram: HistogramConfig,
    /// Register the maximum relative delay per interval instead of every
    /// sample
    pub resample_interval_ms: Option<i32>,
    /// RTP time span of the relative delay window
    pub max_history_ms: i32,
    /// Consecutive reordered packets tolerated before the reference moves
    pub max_reordered_packets: u32,
    /// Keep the reference packet while reordered packets arrive
    pub enable_reorder_tolerance: bool,
    /// Base minimum delay in milliseconds
    pub base_minimum_delay_ms: i32,
    pub num_buckets: usize,
    pub bucket_size_ms: i32,
    /// Target delay used until the first recommendation
    pub start_delay_ms: i32,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            histogram: HistogramConfig::default(),
            resample_interval_ms: None,
            max_history_ms: K_MAX_HISTORY_MS,
            max_reordered_packets: K_MAX_REORDERED_PACKETS,
            enable_reorder_tolerance: true,
            base_minimum_delay_ms: 0,
            num_buckets: K_DELAY_BUCKETS,
            bucket_size_ms: K_BUCKET_SIZE_MS,
            start_delay_ms: K_START_DELAY_MS,
        }
    }
}

impl DelayConfig {
    pub fn validate(&self) -> Result<()> {
        self.histogram.validate()?;

        if let Some(interval) = self.resample_interval_ms {
            if interval <= 0 {
                return Err(DelayError::InvalidConfig(format!(
                    "resample_interval_ms {interval} must be positive"
                )));
            }
        }
        if self.max_history_ms <= 0 {
            return Err(DelayError::InvalidConfig(format!(
                "max_history_ms {} must be positive",
                self.max_history_ms
            )));
        }
        if self.num_buckets == 0 {
            return Err(DelayError::InvalidConfig(
                "num_buckets must be positive".to_string(),
            ));
        }
        if self.bucket_size_ms <= 0 {
            return Err(DelayError::InvalidConfig(format!(
                "bucket_size_ms {} must be positive",
                self.bucket_size_ms
            )));
        }
        if !(K_MIN_BASE_MINIMUM_DELAY_MS..=K_MAX_BASE_MINIMUM_DELAY_MS)
            .contains(&self.base_minimum_delay_ms)
        {
            return Err(DelayError::InvalidConfig(format!(
                "base_minimum_delay_ms {} outside [{}, {}]",
                self.base_minimum_delay_ms,
                K_MIN_BASE_MINIMUM_DELAY_MS,
                K_MAX_BASE_MINIMUM_DELAY_MS
            )));
        }
        if self.start_delay_ms < 0 {
            return Err(DelayError::InvalidConfig(format!(
                "start_delay_ms {} must not be negative",
                self.start_delay_ms
            )));
        }
        Ok(())
    }
}
