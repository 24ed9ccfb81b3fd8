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

use crate::config::HistogramConfig;

/// One in Q30.
pub const Q30_ONE: i64 = 1 << 30;
/// One in Q15.
pub const Q15_ONE: i32 = 1 << 15;

/// Exponentially forgetting probability mass function over delay buckets.
#[derive(Debug, Clone)]
pub struct Histogram {
    /// Buckets hold probabilities in Q30 fixed point (sum = 1 << 30).
    buckets: Vec<i32>,
    /// Current forget factor in Q15 (0..=32767).
    forget_factor: i32,
    /// Steady-state forget factor (base) in Q15.
    base_forget_factor: i32,
    /// Number of times add() has been called since reset or construction.
    add_count: u32,
    /// Optional start weight used to ramp the forget factor.
    start_forget_weight: Option<f64>,
}

impl Histogram {
    /// Create a histogram with `num_buckets`, a steady-state forget factor in
    /// Q15 and an optional `start_forget_weight` controlling the ramp-up.
    pub fn new(
        num_buckets: usize,
        base_forget_factor_q15: i32,
        start_forget_weight: Option<f64>,
    ) -> Self {
        debug_assert!(num_buckets > 0, "histogram needs at least one bucket");
        debug_assert!(base_forget_factor_q15 < Q15_ONE);
        debug_assert!(base_forget_factor_q15 >= 0);

        let mut histogram = Histogram {
            buckets: vec![0i32; num_buckets.max(1)],
            forget_factor: 0,
            base_forget_factor: base_forget_factor_q15.clamp(0, Q15_ONE - 1),
            add_count: 0,
            start_forget_weight,
        };
        histogram.reset();
        histogram
    }

    pub fn from_config(num_buckets: usize, config: &HistogramConfig) -> Self {
        Self::new(
            num_buckets,
            config.forget_factor_q15,
            config.start_forget_weight,
        )
    }

    /// Register an observation in bucket `index`.
    ///
    /// All buckets are scaled by the current forget factor and the freed mass
    /// is given to `index`. Out-of-range indices are ignored.
    pub fn add(&mut self, index: usize) {
        debug_assert!(index < self.buckets.len());
        if index >= self.buckets.len() {
            return;
        }

        let mut vector_sum: i64 = 0;

        // Multiply each bucket by forget_factor (Q15).
        for b in self.buckets.iter_mut() {
            let tmp = ((*b as i64) * (self.forget_factor as i64)) >> 15;
            *b = tmp as i32;
            vector_sum += tmp;
        }

        // Add new sample: (32768 - forget_factor) << 15 (result in Q30)
        let add_amount: i64 = (Q15_ONE as i64 - self.forget_factor as i64) << 15;
        self.buckets[index] = (self.buckets[index] as i64 + add_amount) as i32;
        vector_sum += add_amount;

        // Desired sum is 1 << 30 (Q30).
        vector_sum -= Q30_ONE;

        if vector_sum != 0 {
            let flip_sign: i64 = if vector_sum > 0 { -1 } else { 1 };
            // Modify a few values early in buckets to compensate for rounding error.
            for b in self.buckets.iter_mut() {
                // Add/subtract 1/16 of the element, but not more than |vector_sum|.
                let correction = flip_sign * vector_sum.abs().min((*b as i64) >> 4).max(0);
                *b = (*b as i64 + correction) as i32;
                vector_sum += correction;
                if vector_sum == 0 {
                    break;
                }
            }
        }
        debug_assert_eq!(vector_sum, 0);

        self.add_count = self.add_count.saturating_add(1);
        self.ramp_forget_factor();
    }

    fn ramp_forget_factor(&mut self) {
        if self.forget_factor == self.base_forget_factor {
            return;
        }

        match self.start_forget_weight {
            Some(start_weight) => {
                let old_forget = self.forget_factor;

                // (1 << 15) * (1 - start_weight / (add_count + 1)), clamped to
                // [0, base_forget_factor].
                let forget_f = (Q15_ONE as f64
                    * (1.0 - start_weight / (self.add_count as f64 + 1.0)))
                    .round();
                self.forget_factor = 0.max(self.base_forget_factor.min(forget_f as i32));

                // The effective weight on the new sample must be no smaller
                // than the weight left on older samples.
                debug_assert!(
                    Q15_ONE - self.forget_factor
                        >= ((Q15_ONE - old_forget) * self.forget_factor) >> 15
                );
            }
            None => {
                self.forget_factor += (self.base_forget_factor - self.forget_factor + 3) >> 2;
            }
        }
    }

    /// Smallest bucket index whose cumulative probability reaches
    /// `probability_q30` (Q30). Falls back to the last bucket when the total
    /// mass is short of the requested probability.
    pub fn quantile(&self, probability_q30: i32) -> usize {
        debug_assert!(
            (0..=Q30_ONE).contains(&(probability_q30 as i64)),
            "probability must be in [0, 1 << 30]"
        );

        // Walk the reverse cumulative sum; stop once the remaining mass is at
        // most 1 - probability.
        let inverse_probability = Q30_ONE - probability_q30 as i64;
        let mut index = 0;
        let mut sum: i64 = Q30_ONE - self.buckets[0] as i64;

        let last = self.buckets.len() - 1;
        while sum > inverse_probability && index < last {
            index += 1;
            sum -= self.buckets[index] as i64;
        }

        index
    }

    /// Reset to an exponentially decaying distribution,
    /// `buckets[i] = 0.5^(i+1)` in Q30.
    pub fn reset(&mut self) {
        // Slightly more than one in Q14, so the sum lands as close to one as
        // the resolution allows.
        let mut temp_prob: u32 = 0x4002;
        for b in self.buckets.iter_mut() {
            temp_prob >>= 1;
            // Q14 << 16 = Q30
            *b = (temp_prob << 16) as i32;
        }
        self.forget_factor = 0;
        self.add_count = 0;
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn buckets(&self) -> &[i32] {
        &self.buckets
    }

    pub fn forget_factor(&self) -> i32 {
        self.forget_factor
    }

    pub fn base_forget_factor(&self) -> i32 {
        self.base_forget_factor
    }

    pub fn start_forget_weight(&self) -> Option<f64> {
        self.start_forget_weight
    }

    /// Sum of all buckets in Q30.
    pub fn total_mass(&self) -> i64 {
        self.buckets.iter().map(|&b| b as i64).sum()
    }

    #[cfg(test)]
    pub(crate) fn set_buckets(&mut self, buckets: Vec<i32>) {
        debug_assert_eq!(buckets.len(), self.buckets.len());
        self.buckets = buckets;
    }
}
