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

use std::sync::Arc;

use crate::config::{DelayConfig, K_MAX_BASE_MINIMUM_DELAY_MS, K_MIN_BASE_MINIMUM_DELAY_MS};
use crate::delay_optimizer::{create_underrun_optimizer, DelayOptimizer};
use crate::relative_delay::{RelativeArrivalDelayTracker, TrackerConfig};
use crate::stats::DelayManagerStats;
use crate::tick_timer::Clock;
use crate::Result;

/// Delay manager for adaptive jitter buffer control.
///
/// Call [`DelayManager::update`] once per received packet and poll
/// [`DelayManager::target_delay_ms`] from the playout side. The manager is
/// single-owner: every method takes `&mut self` or `&self` and there is no
/// internal locking. Callers that touch it from several threads must
/// serialize access themselves.
#[derive(Debug)]
pub struct DelayManager {
    config: DelayConfig,
    arrival_delay_tracker: RelativeArrivalDelayTracker,
    delay_optimizer: Box<dyn DelayOptimizer + Send>,
    base_minimum_delay_ms: i32,
    minimum_delay_ms: i32,
    maximum_delay_ms: i32,
    effective_minimum_delay_ms: i32,
    target_level_ms: i32,
    last_pack_cng_or_dtmf: i32,
}

impl DelayManager {
    /// Create a delay manager with the default underrun optimizer.
    pub fn new(config: DelayConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        log::info!(
            "Delay histogram config: quantile={} forget_factor={} start_forget_weight={}",
            config.histogram.quantile_q30,
            config.histogram.forget_factor_q15,
            config.histogram.start_forget_weight.unwrap_or(0.0)
        );

        let tracker = RelativeArrivalDelayTracker::new(TrackerConfig::from(&config), clock.clone());
        let optimizer = create_underrun_optimizer(clock, &config);
        Self::with_components(config, tracker, optimizer)
    }

    /// Create a delay manager around caller-supplied components.
    pub fn with_components(
        config: DelayConfig,
        arrival_delay_tracker: RelativeArrivalDelayTracker,
        delay_optimizer: Box<dyn DelayOptimizer + Send>,
    ) -> Result<Self> {
        config.validate()?;

        let mut manager = Self {
            base_minimum_delay_ms: config.base_minimum_delay_ms,
            minimum_delay_ms: 0,
            maximum_delay_ms: 0,
            effective_minimum_delay_ms: config.base_minimum_delay_ms,
            target_level_ms: config.start_delay_ms,
            last_pack_cng_or_dtmf: 1,
            arrival_delay_tracker,
            delay_optimizer,
            config,
        };
        manager.reset();
        Ok(manager)
    }

    /// Update the delay manager with a new packet.
    ///
    /// Returns the relative arrival delay of the packet for diagnostics;
    /// `None` for the first packet after construction or reset, when `reset`
    /// is set, and when `sample_rate_hz` is unusable. The target delay is
    /// re-limited in every case.
    pub fn update(&mut self, timestamp: u32, sample_rate_hz: i32, reset: bool) -> Option<i32> {
        if sample_rate_hz <= 0 {
            log::warn!("Ignoring packet ts={timestamp} with sample rate {sample_rate_hz} Hz");
            return None;
        }

        let relative_delay = self
            .arrival_delay_tracker
            .update(timestamp, sample_rate_hz, reset);

        if let Some(relative_delay) = relative_delay {
            self.delay_optimizer.update(relative_delay);
            if let Some(optimal_delay_ms) = self.delay_optimizer.optimal_delay_ms() {
                let previous = self.target_level_ms;
                self.target_level_ms = optimal_delay_ms.max(1);
                if previous != self.target_level_ms {
                    log::debug!(
                        "Target delay updated: {}ms -> {}ms (min {}ms, max {}ms)",
                        previous,
                        self.target_level_ms,
                        self.effective_minimum_delay_ms,
                        self.maximum_delay_ms
                    );
                }
            }
        }

        self.limit_target_level();
        relative_delay
    }

    /// Reset statistics and the target delay; operator limits are kept.
    pub fn reset(&mut self) {
        self.delay_optimizer.reset();
        self.arrival_delay_tracker.reset();
        self.target_level_ms = self.config.start_delay_ms;
        self.last_pack_cng_or_dtmf = 1;
        self.limit_target_level();
    }

    /// Restart inter-arrival timing from now, e.g. after a pause in
    /// transmission.
    pub fn reset_packet_iat_count(&mut self) {
        self.arrival_delay_tracker.reset_stopwatch();
    }

    /// Get the current target delay in milliseconds
    pub fn target_delay_ms(&self) -> i32 {
        self.target_level_ms
    }

    /// Record whether the last decoded frame was comfort noise or DTMF.
    pub fn last_decoded_was_cng_or_dtmf(&mut self, it_was: bool) {
        if it_was {
            self.last_pack_cng_or_dtmf = 1;
        } else if self.last_pack_cng_or_dtmf != 0 {
            self.last_pack_cng_or_dtmf = -1;
        }
    }

    /// 1 while CNG/DTMF is playing, -1 once speech resumed after it, 0 when
    /// cleared by the caller.
    pub fn last_pack_cng_or_dtmf(&self) -> i32 {
        self.last_pack_cng_or_dtmf
    }

    /// Overwrite the CNG/DTMF marker, e.g. 0 to clear it.
    pub fn set_last_pack_cng_or_dtmf(&mut self, value: i32) {
        self.last_pack_cng_or_dtmf = value;
    }

    /// Set the minimum delay. Fails for values outside
    /// `[0, minimum_delay_upper_bound()]`.
    pub fn set_minimum_delay(&mut self, delay_ms: i32) -> bool {
        if !self.is_valid_minimum_delay(delay_ms) {
            log::warn!(
                "Rejected minimum delay {}ms (upper bound {}ms)",
                delay_ms,
                self.minimum_delay_upper_bound()
            );
            return false;
        }

        self.minimum_delay_ms = delay_ms;
        self.update_effective_minimum_delay();
        true
    }

    /// Set the maximum delay; 0 removes the limit. Fails when below the
    /// minimum delay.
    pub fn set_maximum_delay(&mut self, delay_ms: i32) -> bool {
        if delay_ms != 0 && (delay_ms < 0 || delay_ms < self.minimum_delay_ms) {
            log::warn!(
                "Rejected maximum delay {}ms (minimum delay {}ms)",
                delay_ms,
                self.minimum_delay_ms
            );
            return false;
        }

        self.maximum_delay_ms = delay_ms;
        self.update_effective_minimum_delay();
        true
    }

    /// Set the base minimum delay. Fails for values outside `[0, 10000]`.
    pub fn set_base_minimum_delay(&mut self, delay_ms: i32) -> bool {
        if !(K_MIN_BASE_MINIMUM_DELAY_MS..=K_MAX_BASE_MINIMUM_DELAY_MS).contains(&delay_ms) {
            log::warn!("Rejected base minimum delay {delay_ms}ms");
            return false;
        }

        self.base_minimum_delay_ms = delay_ms;
        self.update_effective_minimum_delay();
        true
    }

    /// Base minimum delay as last set, before clamping.
    pub fn base_minimum_delay_ms(&self) -> i32 {
        self.base_minimum_delay_ms
    }

    /// Minimum delay requested by the caller.
    pub fn minimum_delay_ms(&self) -> i32 {
        self.minimum_delay_ms
    }

    /// Maximum delay; 0 means unconstrained.
    pub fn maximum_delay_ms(&self) -> i32 {
        self.maximum_delay_ms
    }

    /// Lower bound actually applied to the target delay.
    pub fn effective_minimum_delay_ms(&self) -> i32 {
        self.effective_minimum_delay_ms
    }

    /// Reordered packets seen in a row since the reference last moved.
    pub fn num_reordered_packets(&self) -> u32 {
        self.arrival_delay_tracker.num_reordered_packets()
    }

    /// Read-only view of the arrival delay tracker.
    pub fn arrival_delay_tracker(&self) -> &RelativeArrivalDelayTracker {
        &self.arrival_delay_tracker
    }

    /// Configuration the manager was built with.
    pub fn config(&self) -> &DelayConfig {
        &self.config
    }

    /// Snapshot of the current delay state.
    pub fn stats(&self) -> DelayManagerStats {
        DelayManagerStats {
            target_delay_ms: self.target_level_ms,
            optimal_delay_ms: self.delay_optimizer.optimal_delay_ms(),
            effective_minimum_delay_ms: self.effective_minimum_delay_ms,
            minimum_delay_ms: self.minimum_delay_ms,
            maximum_delay_ms: self.maximum_delay_ms,
            base_minimum_delay_ms: self.base_minimum_delay_ms,
            num_reordered_packets: self.arrival_delay_tracker.num_reordered_packets(),
            history_len: self.arrival_delay_tracker.history_len(),
        }
    }

    fn is_valid_minimum_delay(&self, delay_ms: i32) -> bool {
        (0..=self.minimum_delay_upper_bound()).contains(&delay_ms)
    }

    /// The tightest configured ceiling; an unset maximum means the base
    /// minimum delay range is the only bound.
    fn minimum_delay_upper_bound(&self) -> i32 {
        if self.maximum_delay_ms > 0 {
            self.maximum_delay_ms
        } else {
            K_MAX_BASE_MINIMUM_DELAY_MS
        }
    }

    fn update_effective_minimum_delay(&mut self) {
        // Clamp the base minimum into the range that can actually be used.
        let base_minimum_delay_ms = self
            .base_minimum_delay_ms
            .clamp(0, self.minimum_delay_upper_bound());
        self.effective_minimum_delay_ms = self.minimum_delay_ms.max(base_minimum_delay_ms);
        self.limit_target_level();
    }

    /// Enforce the lower limit `effective_minimum_delay_ms` and the upper
    /// limit `maximum_delay_ms` on the target level.
    fn limit_target_level(&mut self) {
        if self.effective_minimum_delay_ms > 0 {
            self.target_level_ms = self.target_level_ms.max(self.effective_minimum_delay_ms);
        }

        if self.maximum_delay_ms > 0 {
            self.target_level_ms = self.target_level_ms.min(self.maximum_delay_ms);
        }

        self.target_level_ms = self.target_level_ms.max(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::K_START_DELAY_MS;
    use crate::tick_timer::TickTimer;

    const FS_HZ: i32 = 8000;
    const TS_PER_PACKET: u32 = 160; // 20 ms at 8 kHz
    const FRAME_MS: u64 = 20;

    struct Fixture {
        timer: Arc<TickTimer>,
        dm: DelayManager,
        ts: u32,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_config(DelayConfig::default())
        }

        fn with_config(config: DelayConfig) -> Self {
            let timer = Arc::new(TickTimer::new());
            let dm = DelayManager::new(config, timer.clone()).unwrap();
            Self { timer, dm, ts: 0x1234_5678 }
        }

        fn insert_next_packet(&mut self) -> Option<i32> {
            let result = self.dm.update(self.ts, FS_HZ, false);
            self.ts = self.ts.wrapping_add(TS_PER_PACKET);
            result
        }

        fn advance(&self, ms: u64) {
            self.timer.advance_ms(ms);
        }
    }

    #[derive(Debug)]
    struct FakeOptimizer {
        recommendation: Option<i32>,
        observations: Vec<i32>,
    }

    impl DelayOptimizer for FakeOptimizer {
        fn update(&mut self, relative_delay_ms: i32) {
            self.observations.push(relative_delay_ms);
        }

        fn optimal_delay_ms(&self) -> Option<i32> {
            self.recommendation
        }

        fn reset(&mut self) {
            self.observations.clear();
        }
    }

    #[test]
    fn test_delay_manager_creation() {
        let f = Fixture::new();
        assert_eq!(f.dm.target_delay_ms(), K_START_DELAY_MS);
        assert_eq!(f.dm.base_minimum_delay_ms(), 0);
        assert_eq!(f.dm.last_pack_cng_or_dtmf(), 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let timer: Arc<dyn Clock> = Arc::new(TickTimer::new());
        let config = DelayConfig {
            base_minimum_delay_ms: -1,
            ..Default::default()
        };
        assert!(DelayManager::new(config, timer).is_err());
    }

    #[test]
    fn test_update_normal() {
        let mut f = Fixture::new();
        assert_eq!(f.insert_next_packet(), None);

        // Advance time by one frame size.
        f.advance(FRAME_MS);
        assert_eq!(f.insert_next_packet(), Some(0));
        // On-time arrival puts all mass in bucket 0: target 20 ms.
        assert_eq!(f.dm.target_delay_ms(), 20);
    }

    #[test]
    fn test_update_long_inter_arrival_time() {
        let mut f = Fixture::new();
        f.insert_next_packet();

        // Advance time by two frame sizes.
        f.advance(2 * FRAME_MS);
        assert_eq!(f.insert_next_packet(), Some(20));
        // 20 ms delay lands in bucket 1: target 40 ms.
        assert_eq!(f.dm.target_delay_ms(), 40);
    }

    #[test]
    fn test_minimum_delay_raises_target() {
        let mut f = Fixture::new();
        f.insert_next_packet();
        f.advance(FRAME_MS);
        f.insert_next_packet();
        assert_eq!(f.dm.target_delay_ms(), 20);

        assert!(f.dm.set_minimum_delay(100));
        assert_eq!(f.dm.effective_minimum_delay_ms(), 100);
        assert_eq!(f.dm.target_delay_ms(), 100);

        f.advance(FRAME_MS);
        f.insert_next_packet();
        assert_eq!(f.dm.target_delay_ms(), 100);
    }

    #[test]
    fn test_maximum_delay_caps_target() {
        let mut f = Fixture::new();
        f.insert_next_packet();
        // 200 ms late
        f.advance(220);
        f.insert_next_packet();
        assert_eq!(f.dm.target_delay_ms(), 220);

        assert!(f.dm.set_maximum_delay(100));
        assert_eq!(f.dm.target_delay_ms(), 100);

        f.advance(220);
        f.insert_next_packet();
        assert_eq!(f.dm.target_delay_ms(), 100);
    }

    #[test]
    fn test_base_minimum_delay() {
        let mut f = Fixture::new();
        assert!(f.dm.set_base_minimum_delay(150));
        assert_eq!(f.dm.base_minimum_delay_ms(), 150);
        assert_eq!(f.dm.effective_minimum_delay_ms(), 150);

        f.insert_next_packet();
        f.advance(FRAME_MS);
        f.insert_next_packet();
        assert_eq!(f.dm.target_delay_ms(), 150);
    }

    #[test]
    fn test_base_minimum_delay_clamped_by_maximum() {
        let mut f = Fixture::new();
        assert!(f.dm.set_maximum_delay(100));
        assert!(f.dm.set_base_minimum_delay(300));
        // The base minimum is stored as given but only 100 ms is usable.
        assert_eq!(f.dm.base_minimum_delay_ms(), 300);
        assert_eq!(f.dm.effective_minimum_delay_ms(), 100);

        assert!(f.dm.set_maximum_delay(0));
        assert_eq!(f.dm.effective_minimum_delay_ms(), 300);
    }

    #[test]
    fn test_minimum_delay_wins_over_smaller_base_minimum() {
        let mut f = Fixture::new();
        assert!(f.dm.set_base_minimum_delay(50));
        assert!(f.dm.set_minimum_delay(120));
        assert_eq!(f.dm.effective_minimum_delay_ms(), 120);

        assert!(f.dm.set_minimum_delay(10));
        assert_eq!(f.dm.effective_minimum_delay_ms(), 50);
    }

    #[test]
    fn test_setter_validation() {
        let mut f = Fixture::new();

        assert!(!f.dm.set_minimum_delay(-1));
        assert!(f.dm.set_minimum_delay(10000));
        assert!(!f.dm.set_minimum_delay(10001));
        assert!(f.dm.set_minimum_delay(10));

        assert!(!f.dm.set_maximum_delay(5));
        assert!(!f.dm.set_maximum_delay(-5));
        assert!(f.dm.set_maximum_delay(10));
        assert!(!f.dm.set_minimum_delay(11));
        assert!(f.dm.set_maximum_delay(0));

        assert!(!f.dm.set_base_minimum_delay(-1));
        assert!(!f.dm.set_base_minimum_delay(10001));
        assert!(f.dm.set_base_minimum_delay(0));
        assert!(f.dm.set_base_minimum_delay(10000));
    }

    #[test]
    fn test_rejected_setter_leaves_state_unchanged() {
        let mut f = Fixture::new();
        assert!(f.dm.set_minimum_delay(10));
        let target = f.dm.target_delay_ms();
        let effective = f.dm.effective_minimum_delay_ms();

        assert!(!f.dm.set_minimum_delay(-1));
        assert!(!f.dm.set_maximum_delay(5));
        assert_eq!(f.dm.target_delay_ms(), target);
        assert_eq!(f.dm.effective_minimum_delay_ms(), effective);
        assert_eq!(f.dm.minimum_delay_ms(), 10);
        assert_eq!(f.dm.maximum_delay_ms(), 0);
    }

    #[test]
    fn test_invalid_sample_rate_is_noop() {
        let mut f = Fixture::new();
        assert_eq!(f.dm.update(0, 0, false), None);
        assert_eq!(f.dm.update(0, -1, false), None);
        assert!(!f.dm.arrival_delay_tracker().is_tracking());
        assert_eq!(f.dm.target_delay_ms(), K_START_DELAY_MS);
    }

    #[test]
    fn test_delay_manager_reset() {
        let mut f = Fixture::new();
        assert!(f.dm.set_minimum_delay(30));
        f.insert_next_packet();
        f.advance(FRAME_MS);
        f.insert_next_packet();
        assert_eq!(f.dm.target_delay_ms(), 30);

        f.dm.last_decoded_was_cng_or_dtmf(false);
        f.dm.reset();
        assert_eq!(f.dm.target_delay_ms(), K_START_DELAY_MS);
        assert_eq!(f.dm.minimum_delay_ms(), 30);
        assert_eq!(f.dm.last_pack_cng_or_dtmf(), 1);
        // The next packet is treated as the first one again.
        assert_eq!(f.insert_next_packet(), None);
    }

    #[test]
    fn test_reset_clears_histogram() {
        let mut f = Fixture::new();
        f.insert_next_packet();
        for _ in 0..5 {
            // 200 ms late each time
            f.advance(220);
            f.insert_next_packet();
        }
        assert!(f.dm.target_delay_ms() >= 200, "target {}", f.dm.target_delay_ms());

        f.dm.reset();
        assert_eq!(f.dm.stats().optimal_delay_ms, None);

        assert_eq!(f.insert_next_packet(), None);
        f.advance(FRAME_MS);
        assert_eq!(f.insert_next_packet(), Some(0));
        // Nothing of the late packets survives in the histogram.
        assert_eq!(f.dm.target_delay_ms(), 20);
        assert_eq!(f.dm.stats().optimal_delay_ms, Some(20));
    }

    #[test]
    fn test_reset_respects_maximum_delay() {
        let mut f = Fixture::new();
        assert!(f.dm.set_maximum_delay(60));
        f.dm.reset();
        assert_eq!(f.dm.target_delay_ms(), 60);
    }

    #[test]
    fn test_update_with_reset_flag() {
        let mut f = Fixture::new();
        f.insert_next_packet();
        f.advance(FRAME_MS);
        assert_eq!(f.insert_next_packet(), Some(0));

        f.advance(1000);
        assert_eq!(f.dm.update(f.ts, FS_HZ, true), None);
        f.ts = f.ts.wrapping_add(TS_PER_PACKET);
        f.advance(FRAME_MS);
        assert_eq!(f.insert_next_packet(), Some(0));
    }

    #[test]
    fn test_reset_packet_iat_count() {
        let mut f = Fixture::new();
        f.insert_next_packet();
        f.advance(500);
        f.dm.reset_packet_iat_count();
        f.advance(FRAME_MS);
        assert_eq!(f.insert_next_packet(), Some(0));
    }

    #[test]
    fn test_cng_or_dtmf_marker() {
        let mut f = Fixture::new();
        assert_eq!(f.dm.last_pack_cng_or_dtmf(), 1);
        f.dm.last_decoded_was_cng_or_dtmf(false);
        assert_eq!(f.dm.last_pack_cng_or_dtmf(), -1);
        f.dm.set_last_pack_cng_or_dtmf(0);
        f.dm.last_decoded_was_cng_or_dtmf(false);
        assert_eq!(f.dm.last_pack_cng_or_dtmf(), 0);
        f.dm.last_decoded_was_cng_or_dtmf(true);
        assert_eq!(f.dm.last_pack_cng_or_dtmf(), 1);
    }

    #[test]
    fn test_injected_optimizer_drives_target() {
        let timer = Arc::new(TickTimer::new());
        let config = DelayConfig::default();
        let tracker = RelativeArrivalDelayTracker::new(TrackerConfig::from(&config), timer.clone());
        let optimizer = FakeOptimizer {
            recommendation: Some(250),
            observations: Vec::new(),
        };
        let mut dm = DelayManager::with_components(config, tracker, Box::new(optimizer)).unwrap();

        dm.update(0, FS_HZ, false);
        // No relative delay yet, so the optimizer was not consulted.
        assert_eq!(dm.target_delay_ms(), K_START_DELAY_MS);

        timer.advance_ms(FRAME_MS);
        dm.update(TS_PER_PACKET, FS_HZ, false);
        assert_eq!(dm.target_delay_ms(), 250);

        assert!(dm.set_maximum_delay(200));
        assert_eq!(dm.target_delay_ms(), 200);
        assert_eq!(dm.stats().optimal_delay_ms, Some(250));
    }

    #[test]
    fn test_optimizer_without_recommendation_keeps_target() {
        let timer = Arc::new(TickTimer::new());
        let config = DelayConfig::default();
        let tracker = RelativeArrivalDelayTracker::new(TrackerConfig::from(&config), timer.clone());
        let optimizer = FakeOptimizer {
            recommendation: None,
            observations: Vec::new(),
        };
        let mut dm = DelayManager::with_components(config, tracker, Box::new(optimizer)).unwrap();

        dm.update(0, FS_HZ, false);
        timer.advance_ms(FRAME_MS);
        assert_eq!(dm.update(TS_PER_PACKET, FS_HZ, false), Some(0));
        assert_eq!(dm.target_delay_ms(), K_START_DELAY_MS);
    }

    #[test]
    fn test_stats_snapshot() {
        let mut f = Fixture::new();
        assert!(f.dm.set_minimum_delay(40));
        f.insert_next_packet();
        f.advance(FRAME_MS);
        f.insert_next_packet();

        let stats = f.dm.stats();
        assert_eq!(stats.target_delay_ms, 40);
        assert_eq!(stats.optimal_delay_ms, Some(20));
        assert_eq!(stats.effective_minimum_delay_ms, 40);
        assert_eq!(stats.history_len, 1);
        assert_eq!(stats.num_reordered_packets, 0);
    }
}
