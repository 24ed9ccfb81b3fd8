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

use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::{DelayConfig, K_MAX_HISTORY_MS, K_MAX_REORDERED_PACKETS};
use crate::tick_timer::{new_stopwatch, Clock, Stopwatch};

const TIMESTAMP_BREAKPOINT: u32 = 0x8000_0000;

/// Wrap-aware RTP timestamp ordering.
///
/// `timestamp` is newer than `prev` when it lies less than half the 32-bit
/// range ahead. Equal timestamps are not newer; a difference of exactly half
/// the range resolves toward the numerically larger value.
pub fn is_newer_timestamp(timestamp: u32, prev: u32) -> bool {
    let diff = timestamp.wrapping_sub(prev);
    if diff == TIMESTAMP_BREAKPOINT {
        return timestamp > prev;
    }
    timestamp != prev && diff < TIMESTAMP_BREAKPOINT
}

/// Tracker settings
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    /// RTP time span of the window, in milliseconds
    pub max_history_ms: i32,
    /// Consecutive reordered packets tolerated before the reference moves
    pub max_reordered_packets: u32,
    /// Keep the reference packet while reordered packets arrive
    pub enable_reorder_tolerance: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_history_ms: K_MAX_HISTORY_MS,
            max_reordered_packets: K_MAX_REORDERED_PACKETS,
            enable_reorder_tolerance: true,
        }
    }
}

impl From<&DelayConfig> for TrackerConfig {
    fn from(config: &DelayConfig) -> Self {
        Self {
            max_history_ms: config.max_history_ms,
            max_reordered_packets: config.max_reordered_packets,
            enable_reorder_tolerance: config.enable_reorder_tolerance,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PacketDelay {
    iat_delay_ms: i32,
    timestamp: u32,
}

#[derive(Debug)]
enum TrackerState {
    AwaitingFirstPacket,
    Tracking {
        /// RTP timestamp of the reference packet
        last_timestamp: u32,
        /// Started when the reference packet arrived
        stopwatch: Stopwatch,
    },
}

/// Relative arrival delay tracker.
///
/// For each packet it compares the wall-clock inter-arrival time with the
/// spacing implied by the RTP clock and accumulates the difference over a
/// sliding window of RTP time.
#[derive(Debug)]
pub struct RelativeArrivalDelayTracker {
    config: TrackerConfig,
    clock: Arc<dyn Clock>,
    state: TrackerState,
    delay_history: VecDeque<PacketDelay>,
    num_reordered_packets: u32,
}

impl RelativeArrivalDelayTracker {
    pub fn new(config: TrackerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: TrackerState::AwaitingFirstPacket,
            delay_history: VecDeque::new(),
            num_reordered_packets: 0,
        }
    }

    /// Update with a new packet arrival.
    ///
    /// Returns the relative arrival delay in milliseconds, or `None` for the
    /// first packet, after `reset`, and for sample rates below 1 kHz.
    pub fn update(&mut self, timestamp: u32, sample_rate_hz: i32, reset: bool) -> Option<i32> {
        let ticks_per_ms = sample_rate_hz / 1000;
        if ticks_per_ms <= 0 {
            log::warn!("Ignoring packet with unusable sample rate {sample_rate_hz} Hz");
            return None;
        }

        let (last_timestamp, iat_ms) = match &self.state {
            TrackerState::Tracking {
                last_timestamp,
                stopwatch,
            } if !reset => (*last_timestamp, stopwatch.elapsed_ms_i32()),
            _ => {
                self.restart_from(timestamp);
                return None;
            }
        };

        // Positive means the packet is late, negative means it is early.
        let ts_diff = timestamp.wrapping_sub(last_timestamp) as i32;
        let expected_iat_ms = ts_diff / ticks_per_ms;
        let iat_delay_ms = iat_ms.saturating_sub(expected_iat_ms);

        let reordered = !is_newer_timestamp(timestamp, last_timestamp);
        let relative_delay = if reordered {
            iat_delay_ms.max(0)
        } else {
            self.update_delay_history(iat_delay_ms, timestamp, sample_rate_hz);
            self.calculate_relative_packet_arrival_delay()
        };

        if reordered
            && self.config.enable_reorder_tolerance
            && self.num_reordered_packets < self.config.max_reordered_packets
        {
            self.num_reordered_packets += 1;
            log::trace!(
                "Reordered packet ts={} (reference ts={}), {} in a row",
                timestamp,
                last_timestamp,
                self.num_reordered_packets
            );
            return Some(relative_delay);
        }

        self.num_reordered_packets = 0;
        self.state = TrackerState::Tracking {
            last_timestamp: timestamp,
            stopwatch: new_stopwatch(&self.clock),
        };
        Some(relative_delay)
    }

    /// Forget all history; the next packet becomes the first packet.
    pub fn reset(&mut self) {
        self.state = TrackerState::AwaitingFirstPacket;
        self.delay_history.clear();
        self.num_reordered_packets = 0;
    }

    /// Restart the inter-arrival stopwatch without touching the window.
    pub fn reset_stopwatch(&mut self) {
        if let TrackerState::Tracking { stopwatch, .. } = &mut self.state {
            *stopwatch = new_stopwatch(&self.clock);
        }
    }

    fn restart_from(&mut self, timestamp: u32) {
        self.delay_history.clear();
        self.num_reordered_packets = 0;
        self.state = TrackerState::Tracking {
            last_timestamp: timestamp,
            stopwatch: new_stopwatch(&self.clock),
        };
    }

    fn update_delay_history(&mut self, iat_delay_ms: i32, timestamp: u32, sample_rate_hz: i32) {
        self.delay_history.push_back(PacketDelay {
            iat_delay_ms,
            timestamp,
        });

        let max_history_ticks =
            u32::try_from(self.config.max_history_ms as i64 * sample_rate_hz as i64 / 1000)
                .unwrap_or(u32::MAX);
        while let Some(front) = self.delay_history.front() {
            if timestamp.wrapping_sub(front.timestamp) <= max_history_ticks {
                break;
            }
            self.delay_history.pop_front();
        }
    }

    /// Calculates the relative arrival delay of packets in the history.
    ///
    /// This is the accumulated delay of the newest packet relative to the
    /// packet preceding the window. Whenever the running sum drops below zero
    /// the reference packet is invalid and the sum restarts from zero, so
    /// early packets never mask congestion that follows them.
    pub fn calculate_relative_packet_arrival_delay(&self) -> i32 {
        self.delay_history.iter().fold(0i32, |relative_delay, delay| {
            relative_delay.saturating_add(delay.iat_delay_ms).max(0)
        })
    }

    pub fn num_reordered_packets(&self) -> u32 {
        self.num_reordered_packets
    }

    pub fn history_len(&self) -> usize {
        self.delay_history.len()
    }

    /// RTP timestamp of the current reference packet
    pub fn last_timestamp(&self) -> Option<u32> {
        match self.state {
            TrackerState::AwaitingFirstPacket => None,
            TrackerState::Tracking { last_timestamp, .. } => Some(last_timestamp),
        }
    }

    pub fn is_tracking(&self) -> bool {
        matches!(self.state, TrackerState::Tracking { .. })
    }
}
