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

//! Offline replay of packet arrival traces.
//!
//! A trace is plain text, one packet per line:
//!
//! ```text
//! # arrival_ms,timestamp,sample_rate_hz[,reset]
//! 0,1000,8000
//! 20,1160,8000
//! 45,1320,8000,1
//! ```
//!
//! Blank lines and lines starting with `#` are skipped. Arrival times must
//! not go backwards.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::stats::DelayManagerStats;
use crate::tick_timer::TickTimer;
use crate::{DelayConfig, DelayError, DelayManager, Result};

/// One packet arrival
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Wall-clock arrival time in milliseconds
    pub arrival_ms: u64,
    /// RTP timestamp
    pub timestamp: u32,
    pub sample_rate_hz: i32,
    /// Restart delay estimation at this packet
    pub reset: bool,
}

/// Manager state after one replayed packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayRecord {
    pub arrival_ms: u64,
    pub timestamp: u32,
    pub relative_delay_ms: Option<i32>,
    #[serde(flatten)]
    pub stats: DelayManagerStats,
}

pub fn parse_trace(text: &str) -> Result<Vec<TraceEntry>> {
    let mut entries: Vec<TraceEntry> = Vec::new();

    for (index, raw_line) in text.lines().enumerate() {
        let line_number = index + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let entry = parse_line(line).map_err(|reason| DelayError::InvalidTrace {
            line: line_number,
            reason,
        })?;

        if let Some(previous) = entries.last() {
            if entry.arrival_ms < previous.arrival_ms {
                return Err(DelayError::InvalidTrace {
                    line: line_number,
                    reason: format!(
                        "arrival time {} is before previous arrival {}",
                        entry.arrival_ms, previous.arrival_ms
                    ),
                });
            }
        }
        entries.push(entry);
    }

    Ok(entries)
}

fn parse_line(line: &str) -> std::result::Result<TraceEntry, String> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if !(3..=4).contains(&fields.len()) {
        return Err(format!("expected 3 or 4 fields, got {}", fields.len()));
    }

    let arrival_ms = fields[0]
        .parse::<u64>()
        .map_err(|e| format!("bad arrival time '{}': {e}", fields[0]))?;
    let timestamp = fields[1]
        .parse::<u32>()
        .map_err(|e| format!("bad timestamp '{}': {e}", fields[1]))?;
    let sample_rate_hz = fields[2]
        .parse::<i32>()
        .map_err(|e| format!("bad sample rate '{}': {e}", fields[2]))?;
    let reset = match fields.get(3) {
        None => false,
        Some(&"0") | Some(&"false") => false,
        Some(&"1") | Some(&"true") => true,
        Some(other) => return Err(format!("bad reset flag '{other}'")),
    };

    Ok(TraceEntry {
        arrival_ms,
        timestamp,
        sample_rate_hz,
        reset,
    })
}

/// Drives a delay manager from recorded arrival times.
#[derive(Debug)]
pub struct TraceReplayer {
    timer: Arc<TickTimer>,
    manager: DelayManager,
    now_ms: u64,
}

impl TraceReplayer {
    pub fn new(config: DelayConfig) -> Result<Self> {
        // One millisecond per tick reproduces arrival times exactly.
        let timer = Arc::new(TickTimer::with_ms_per_tick(1));
        let manager = DelayManager::new(config, timer.clone())?;
        Ok(Self {
            timer,
            manager,
            now_ms: 0,
        })
    }

    pub fn manager(&self) -> &DelayManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut DelayManager {
        &mut self.manager
    }

    pub fn step(&mut self, entry: &TraceEntry) -> ReplayRecord {
        if entry.arrival_ms > self.now_ms {
            self.timer.advance_ms(entry.arrival_ms - self.now_ms);
            self.now_ms = entry.arrival_ms;
        }

        let relative_delay_ms =
            self.manager
                .update(entry.timestamp, entry.sample_rate_hz, entry.reset);

        ReplayRecord {
            arrival_ms: entry.arrival_ms,
            timestamp: entry.timestamp,
            relative_delay_ms,
            stats: self.manager.stats(),
        }
    }

    pub fn replay(&mut self, entries: &[TraceEntry]) -> Vec<ReplayRecord> {
        entries.iter().map(|entry| self.step(entry)).collect()
    }
}
