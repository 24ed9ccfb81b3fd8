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

//! Time sources for inter-arrival measurement.
//!
//! The delay manager never reads the wall clock directly. It is handed a
//! shared [`Clock`] and creates [`Stopwatch`]es from it, so tests (and
//! callers driven by a fixed-rate audio callback) can supply a
//! [`TickTimer`] that only moves when told to.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use web_time::Instant;

/// Default tick length, matching a 10 ms audio frame.
pub const DEFAULT_MS_PER_TICK: u64 = 10;

/// Monotonic millisecond time source.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Milliseconds since an arbitrary, fixed origin.
    fn now_ms(&self) -> u64;
}

/// Start a stopwatch on a shared clock.
pub fn new_stopwatch(clock: &Arc<dyn Clock>) -> Stopwatch {
    Stopwatch::new(Arc::clone(clock))
}

/// Clock backed by `web_time::Instant`.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Manually advanced tick counter.
///
/// Every call to [`TickTimer::increment`] moves time forward by
/// `ms_per_tick`. The counter is atomic, so a control thread may advance it
/// while the owning audio thread reads it.
#[derive(Debug)]
pub struct TickTimer {
    ticks: AtomicU64,
    ms_per_tick: u64,
}

impl TickTimer {
    pub fn new() -> Self {
        Self::with_ms_per_tick(DEFAULT_MS_PER_TICK)
    }

    pub fn with_ms_per_tick(ms_per_tick: u64) -> Self {
        debug_assert!(ms_per_tick > 0, "ms_per_tick must be positive");
        Self {
            ticks: AtomicU64::new(0),
            ms_per_tick: ms_per_tick.max(1),
        }
    }

    /// Advance by one tick.
    pub fn increment(&self) {
        self.increment_by(1);
    }

    /// Advance by `ticks` ticks.
    pub fn increment_by(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::Relaxed);
    }

    /// Advance by at least `ms` milliseconds, rounded up to whole ticks.
    pub fn advance_ms(&self, ms: u64) {
        self.increment_by(ms.div_ceil(self.ms_per_tick));
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn ms_per_tick(&self) -> u64 {
        self.ms_per_tick
    }
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TickTimer {
    fn now_ms(&self) -> u64 {
        self.ticks() * self.ms_per_tick
    }
}

/// Measures time elapsed since its creation on a shared clock.
#[derive(Clone)]
pub struct Stopwatch {
    clock: Arc<dyn Clock>,
    start_ms: u64,
}

impl Stopwatch {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let start_ms = clock.now_ms();
        Self { clock, start_ms }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.clock.now_ms().saturating_sub(self.start_ms)
    }

    /// Elapsed time saturated into the `i32` range used by delay arithmetic.
    pub fn elapsed_ms_i32(&self) -> i32 {
        i32::try_from(self.elapsed_ms()).unwrap_or(i32::MAX)
    }
}

impl fmt::Debug for Stopwatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stopwatch")
            .field("start_ms", &self.start_ms)
            .field("elapsed_ms", &self.elapsed_ms())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_timer_advances_in_whole_ticks() {
        let timer = TickTimer::new();
        assert_eq!(timer.now_ms(), 0);

        timer.increment();
        assert_eq!(timer.now_ms(), 10);

        // 15 ms rounds up to two ticks
        timer.advance_ms(15);
        assert_eq!(timer.ticks(), 3);
        assert_eq!(timer.now_ms(), 30);
    }

    #[test]
    fn test_stopwatch_measures_from_creation() {
        let timer = Arc::new(TickTimer::with_ms_per_tick(1));
        timer.advance_ms(100);

        let clock: Arc<dyn Clock> = timer.clone();
        let stopwatch = new_stopwatch(&clock);
        assert_eq!(stopwatch.elapsed_ms(), 0);

        timer.advance_ms(42);
        assert_eq!(stopwatch.elapsed_ms(), 42);
        assert_eq!(stopwatch.elapsed_ms_i32(), 42);
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let first = clock.now_ms();
        let second = clock.now_ms();
        assert!(second >= first);
    }
}
