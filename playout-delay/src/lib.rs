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

//! # Playout delay
//!
//! Adaptive target delay estimation for audio jitter buffers.
//!
//! For every received packet the [`DelayManager`] measures how late the
//! packet arrived relative to its RTP timestamp, folds that into a decaying
//! histogram and derives the buffer delay needed to keep underruns rare.
//! Operator limits (minimum, maximum and base minimum delay) are applied on
//! top of the adaptive estimate.
//!
//! ```rust
//! use std::sync::Arc;
//! use playout_delay::{DelayConfig, DelayManager, TickTimer};
//!
//! let timer = Arc::new(TickTimer::new());
//! let mut manager = DelayManager::new(DelayConfig::default(), timer.clone()).unwrap();
//!
//! // 20 ms packets at 16 kHz, arriving on time.
//! let mut timestamp = 0u32;
//! for _ in 0..50 {
//!     manager.update(timestamp, 16000, false);
//!     timestamp += 320;
//!     timer.advance_ms(20);
//! }
//! assert_eq!(manager.target_delay_ms(), 20);
//! ```

pub mod config;
pub mod delay_manager;
pub mod delay_optimizer;
pub mod error;
pub mod histogram;
pub mod relative_delay;
pub mod stats;
pub mod tick_timer;
pub mod trace;

pub use config::{DelayConfig, HistogramConfig};
pub use delay_manager::DelayManager;
pub use delay_optimizer::{create_underrun_optimizer, DelayOptimizer, UnderrunOptimizer};
pub use error::{DelayError, Result};
pub use histogram::Histogram;
pub use relative_delay::{is_newer_timestamp, RelativeArrivalDelayTracker, TrackerConfig};
pub use stats::DelayManagerStats;
pub use tick_timer::{Clock, Stopwatch, SystemClock, TickTimer};
