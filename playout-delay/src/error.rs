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

use thiserror::Error;

/// Result type for playout delay operations
pub type Result<T> = std::result::Result<T, DelayError>;

/// Errors raised while building or configuring a delay manager.
///
/// The per-packet path never fails: invalid runtime input is absorbed and
/// setters report rejection through their boolean return.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DelayError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid histogram config: {0}")]
    InvalidHistogramConfig(String),

    #[error("Invalid trace at line {line}: {reason}")]
    InvalidTrace { line: usize, reason: String },
}
