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

/// Point-in-time view of a delay manager, for logs and offline analysis
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayManagerStats {
    /// Target delay after limits were applied
    pub target_delay_ms: i32,
    /// Latest optimizer recommendation, before limits
    pub optimal_delay_ms: Option<i32>,
    pub effective_minimum_delay_ms: i32,
    pub minimum_delay_ms: i32,
    /// 0 when unconstrained
    pub maximum_delay_ms: i32,
    pub base_minimum_delay_ms: i32,
    pub num_reordered_packets: u32,
    /// Entries in the relative delay window
    pub history_len: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_serialize_to_json() {
        let stats = DelayManagerStats {
            target_delay_ms: 60,
            optimal_delay_ms: Some(60),
            ..Default::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["target_delay_ms"], 60);
        assert_eq!(json["optimal_delay_ms"], 60);
        assert_eq!(json["maximum_delay_ms"], 0);
    }
}
