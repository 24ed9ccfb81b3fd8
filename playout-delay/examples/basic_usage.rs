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

use playout_delay::{DelayConfig, DelayManager, TickTimer};
use rand::Rng;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("Playout Delay Example");
    println!("=====================");

    let timer = Arc::new(TickTimer::with_ms_per_tick(1));
    let mut manager = DelayManager::new(DelayConfig::default(), timer.clone())?;
    manager.set_minimum_delay(20);
    manager.set_maximum_delay(400);

    println!("Initial target delay: {}ms", manager.target_delay_ms());

    let sample_rate = 16000;
    let samples_per_packet = 320; // 20ms at 16kHz
    let packet_duration_ms = 20u64;
    let mut rng = rand::rng();

    // Packets are sent every 20 ms and each one picks up 0-60 ms of network
    // delay, with an occasional 150 ms spike.
    let mut timestamp = 0u32;
    let mut now_ms = 0u64;
    let mut last_arrival_ms = 0u64;
    for i in 0..300u64 {
        let send_ms = i * packet_duration_ms;
        let network_delay_ms = if rng.random_range(0..50) == 0 {
            150
        } else {
            rng.random_range(0..60)
        };
        // Packets never overtake each other in this simulation.
        let arrival_ms = (send_ms + network_delay_ms).max(last_arrival_ms);
        last_arrival_ms = arrival_ms;

        timer.advance_ms(arrival_ms - now_ms);
        now_ms = arrival_ms;

        let relative_delay = manager.update(timestamp, sample_rate, false);
        timestamp = timestamp.wrapping_add(samples_per_packet);

        if i % 25 == 0 {
            println!(
                "packet {:3}: arrival={:5}ms relative_delay={:>4} target={}ms",
                i,
                arrival_ms,
                relative_delay.map_or("-".to_string(), |d| d.to_string()),
                manager.target_delay_ms()
            );
        }
    }

    let stats = manager.stats();
    println!("\nFinal stats: {}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}
