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

use std::io::{BufWriter, Write};

use clap::Parser;
use playout_delay::trace::{parse_trace, TraceReplayer};
use playout_delay::{DelayConfig, HistogramConfig};

#[derive(Parser, Debug)]
#[clap(about = "Replay a packet arrival trace through the playout delay manager", version)]
struct Args {
    #[clap(
        value_parser,
        help = "Trace file with lines 'arrival_ms,timestamp,sample_rate_hz[,reset]'"
    )]
    trace_path: String,

    #[clap(long, default_value_t = 0, help = "Minimum delay in milliseconds")]
    min_delay_ms: i32,

    #[clap(
        long,
        default_value_t = 0,
        help = "Maximum delay in milliseconds (0 = unconstrained)"
    )]
    max_delay_ms: i32,

    #[clap(long, default_value_t = 0, help = "Base minimum delay in milliseconds")]
    base_min_delay_ms: i32,

    #[clap(
        long,
        help = "Histogram override, e.g. 'Enabled-97-0.9993-2' (percentile, forget factor, start weight)"
    )]
    histogram_config: Option<String>,

    #[clap(
        long,
        help = "Register the maximum relative delay per interval instead of every packet"
    )]
    resample_interval_ms: Option<i32>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();

    let mut config = DelayConfig {
        resample_interval_ms: args.resample_interval_ms,
        base_minimum_delay_ms: args.base_min_delay_ms,
        ..Default::default()
    };
    if let Some(histogram_config) = &args.histogram_config {
        config.histogram = HistogramConfig::parse(histogram_config)?;
    }

    log::info!("Loading trace: {}", args.trace_path);
    let text = std::fs::read_to_string(&args.trace_path)?;
    let entries = parse_trace(&text)?;
    log::info!("Replaying {} packets", entries.len());

    let mut replayer = TraceReplayer::new(config)?;
    // Maximum first, so a minimum above the default ceiling is accepted.
    if !replayer.manager_mut().set_maximum_delay(args.max_delay_ms) {
        return Err(format!("invalid maximum delay {}ms", args.max_delay_ms).into());
    }
    if !replayer.manager_mut().set_minimum_delay(args.min_delay_ms) {
        return Err(format!("invalid minimum delay {}ms", args.min_delay_ms).into());
    }

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for entry in &entries {
        let record = replayer.step(entry);
        serde_json::to_writer(&mut out, &record)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;

    let final_stats = replayer.manager().stats();
    log::info!(
        "Final target delay {}ms (effective minimum {}ms)",
        final_stats.target_delay_ms,
        final_stats.effective_minimum_delay_ms
    );

    Ok(())
}
