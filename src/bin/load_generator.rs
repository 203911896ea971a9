//! Synthetic reading generator
//!
//! Writes JSON-lines readings to stdout for local runs of `history-service`:
//!
//! ```bash
//! load-generator --entities 20 --readings 100000 --seed 7 | history-service
//! ```
//!
//! | Flag | Default | Description |
//! |------|---------|-------------|
//! | --entities | 10 | Distinct sensor ids |
//! | --readings | 10000 | Total readings |
//! | --seed | 42 | ChaCha seed; same seed, same output |
//! | --start-ms | now | Event time of the first reading |
//! | --step-ms | 100 | Mean event-time advance per reading |
//! | --late-percent | 1 | Readings sent this far behind, in percent |
//! | --late-ms | 120000 | How far behind late readings are |

use history_service::Reading;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::io::{BufWriter, Write};

#[derive(Debug)]
struct Args {
    entities: u32,
    readings: u64,
    seed: u64,
    start_ms: i64,
    step_ms: i64,
    late_percent: u32,
    late_ms: i64,
}

impl Default for Args {
    fn default() -> Self {
        Args {
            entities: 10,
            readings: 10_000,
            seed: 42,
            start_ms: chrono::Utc::now().timestamp_millis(),
            step_ms: 100,
            late_percent: 1,
            late_ms: 120_000,
        }
    }
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);
    while let Some(flag) = iter.next() {
        let value = iter
            .next()
            .ok_or_else(|| format!("missing value for {}", flag))?;
        let bad = |e: std::num::ParseIntError| format!("{} {}: {}", flag, value, e);
        match flag.as_str() {
            "--entities" => args.entities = value.parse().map_err(bad)?,
            "--readings" => args.readings = value.parse().map_err(bad)?,
            "--seed" => args.seed = value.parse().map_err(bad)?,
            "--start-ms" => args.start_ms = value.parse().map_err(bad)?,
            "--step-ms" => args.step_ms = value.parse().map_err(bad)?,
            "--late-percent" => args.late_percent = value.parse().map_err(bad)?,
            "--late-ms" => args.late_ms = value.parse().map_err(bad)?,
            other => return Err(format!("unknown flag {}", other)),
        }
    }
    if args.entities == 0 {
        return Err("--entities must be positive".to_string());
    }
    if args.late_percent > 100 {
        return Err("--late-percent must be at most 100".to_string());
    }
    Ok(args)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args()?;
    let mut rng = ChaCha8Rng::seed_from_u64(args.seed);
    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    // Per-entity baseline so averages differ between sensors
    let baselines: Vec<f64> = (0..args.entities).map(|_| rng.gen_range(10.0..30.0)).collect();

    let mut event_time = args.start_ms;
    for _ in 0..args.readings {
        event_time += rng.gen_range(0..=args.step_ms.max(0) * 2);
        let entity = rng.gen_range(0..args.entities);
        let timestamp_ms = if rng.gen_range(0..100) < args.late_percent {
            event_time - args.late_ms
        } else {
            event_time
        };
        let value = baselines[entity as usize] + rng.gen_range(-2.0..2.0);

        let reading = Reading::new(format!("sensor-{}", entity), timestamp_ms, value);
        serde_json::to_writer(&mut out, &reading)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}
