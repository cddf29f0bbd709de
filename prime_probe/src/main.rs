use anyhow::Context;
use clap::Parser;

use cache_timing::layout::{build_set_partition, cache_set_index, CacheGeometry};
use cache_timing::pin_to_core;
use prime_probe::{
    measure_contention, victim_rmw, ContentionConfig, ContentionSummary,
    DEFAULT_CONTENTION_TRIALS, DEFAULT_POOL_PAGES, DEFAULT_TARGET_SET, DEFAULT_VICTIM_ROUNDS,
};
use serde::Serialize;
use timing_oracle::hardware::HardwareTimer;

#[derive(Parser)]
#[command(about = "Detect a victim's cache-set occupancy by priming and probing one L1D set")]
struct Args {
    /// Number of cache sets (power of two).
    #[arg(long, default_value_t = 64)]
    sets: usize,

    /// Associativity of the monitored set.
    #[arg(long, default_value_t = 8)]
    ways: usize,

    /// The set to prime and probe.
    #[arg(long, default_value_t = DEFAULT_TARGET_SET)]
    target_set: usize,

    /// Pages of pool to scan for same-set lines.
    #[arg(long, default_value_t = DEFAULT_POOL_PAGES)]
    pages: usize,

    /// Measurement trials per scenario.
    #[arg(long, default_value_t = DEFAULT_CONTENTION_TRIALS)]
    trials: u32,

    /// Victim read-modify-write rounds per trial.
    #[arg(long, default_value_t = DEFAULT_VICTIM_ROUNDS)]
    victim_rounds: u32,

    /// Cycles the delta must reach for a positive verdict.
    #[arg(long, default_value_t = 50)]
    margin: u64,

    /// Pin the measurement to this core.
    #[arg(long)]
    core: Option<usize>,

    /// Emit a JSON report instead of only the text summary.
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Report {
    config: ContentionConfig,
    summary: ContentionSummary,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if let Some(core) = args.core {
        pin_to_core(core).with_context(|| format!("pinning to core {core}"))?;
    }

    let config = ContentionConfig {
        geometry: CacheGeometry {
            sets: args.sets,
            ways: args.ways,
        },
        target_set: args.target_set,
        pool_pages: args.pages,
        trials: args.trials,
        victim_rounds: args.victim_rounds,
    };
    let partition = build_set_partition(&config.geometry, config.target_set, config.pool_pages)
        .context("partitioning the cache set")?;

    println!("Mapping verification for set {}:", partition.target_set());
    for (i, &line) in partition.attacker.lines().iter().enumerate() {
        println!(
            "  attacker[{i}]: {line:p} -> set {}",
            cache_set_index(line as usize, config.geometry.sets)
        );
    }
    for (i, &line) in partition.victim.lines().iter().enumerate() {
        println!(
            "  victim[{i}]:   {line:p} -> set {}",
            cache_set_index(line as usize, config.geometry.sets)
        );
    }

    let mut timer = HardwareTimer::new();
    let payload = partition.victim.payload(0);
    let rounds = config.victim_rounds;
    let summary = measure_contention(&mut timer, &partition, &config, || {
        // The payload line belongs to the partition's pool mapping.
        unsafe { victim_rmw(payload, rounds) };
    });

    println!("Trials:                   {}", summary.trials);
    println!(
        "Avg probe, primed (A):    {} cycles",
        summary.average_primed().to_integer()
    );
    println!(
        "Avg probe, contended (B): {} cycles",
        summary.average_contended().to_integer()
    );
    println!(
        "Delta (B - A):            {} cycles",
        summary.delta().to_integer()
    );
    if summary.contention_detected(args.margin) {
        println!("Contention detected (delta >= {} cycles).", args.margin);
    } else {
        println!("No contention detected (margin {} cycles).", args.margin);
    }

    if args.json {
        let report = Report { config, summary };
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}
