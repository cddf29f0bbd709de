use itertools::Itertools;
use log::debug;
use serde::Serialize;

use crate::mmap::MMappedMemory;
use crate::{chase, flush, maccess, rdtsc_fence, SetupError, PAGE_LEN};

pub const DEFAULT_CALIBRATION_ROUNDS: usize = 1024;

/// # Safety
///
/// p must be a valid pointer to read.
pub unsafe fn only_reload(p: *const u8) -> u64 {
    unsafe {
        let t = rdtsc_fence();
        maccess(p);
        rdtsc_fence() - t
    }
}

/// # Safety
///
/// p must be a valid pointer to read.
pub unsafe fn flush_and_reload(p: *const u8) -> u64 {
    unsafe {
        flush(p);
        only_reload(p)
    }
}

/// Timed walk of `hops` links starting at `entry`.
///
/// # Safety
///
/// Same contract as [`chase`].
pub unsafe fn only_chase(entry: *const u8, hops: usize) -> u64 {
    unsafe {
        let t = rdtsc_fence();
        chase(entry, hops);
        rdtsc_fence() - t
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CalibrationResult {
    pub hit_median: u64,
    pub miss_median: u64,
    pub suggested_threshold: u64,
}

/// Sample warm-reload and flush-reload latencies on a private scratch line
/// and derive a classification threshold, weighted toward the hit side so
/// occasional slow hits do not flip to misses.
pub fn calibrate_latency(rounds: usize) -> Result<CalibrationResult, SetupError> {
    assert!(rounds > 0);
    let memory = MMappedMemory::<u8>::try_new(PAGE_LEN, false)?;
    let target = &memory.slice()[0] as *const u8;

    let mut hits = Vec::with_capacity(rounds);
    let mut misses = Vec::with_capacity(rounds);
    unsafe {
        maccess(target);
        for _ in 0..rounds {
            hits.push(only_reload(target));
        }
        for _ in 0..rounds {
            misses.push(flush_and_reload(target));
        }
    }

    let hit_median = median(&mut hits);
    let miss_median = median(&mut misses);
    if let Some((min, max)) = hits.iter().chain(misses.iter()).minmax().into_option() {
        debug!(
            "calibration: hit median {} / miss median {} (samples span {}..{})",
            hit_median, miss_median, min, max
        );
    }
    Ok(CalibrationResult {
        hit_median,
        miss_median,
        suggested_threshold: (9 * hit_median + miss_median) / 10,
    })
}

fn median(samples: &mut [u64]) -> u64 {
    samples.sort_unstable();
    samples[samples.len() / 2]
}
