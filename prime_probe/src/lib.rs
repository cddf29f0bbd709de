#![deny(unsafe_op_in_unsafe_fn)]

//! Prime+Probe over one L1D set: fill the set with an attacker ring, let a
//! victim touch its own line in the same set, and read the occupancy back
//! out of the probe walk's latency. Nothing is flushed; eviction is the
//! channel.

use core::ptr;

use log::debug;
use num_rational::Rational64;
use serde::Serialize;

use cache_timing::layout::{CacheGeometry, CacheSetPartition};
use timing_oracle::CacheTimer;

pub const DEFAULT_TARGET_SET: usize = 5;
pub const DEFAULT_POOL_PAGES: usize = 2048;
pub const DEFAULT_CONTENTION_TRIALS: u32 = 1000;
pub const DEFAULT_VICTIM_ROUNDS: u32 = 100;

/// Knobs for one contention run.
#[derive(Debug, Clone, Serialize)]
pub struct ContentionConfig {
    pub geometry: CacheGeometry,
    pub target_set: usize,
    pub pool_pages: usize,
    pub trials: u32,
    pub victim_rounds: u32,
}

impl Default for ContentionConfig {
    fn default() -> Self {
        ContentionConfig {
            geometry: CacheGeometry::default(),
            target_set: DEFAULT_TARGET_SET,
            pool_pages: DEFAULT_POOL_PAGES,
            trials: DEFAULT_CONTENTION_TRIALS,
            victim_rounds: DEFAULT_VICTIM_ROUNDS,
        }
    }
}

/// Accumulated whole-ring probe latencies for both scenarios.
#[derive(Debug, Clone, Serialize)]
pub struct ContentionSummary {
    pub trials: u32,
    /// Scenario A: prime, then probe.
    pub primed_total: u64,
    /// Scenario B: prime, victim touches, then probe.
    pub contended_total: u64,
}

impl ContentionSummary {
    pub fn average_primed(&self) -> Rational64 {
        Rational64::new(self.primed_total as i64, self.trials as i64)
    }

    pub fn average_contended(&self) -> Rational64 {
        Rational64::new(self.contended_total as i64, self.trials as i64)
    }

    /// The contention signal: average B minus average A.
    pub fn delta(&self) -> Rational64 {
        self.average_contended() - self.average_primed()
    }

    pub fn contention_detected(&self, margin: u64) -> bool {
        self.delta() >= Rational64::from_integer(margin as i64)
    }
}

/// Run the two-scenario measurement, `trials` iterations of each:
/// A = prime, probe and B = prime, victim, probe, with full serialization
/// between phases. The probe walks the whole attacker ring and is timed as
/// one latency, so victim occupancy shows up as extra misses in the walk.
pub fn measure_contention<T: CacheTimer>(
    timer: &mut T,
    partition: &CacheSetPartition,
    config: &ContentionConfig,
    mut victim: impl FnMut(),
) -> ContentionSummary {
    assert!(config.trials > 0);
    let entry = partition.attacker.entry();
    let hops = partition.attacker.len();
    let mut primed_total = 0u64;
    let mut contended_total = 0u64;
    for _ in 0..config.trials {
        // Ring links stay valid for the life of the partition borrow.
        unsafe {
            timer.chase(entry, hops);
            timer.serialize();
            primed_total += timer.timed_chase(entry, hops);

            timer.chase(entry, hops);
            timer.serialize();
        }
        victim();
        timer.serialize();
        contended_total += unsafe { timer.timed_chase(entry, hops) };
    }
    debug!(
        "{} trials over set {}: primed total {}, contended total {}",
        config.trials,
        partition.target_set(),
        primed_total,
        contended_total
    );
    ContentionSummary {
        trials: config.trials,
        primed_total,
        contended_total,
    }
}

/// The victim's whole footprint: a read-modify-write of one payload byte
/// plus a dependent reload, `rounds` times. Every round lands in the same
/// line; occupying it once is already what evicts the attacker.
///
/// # Safety
///
/// `payload` must be valid for reads and writes for the duration of the
/// call.
pub unsafe fn victim_rmw(payload: *mut u8, rounds: u32) {
    for round in 0..rounds {
        let value = unsafe { ptr::read_volatile(payload) };
        unsafe { ptr::write_volatile(payload, value ^ round as u8) };
        unsafe { ptr::read_volatile(payload) };
    }
}
