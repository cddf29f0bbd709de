#![deny(unsafe_op_in_unsafe_fn)]

//! Latency classification and the timing seam between attack logic and the
//! machine: one trait covering timestamped loads, pointer-chase timing,
//! eviction and serialization, with a hardware backend and a deterministic
//! simulated one.

use std::fmt::Debug;

use serde::Serialize;

#[cfg(target_arch = "x86_64")]
pub mod hardware;
pub mod simulate;

pub const DEFAULT_HIT_THRESHOLD: u64 = 80;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize)]
pub enum CacheStatus {
    Hit,
    Miss,
}

/// Classification boundary: a latency at or below `cycles` is a hit.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize)]
pub struct Threshold {
    pub cycles: u64,
}

impl Threshold {
    pub const fn new(cycles: u64) -> Threshold {
        Threshold { cycles }
    }

    pub fn is_hit(&self, time: u64) -> bool {
        time <= self.cycles
    }

    pub fn classify(&self, time: u64) -> CacheStatus {
        if self.is_hit(time) {
            CacheStatus::Hit
        } else {
            CacheStatus::Miss
        }
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Threshold::new(DEFAULT_HIT_THRESHOLD)
    }
}

/// Timing source and cache control, as one capability.
///
/// Attack code is generic over this trait; swapping the hardware backend
/// for [`simulate::SimulatedCache`] runs the identical pipeline without
/// timing noise.
pub trait CacheTimer: Debug {
    /// Latency, in cycles, of one dependent load from `addr`.
    ///
    /// # Safety
    ///
    /// addr must be a valid pointer to read.
    unsafe fn timed_access(&mut self, addr: *const u8) -> u64;

    /// Latency, in cycles, of walking `hops` links starting at `entry`.
    ///
    /// # Safety
    ///
    /// `entry` must head a chase whose links stay readable for `hops` steps.
    unsafe fn timed_chase(&mut self, entry: *const u8, hops: usize) -> u64;

    /// Untimed walk, used to establish residency before a measurement.
    ///
    /// # Safety
    ///
    /// Same contract as [`CacheTimer::timed_chase`].
    unsafe fn chase(&mut self, entry: *const u8, hops: usize);

    /// Remove the line holding `addr` from the whole hierarchy.
    ///
    /// # Safety
    ///
    /// addr must point into mapped memory.
    unsafe fn evict(&mut self, addr: *const u8);

    /// Order all memory operations across a phase boundary.
    fn serialize(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_inclusive() {
        let threshold = Threshold::new(80);
        assert_eq!(threshold.classify(79), CacheStatus::Hit);
        assert_eq!(threshold.classify(80), CacheStatus::Hit);
        assert_eq!(threshold.classify(81), CacheStatus::Miss);
    }

    #[test]
    fn default_matches_the_classic_constant() {
        assert!(Threshold::default().is_hit(DEFAULT_HIT_THRESHOLD));
        assert!(!Threshold::default().is_hit(DEFAULT_HIT_THRESHOLD + 1));
    }
}
