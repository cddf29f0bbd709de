use cache_timing::calibration::{only_chase, only_reload};
use cache_timing::{flush, serialize};

use crate::CacheTimer;

/// The real machine: timestamp-counter timing, `clflush` eviction.
#[derive(Debug, Default)]
pub struct HardwareTimer;

impl HardwareTimer {
    pub fn new() -> HardwareTimer {
        HardwareTimer
    }
}

impl CacheTimer for HardwareTimer {
    unsafe fn timed_access(&mut self, addr: *const u8) -> u64 {
        unsafe { only_reload(addr) }
    }

    unsafe fn timed_chase(&mut self, entry: *const u8, hops: usize) -> u64 {
        unsafe { only_chase(entry, hops) }
    }

    unsafe fn chase(&mut self, entry: *const u8, hops: usize) {
        unsafe { cache_timing::chase(entry, hops) };
    }

    unsafe fn evict(&mut self, addr: *const u8) {
        unsafe { flush(addr) }
    }

    fn serialize(&mut self) {
        serialize()
    }
}
