#![deny(unsafe_op_in_unsafe_fn)]

use static_assertions::const_assert;
use std::io;
use thiserror::Error;

pub mod layout;
pub mod mmap;

#[cfg(target_arch = "x86_64")]
pub mod calibration;

#[cfg(target_arch = "x86_64")]
use core::arch::x86_64 as arch_x86;
use core::ptr;

pub const CACHE_LINE_LEN: usize = 64;
pub const PAGE_LEN: usize = 1 << 12;
pub const PAGE_CACHELINE_LEN: usize = PAGE_LEN / CACHE_LINE_LEN;

const_assert!(CACHE_LINE_LEN.is_power_of_two());
const_assert!(PAGE_LEN % CACHE_LINE_LEN == 0);

/// Fatal errors while preparing the measurement memory.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to map scratch region: {0}")]
    Mmap(#[from] io::Error),
    #[error("probe stride {stride:#x} must be a power of two of at least one cache line")]
    BadStride { stride: usize },
    #[error("cache geometry {sets} sets x {ways} ways is not usable")]
    BadGeometry { sets: usize, ways: usize },
    #[error("target set {target_set} out of range for {sets} sets")]
    TargetSetOutOfRange { target_set: usize, sets: usize },
    #[error("scratch pool exhausted for cache set {target_set}: found {found} lines, needed {needed}")]
    PoolExhausted {
        target_set: usize,
        needed: usize,
        found: usize,
    },
}

// rdtsc no fence
#[cfg(target_arch = "x86_64")]
pub unsafe fn rdtsc_nofence() -> u64 {
    unsafe { arch_x86::_rdtsc() }
}

// rdtsc (has mfence before and after)
#[cfg(target_arch = "x86_64")]
pub unsafe fn rdtsc_fence() -> u64 {
    unsafe {
        arch_x86::_mm_mfence();
        let tsc: u64 = arch_x86::_rdtsc();
        arch_x86::_mm_mfence();
        tsc
    }
}

/// # Safety
///
/// p must be a valid pointer to read.
pub unsafe fn maccess<T>(p: *const T) {
    unsafe { ptr::read_volatile(p) };
}

/// # Safety
///
/// p must be a valid pointer to write.
pub unsafe fn mwrite(p: *mut u8, value: u8) {
    unsafe { ptr::write_volatile(p, value) };
}

// flush (clflush)
#[cfg(target_arch = "x86_64")]
pub unsafe fn flush(p: *const u8) {
    unsafe { arch_x86::_mm_clflush(p) };
}

// mfence + lfence, the barrier between prime / victim / probe phases.
#[cfg(target_arch = "x86_64")]
pub fn serialize() {
    unsafe {
        arch_x86::_mm_mfence();
        arch_x86::_mm_lfence();
    }
}

// Plain spin, used to let an eviction settle before invoking a victim.
pub fn busy_wait(iterations: usize) {
    for i in 0..iterations {
        core::hint::black_box(i);
    }
}

/// Walk `hops` links of a pointer chase starting at `entry` and return the
/// final pointer. Every hop is a volatile load of the link stored at the
/// head of the current line, so the loads are data dependent and cannot be
/// issued ahead of each other.
///
/// # Safety
///
/// `entry` and every link reachable from it within `hops` steps must point
/// to readable memory holding a valid link in its first pointer-sized bytes.
pub unsafe fn chase(entry: *const u8, hops: usize) -> *const u8 {
    let mut p = entry;
    for _ in 0..hops {
        p = unsafe { ptr::read_volatile(p as *const *const u8) } as *const u8;
    }
    p
}

/// Pin the current thread to one core and return the previous affinity mask.
#[cfg(target_os = "linux")]
pub fn pin_to_core(core: usize) -> Result<nix::sched::CpuSet, nix::Error> {
    use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let old = sched_getaffinity(Pid::from_raw(0))?;
    let mut set = CpuSet::new();
    set.set(core)?;
    sched_setaffinity(Pid::from_raw(0), &set)?;
    Ok(old)
}

#[cfg(target_os = "linux")]
pub fn restore_affinity(mask: &nix::sched::CpuSet) -> Result<(), nix::Error> {
    use nix::sched::sched_setaffinity;
    use nix::unistd::Pid;

    sched_setaffinity(Pid::from_raw(0), mask)
}
