use core::mem::size_of;

use itertools::Itertools;
use log::debug;
use rand::seq::SliceRandom;
use serde::Serialize;

use crate::mmap::MMappedMemory;
use crate::{SetupError, CACHE_LINE_LEN, PAGE_CACHELINE_LEN, PAGE_LEN};

/// One probe unit per byte value.
pub const PROBE_CANDIDATES: usize = 256;
pub const DEFAULT_PROBE_STRIDE: usize = 512;

const CACHE_LINE_SHIFT: usize = CACHE_LINE_LEN.trailing_zeros() as usize;

/// Set index of an address under a power-of-two indexed cache.
pub fn cache_set_index(addr: usize, sets: usize) -> usize {
    (addr >> CACHE_LINE_SHIFT) & (sets - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheGeometry {
    pub sets: usize,
    pub ways: usize,
}

impl Default for CacheGeometry {
    // Typical L1D.
    fn default() -> Self {
        CacheGeometry { sets: 64, ways: 8 }
    }
}

impl CacheGeometry {
    fn check(&self) -> Result<(), SetupError> {
        if self.sets == 0 || !self.sets.is_power_of_two() || self.ways == 0 {
            return Err(SetupError::BadGeometry {
                sets: self.sets,
                ways: self.ways,
            });
        }
        Ok(())
    }
}

/// 256 monitored units spaced `stride` bytes apart in one owned mapping,
/// all pages written at construction so none of them shares the zero page.
#[derive(Debug)]
pub struct ProbeArray {
    memory: MMappedMemory<u8>,
    stride: usize,
}

impl ProbeArray {
    pub fn new(stride: usize) -> Result<ProbeArray, SetupError> {
        if stride < CACHE_LINE_LEN || !stride.is_power_of_two() {
            return Err(SetupError::BadStride { stride });
        }
        let mut memory = MMappedMemory::try_new(PROBE_CANDIDATES * stride, false)?;
        for b in memory.slice_mut() {
            *b = 1;
        }
        Ok(ProbeArray { memory, stride })
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn base(&self) -> *const u8 {
        self.memory.ptr()
    }

    /// Address of the unit standing for `candidate`.
    pub fn unit(&self, candidate: usize) -> *const u8 {
        &self.memory.slice()[candidate * self.stride] as *const u8
    }

    pub fn units(&self) -> impl Iterator<Item = *const u8> + '_ {
        (0..PROBE_CANDIDATES).map(move |i| self.unit(i))
    }
}

/// A group of same-set cache lines linked into a circular pointer chase.
///
/// The traversal order is shuffled at construction and each member stores
/// the address of its successor in its first pointer-sized bytes, so a walk
/// of `len()` hops from `entry()` touches every member exactly once through
/// loads a stride prefetcher cannot anticipate.
#[derive(Debug)]
pub struct ChaseRing {
    lines: Vec<*mut u8>,
    entry: *const u8,
}

impl ChaseRing {
    fn build(lines: Vec<*mut u8>) -> ChaseRing {
        let mut order: Vec<usize> = (0..lines.len()).collect();
        order.shuffle(&mut rand::rng());
        for i in 0..order.len() {
            let from = lines[order[i]];
            let to = lines[order[(i + 1) % order.len()]];
            // Lines are distinct and live inside the partition's mapping.
            unsafe { *(from as *mut *mut u8) = to };
        }
        ChaseRing {
            entry: lines[order[0]] as *const u8,
            lines,
        }
    }

    pub fn entry(&self) -> *const u8 {
        self.entry
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Member line addresses in pool scan order.
    pub fn lines(&self) -> &[*mut u8] {
        &self.lines
    }

    /// First byte of a member line not occupied by its link.
    pub fn payload(&self, member: usize) -> *mut u8 {
        self.lines[member].wrapping_add(size_of::<*mut u8>())
    }
}

/// Attacker and victim line groups for one cache set, plus the pool that
/// backs them. Dropping the partition unmaps the pool, so the rings must
/// not outlive it.
#[derive(Debug)]
pub struct CacheSetPartition {
    #[allow(dead_code)]
    memory: MMappedMemory<u8>,
    pub attacker: ChaseRing,
    pub victim: ChaseRing,
    target_set: usize,
}

impl CacheSetPartition {
    pub fn target_set(&self) -> usize {
        self.target_set
    }
}

/// Scan an anonymous pool of `pool_pages` pages for lines mapping to
/// `target_set` and link the first `ways` of them into the attacker ring,
/// the next `ways` into the victim ring. Running out of pool before both
/// rings are full is fatal.
pub fn build_set_partition(
    geometry: &CacheGeometry,
    target_set: usize,
    pool_pages: usize,
) -> Result<CacheSetPartition, SetupError> {
    geometry.check()?;
    if target_set >= geometry.sets {
        return Err(SetupError::TargetSetOutOfRange {
            target_set,
            sets: geometry.sets,
        });
    }
    let needed = 2 * geometry.ways;
    if pool_pages == 0 {
        return Err(SetupError::PoolExhausted {
            target_set,
            needed,
            found: 0,
        });
    }

    let mut memory = MMappedMemory::try_new(pool_pages * PAGE_LEN, false)?;
    memory.slice_mut().fill(1);
    let base = memory.ptr() as usize;

    let mut attacker: Vec<*mut u8> = Vec::with_capacity(geometry.ways);
    let mut victim: Vec<*mut u8> = Vec::with_capacity(geometry.ways);
    for (page, line) in (0..pool_pages).cartesian_product(0..PAGE_CACHELINE_LEN) {
        let addr = base + page * PAGE_LEN + line * CACHE_LINE_LEN;
        if cache_set_index(addr, geometry.sets) != target_set {
            continue;
        }
        if attacker.len() < geometry.ways {
            attacker.push(addr as *mut u8);
        } else if victim.len() < geometry.ways {
            victim.push(addr as *mut u8);
        } else {
            break;
        }
    }
    if victim.len() < geometry.ways {
        return Err(SetupError::PoolExhausted {
            target_set,
            needed,
            found: attacker.len() + victim.len(),
        });
    }

    debug!(
        "cache set {}: {} attacker + {} victim lines out of {} pages",
        target_set,
        attacker.len(),
        victim.len(),
        pool_pages
    );
    Ok(CacheSetPartition {
        memory,
        attacker: ChaseRing::build(attacker),
        victim: ChaseRing::build(victim),
        target_set,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn probe_array_units_are_distinct_lines() {
        let probe = ProbeArray::new(DEFAULT_PROBE_STRIDE).unwrap();
        let lines: HashSet<usize> = probe.units().map(|p| p as usize >> 6).collect();
        assert_eq!(lines.len(), PROBE_CANDIDATES);
        for i in 0..PROBE_CANDIDATES {
            assert_eq!(
                probe.unit(i) as usize,
                probe.base() as usize + i * DEFAULT_PROBE_STRIDE
            );
        }
    }

    #[test]
    fn probe_array_rejects_bad_strides() {
        assert!(matches!(
            ProbeArray::new(100),
            Err(SetupError::BadStride { stride: 100 })
        ));
        assert!(matches!(
            ProbeArray::new(32),
            Err(SetupError::BadStride { stride: 32 })
        ));
    }

    #[test]
    fn partition_fills_disjoint_same_set_groups() {
        let geometry = CacheGeometry::default();
        let partition = build_set_partition(&geometry, 5, 64).unwrap();
        assert_eq!(partition.attacker.len(), geometry.ways);
        assert_eq!(partition.victim.len(), geometry.ways);
        for &line in partition
            .attacker
            .lines()
            .iter()
            .chain(partition.victim.lines())
        {
            assert_eq!(cache_set_index(line as usize, geometry.sets), 5);
        }
        let attacker: HashSet<usize> = partition.attacker.lines().iter().map(|&p| p as usize).collect();
        let victim: HashSet<usize> = partition.victim.lines().iter().map(|&p| p as usize).collect();
        assert!(attacker.is_disjoint(&victim));
    }

    #[test]
    fn ring_walk_visits_every_member_once() {
        let partition = build_set_partition(&CacheGeometry::default(), 3, 64).unwrap();
        let ring = &partition.attacker;
        let mut seen = HashSet::new();
        let mut p = ring.entry();
        for _ in 0..ring.len() {
            seen.insert(p as usize);
            p = unsafe { crate::chase(p, 1) };
        }
        assert_eq!(p, ring.entry());
        assert_eq!(seen.len(), ring.len());
        for &line in ring.lines() {
            assert!(seen.contains(&(line as usize)));
        }
    }

    #[test]
    fn pool_exhaustion_is_fatal() {
        // One line of each set per page, so 10 pages cannot yield 16 lines.
        let result = build_set_partition(&CacheGeometry::default(), 5, 10);
        assert!(matches!(
            result,
            Err(SetupError::PoolExhausted {
                target_set: 5,
                needed: 16,
                found: 10,
            })
        ));
    }

    #[test]
    fn target_set_must_fit_geometry() {
        let result = build_set_partition(&CacheGeometry::default(), 64, 16);
        assert!(matches!(
            result,
            Err(SetupError::TargetSetOutOfRange { target_set: 64, sets: 64 })
        ));
    }
}
