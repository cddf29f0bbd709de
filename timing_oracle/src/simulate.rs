//! Deterministic set-associative LRU cache model. The pipeline running on
//! top of it behaves exactly like the hardware path, with residency decided
//! by the model instead of a cycle counter.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use cache_timing::layout::cache_set_index;
use cache_timing::CACHE_LINE_LEN;
use serde::Serialize;

use crate::CacheTimer;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheModel {
    pub sets: usize,
    pub ways: usize,
    pub hit_latency: u64,
    pub miss_latency: u64,
}

impl CacheModel {
    /// Single unbounded set: lines stay resident until flushed. No capacity
    /// evictions means no noise for extraction tests.
    pub fn flat(hit_latency: u64, miss_latency: u64) -> CacheModel {
        CacheModel {
            sets: 1,
            ways: usize::MAX,
            hit_latency,
            miss_latency,
        }
    }

    /// Typical L1D shape, where set contention is observable.
    pub fn l1d(hit_latency: u64, miss_latency: u64) -> CacheModel {
        CacheModel {
            sets: 64,
            ways: 8,
            hit_latency,
            miss_latency,
        }
    }
}

/// A shared cache model: clones mutate the same state, which is how a
/// simulated victim and the measuring side agree on what is resident.
///
/// Lines are keyed by 64-byte-aligned address; each set is an LRU queue of
/// at most `ways` lines.
#[derive(Debug, Clone)]
pub struct SimulatedCache {
    sets: Rc<RefCell<Vec<VecDeque<usize>>>>,
    model: CacheModel,
}

impl SimulatedCache {
    pub fn new(model: CacheModel) -> SimulatedCache {
        assert!(model.sets.is_power_of_two());
        assert!(model.ways > 0);
        SimulatedCache {
            sets: Rc::new(RefCell::new(vec![VecDeque::new(); model.sets])),
            model,
        }
    }

    pub fn model(&self) -> CacheModel {
        self.model
    }

    fn line_of(addr: *const u8) -> usize {
        addr as usize & !(CACHE_LINE_LEN - 1)
    }

    /// Access the line holding `addr`, updating recency, and return the
    /// latency the access saw under the model.
    pub fn touch(&self, addr: *const u8) -> u64 {
        let line = Self::line_of(addr);
        let set = cache_set_index(line, self.model.sets);
        let mut sets = self.sets.borrow_mut();
        let entries = &mut sets[set];
        if let Some(position) = entries.iter().position(|&l| l == line) {
            entries.remove(position);
            entries.push_front(line);
            self.model.hit_latency
        } else {
            entries.push_front(line);
            if entries.len() > self.model.ways {
                entries.pop_back();
            }
            self.model.miss_latency
        }
    }

    pub fn flush_line(&self, addr: *const u8) {
        let line = Self::line_of(addr);
        let set = cache_set_index(line, self.model.sets);
        self.sets.borrow_mut()[set].retain(|&l| l != line);
    }

    pub fn is_resident(&self, addr: *const u8) -> bool {
        let line = Self::line_of(addr);
        let set = cache_set_index(line, self.model.sets);
        self.sets.borrow()[set].contains(&line)
    }

    pub fn resident_lines(&self, set: usize) -> usize {
        self.sets.borrow()[set].len()
    }
}

impl CacheTimer for SimulatedCache {
    unsafe fn timed_access(&mut self, addr: *const u8) -> u64 {
        self.touch(addr)
    }

    unsafe fn timed_chase(&mut self, entry: *const u8, hops: usize) -> u64 {
        // The chase rings are real memory with real links; only the latency
        // accounting is simulated.
        let mut p = entry;
        let mut total = 0;
        for _ in 0..hops {
            total += self.touch(p);
            p = unsafe { core::ptr::read(p as *const *const u8) } as *const u8;
        }
        total
    }

    unsafe fn chase(&mut self, entry: *const u8, hops: usize) {
        unsafe { self.timed_chase(entry, hops) };
    }

    unsafe fn evict(&mut self, addr: *const u8) {
        self.flush_line(addr);
    }

    fn serialize(&mut self) {}
}
