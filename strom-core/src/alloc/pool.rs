//! ## strom-core::alloc::pool
//! **Execution-unit-local cache of released tagged regions**
//!
//! Each unit owns one pool, so no synchronisation is needed. Regions are
//! wiped before they are cached, which keeps the zero-on-acquire guarantee
//! for anything handed back out. Opaque regions bypass the pool.

use std::collections::HashMap;

use super::{acquire_region, release_region, Allocator, AllocError, Region, TagClass, TypeTag};

pub struct RegionPool {
    free: HashMap<(TypeTag, usize), Vec<Region>>,
    cached: usize,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl RegionPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: HashMap::new(),
            cached: 0,
            capacity,
            hits: 0,
            misses: 0,
        }
    }

    /// A zeroed region for `(tag, size)`, from the cache when one is there.
    pub fn acquire<A: Allocator + ?Sized>(
        &mut self,
        allocator: &A,
        tag: TypeTag,
        size: usize,
    ) -> Result<Region, AllocError> {
        if let Some(region) = self.free.get_mut(&(tag, size)).and_then(Vec::pop) {
            self.cached -= 1;
            self.hits += 1;
            return Ok(region);
        }
        self.misses += 1;
        acquire_region(allocator, tag, size)
    }

    /// Caches `region` or, when full or opaque, hands it to `allocator`.
    pub fn release<A: Allocator + ?Sized>(&mut self, allocator: &A, mut region: Region) {
        if !TagClass::of(region.tag()).is_zeroed() || self.cached >= self.capacity {
            release_region(allocator, region);
            return;
        }
        region.wipe();
        self.free
            .entry((region.tag(), region.requested()))
            .or_default()
            .push(region);
        self.cached += 1;
    }

    /// Returns cached regions to `allocator` until at most `keep` remain.
    /// Returns how many were released.
    pub fn trim_to<A: Allocator + ?Sized>(&mut self, allocator: &A, keep: usize) -> usize {
        let mut released = 0;
        while self.cached > keep {
            let Some(regions) = self.free.values_mut().find(|regions| !regions.is_empty()) else {
                break;
            };
            if let Some(region) = regions.pop() {
                release_region(allocator, region);
                self.cached -= 1;
                released += 1;
            }
        }
        self.free.retain(|_, regions| !regions.is_empty());
        released
    }

    /// Returns every cached region to `allocator`.
    pub fn trim<A: Allocator + ?Sized>(&mut self, allocator: &A) -> usize {
        self.trim_to(allocator, 0)
    }

    pub fn cached(&self) -> usize {
        self.cached
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}
