//! ## strom-core::alloc::heap
//! **Default allocator backed by the global heap**

use tracing::trace;

use super::{Allocator, AllocError, MemoryStats, Region, TagClass, TypeTag};

/// The allocator a process context uses when the host supplies none.
///
/// Opaque regions come back uninitialised. Tagged regions are zeroed on
/// acquire and wiped with `zeroize` on release, so key material and packet
/// copies never linger in freed memory.
#[derive(Debug, Default)]
pub struct HeapAllocator {
    stats: MemoryStats,
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &MemoryStats {
        &self.stats
    }
}

impl Allocator for HeapAllocator {
    fn acquire(&self, tag: TypeTag, size: usize) -> Result<Region, AllocError> {
        let result = if TagClass::of(tag).is_zeroed() {
            Region::try_zeroed(tag, size).inspect(|_| self.stats.record_zeroed(size))
        } else {
            Region::try_uninit(tag, size)
        };

        match &result {
            Ok(_) => self.stats.record_acquire(size),
            Err(e) => {
                trace!(tag, size, error = %e, "heap acquisition failed");
                self.stats.record_failure();
            }
        }
        result
    }

    fn release(&self, tag: TypeTag, size: usize, mut region: Region) {
        debug_assert_eq!(region.tag(), tag, "released under a different tag");
        debug_assert_eq!(region.requested(), size, "released under a different size");

        if TagClass::of(tag).is_zeroed() {
            self.stats.record_zeroed(region.wipe());
        }
        self.stats.record_release(size);
    }
}
