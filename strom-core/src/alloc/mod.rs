//! ## strom-core::alloc
//! **The allocation contract every engine acquisition goes through**
//!
//! The host may supply its own [`Allocator`]; the engine never allocates
//! region storage any other way. Each acquisition carries a [`TypeTag`]:
//! tag [`OPAQUE`] marks variable-length payload data that may come back
//! uninitialised, every other tag marks a fixed-layout object that must be
//! zeroed on acquire and on release.
//!
//! ### Key Submodules:
//! - `region`: the owned byte region handed across the contract
//! - `heap`: the default allocator backed by the global heap
//! - `budget`: a byte-capped wrapper for memory limits and failure injection
//! - `pool`: the execution-unit-local cache of released tagged regions
//! - `stats`: acquisition and zeroing counters

use std::sync::Arc;

use thiserror::Error;

pub mod budget;
pub mod heap;
pub mod pool;
pub mod region;
pub mod stats;

pub use budget::BudgetAllocator;
pub use heap::HeapAllocator;
pub use pool::RegionPool;
pub use region::{Region, RegionFull};
pub use stats::{MemorySnapshot, MemoryStats};

/// Identifies what an acquired region will hold.
pub type TypeTag = u64;

/// Variable-length, uninitialised payload data.
pub const OPAQUE: TypeTag = 0;

/// First tag available to host applications; lower tags belong to the engine.
pub const HOST_TAG_BASE: TypeTag = 1 << 20;

/// Who a tag belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    Opaque,
    Engine,
    Host,
}

impl TagClass {
    pub fn of(tag: TypeTag) -> Self {
        match tag {
            OPAQUE => TagClass::Opaque,
            t if t < HOST_TAG_BASE => TagClass::Engine,
            _ => TagClass::Host,
        }
    }

    /// Whether regions of this class are zeroed on acquire and release.
    pub fn is_zeroed(self) -> bool {
        self != TagClass::Opaque
    }
}

/// Fixed-layout objects the engine acquires through the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum EngineTag {
    /// Per-connection handshake token.
    ConnectionSecrets = 1,
    /// Copy of an ack-eliciting packet kept until it is acknowledged.
    SentPacket = 2,
    /// Inbound bytes left over when a `process` call ran out of budget.
    InboundBacklog = 3,
}

impl EngineTag {
    pub const fn tag(self) -> TypeTag {
        self as TypeTag
    }
}

impl From<EngineTag> for TypeTag {
    fn from(tag: EngineTag) -> Self {
        tag.tag()
    }
}

/// Errors surfaced by an allocator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("allocator refused {size} bytes for tag {tag}")]
    Exhausted { tag: TypeTag, size: usize },
}

/// The allocation contract.
///
/// `acquire` returns a region of at least `size` bytes or an error; it must
/// never block. For any non-zero tag the region is zeroed. `release` is
/// always called with the exact `(tag, size)` pair used to acquire the
/// region, so implementations can pool by size class without bookkeeping.
pub trait Allocator {
    fn acquire(&self, tag: TypeTag, size: usize) -> Result<Region, AllocError>;

    fn release(&self, tag: TypeTag, size: usize, region: Region);
}

impl<A: Allocator + ?Sized> Allocator for &A {
    #[inline]
    fn acquire(&self, tag: TypeTag, size: usize) -> Result<Region, AllocError> {
        (**self).acquire(tag, size)
    }

    #[inline]
    fn release(&self, tag: TypeTag, size: usize, region: Region) {
        (**self).release(tag, size, region)
    }
}

impl<A: Allocator + ?Sized> Allocator for Arc<A> {
    #[inline]
    fn acquire(&self, tag: TypeTag, size: usize) -> Result<Region, AllocError> {
        (**self).acquire(tag, size)
    }

    #[inline]
    fn release(&self, tag: TypeTag, size: usize, region: Region) {
        (**self).release(tag, size, region)
    }
}

impl<A: Allocator + ?Sized> Allocator for Box<A> {
    #[inline]
    fn acquire(&self, tag: TypeTag, size: usize) -> Result<Region, AllocError> {
        (**self).acquire(tag, size)
    }

    #[inline]
    fn release(&self, tag: TypeTag, size: usize, region: Region) {
        (**self).release(tag, size, region)
    }
}

/// An allocator shareable across execution units.
pub type SharedAllocator = Arc<dyn Allocator + Send + Sync>;

/// Acquires a region for `(tag, size)` and records `size` on it, so it is
/// released under the same pair however much the allocator rounded up.
///
/// A region too short for the request counts as a failed acquisition: it is
/// handed straight back and [`AllocError::Exhausted`] is returned.
pub fn acquire_region<A: Allocator + ?Sized>(
    allocator: &A,
    tag: TypeTag,
    size: usize,
) -> Result<Region, AllocError> {
    let mut region = allocator.acquire(tag, size)?;
    let short = if TagClass::of(tag).is_zeroed() {
        region.len() < size
    } else {
        region.size() < size
    };
    if short {
        allocator.release(tag, size, region);
        return Err(AllocError::Exhausted { tag, size });
    }
    region.set_requested(size);
    Ok(region)
}

/// Returns `region` to `allocator` under the pair it was acquired with.
#[inline]
pub fn release_region<A: Allocator + ?Sized>(allocator: &A, region: Region) {
    let (tag, size) = (region.tag(), region.requested());
    allocator.release(tag, size, region);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_classes() {
        assert_eq!(TagClass::of(OPAQUE), TagClass::Opaque);
        assert_eq!(TagClass::of(EngineTag::SentPacket.tag()), TagClass::Engine);
        assert_eq!(TagClass::of(HOST_TAG_BASE - 1), TagClass::Engine);
        assert_eq!(TagClass::of(HOST_TAG_BASE), TagClass::Host);
        assert!(!TagClass::Opaque.is_zeroed());
        assert!(TagClass::Host.is_zeroed());
    }

    #[test]
    fn shared_and_borrowed_allocators_forward() {
        let heap = Arc::new(HeapAllocator::new());
        let shared: SharedAllocator = heap.clone();
        let region = (&shared).acquire(7, 16).unwrap();
        assert_eq!(heap.stats().acquisitions(), 1);
        release_region(&shared, region);
        assert_eq!(heap.stats().releases(), 1);
        assert_eq!(heap.stats().bytes_outstanding(), 0);
    }

    /// Hands out regions rounded up to 64 bytes, or `short` bytes when set.
    struct Rounding {
        short: Option<usize>,
        released: parking_lot::Mutex<Vec<(TypeTag, usize)>>,
    }

    impl Allocator for Rounding {
        fn acquire(&self, tag: TypeTag, size: usize) -> Result<Region, AllocError> {
            let size = self.short.unwrap_or(size.div_ceil(64) * 64);
            if TagClass::of(tag).is_zeroed() {
                Region::try_zeroed(tag, size)
            } else {
                Region::try_uninit(tag, size)
            }
        }

        fn release(&self, tag: TypeTag, size: usize, _region: Region) {
            self.released.lock().push((tag, size));
        }
    }

    #[test]
    fn rounded_regions_release_under_the_requested_size() {
        let alloc = Rounding {
            short: None,
            released: Default::default(),
        };
        let region = acquire_region(&alloc, 3, 19).unwrap();
        assert_eq!(region.size(), 64);
        assert_eq!(region.contents().len(), 19);
        release_region(&alloc, region);

        let region = acquire_region(&alloc, OPAQUE, 100).unwrap();
        assert_eq!(region.remaining(), 100);
        release_region(&alloc, region);
        assert_eq!(*alloc.released.lock(), vec![(3, 19), (OPAQUE, 100)]);
    }

    #[test]
    fn short_regions_are_an_allocation_failure() {
        let alloc = Rounding {
            short: Some(8),
            released: Default::default(),
        };
        let err = acquire_region(&alloc, 3, 19).unwrap_err();
        assert_eq!(err, AllocError::Exhausted { tag: 3, size: 19 });
        assert!(acquire_region(&alloc, OPAQUE, 9).is_err());
        assert_eq!(*alloc.released.lock(), vec![(3, 19), (OPAQUE, 9)]);
    }
}
