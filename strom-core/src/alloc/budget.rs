//! ## strom-core::alloc::budget
//! **Byte-capped allocator wrapper**
//!
//! Enforces a host memory cap in front of another allocator. Tests use it to
//! inject acquisition failures by lowering the limit mid-run.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use super::{Allocator, AllocError, Region, TypeTag};

#[derive(Debug)]
pub struct BudgetAllocator<A> {
    inner: A,
    limit: AtomicUsize,
    used: AtomicUsize,
}

impl<A: Allocator> BudgetAllocator<A> {
    pub fn new(inner: A, limit: usize) -> Self {
        Self {
            inner,
            limit: AtomicUsize::new(limit),
            used: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    /// Changes the cap. Regions already handed out stay valid.
    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    /// Bytes currently acquired through this wrapper.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

impl<A: Allocator> Allocator for BudgetAllocator<A> {
    fn acquire(&self, tag: TypeTag, size: usize) -> Result<Region, AllocError> {
        let limit = self.limit();
        let reserved = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|total| *total <= limit)
            });
        if reserved.is_err() {
            debug!(tag, size, limit, "memory budget exhausted");
            return Err(AllocError::Exhausted { tag, size });
        }

        self.inner.acquire(tag, size).inspect_err(|_| {
            self.used.fetch_sub(size, Ordering::AcqRel);
        })
    }

    fn release(&self, tag: TypeTag, size: usize, region: Region) {
        let before = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(size))
            })
            .unwrap_or_else(|used| used);
        debug_assert!(size <= before, "released more than was acquired");
        self.inner.release(tag, size, region);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{HeapAllocator, OPAQUE};

    #[test]
    fn refuses_past_the_limit() {
        let budget = BudgetAllocator::new(HeapAllocator::new(), 100);
        let a = budget.acquire(OPAQUE, 60).unwrap();
        assert!(budget.acquire(OPAQUE, 41).is_err());
        let b = budget.acquire(OPAQUE, 40).unwrap();
        assert_eq!(budget.used(), 100);

        budget.release(OPAQUE, 60, a);
        budget.release(OPAQUE, 40, b);
        assert_eq!(budget.used(), 0);
        assert_eq!(budget.inner().stats().releases(), 2);
    }

    #[test]
    fn limit_can_be_lowered_and_restored() {
        let budget = BudgetAllocator::new(HeapAllocator::new(), usize::MAX);
        budget.set_limit(0);
        assert!(budget.acquire(3, 1).is_err());
        budget.set_limit(usize::MAX);
        assert!(budget.acquire(3, 1).is_ok());
    }

    #[test]
    fn inner_failure_returns_the_reservation() {
        let budget = BudgetAllocator::new(HeapAllocator::new(), usize::MAX);
        assert!(budget.acquire(OPAQUE, usize::MAX - 1).is_err());
        assert_eq!(budget.used(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "more than was acquired")]
    fn unmatched_release_is_caught_in_debug() {
        let budget = BudgetAllocator::new(HeapAllocator::new(), 100);
        let region = Region::try_uninit(OPAQUE, 8).unwrap();
        budget.release(OPAQUE, 8, region);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn unmatched_release_does_not_wrap() {
        let budget = BudgetAllocator::new(HeapAllocator::new(), 100);
        let _held = budget.acquire(OPAQUE, 4).unwrap();
        let stray = Region::try_uninit(OPAQUE, 8).unwrap();
        budget.release(OPAQUE, 8, stray);
        assert_eq!(budget.used(), 0);
        assert!(budget.acquire(OPAQUE, 100).is_ok());
    }
}
