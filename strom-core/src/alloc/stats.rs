//! ## strom-core::alloc::stats
//! **Allocation statistics and tracking**
//!
//! Counters an allocator keeps about the traffic through the contract. The
//! zeroing counter exists so tests can tell opaque regions were left alone.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Allocation counters.
///
/// This struct uses atomic operations so a shared allocator can record from
/// every execution unit.
#[derive(Debug, Default)]
pub struct MemoryStats {
    acquisitions: AtomicUsize,
    releases: AtomicUsize,
    failures: AtomicUsize,
    bytes_outstanding: AtomicUsize,
    bytes_zeroed: AtomicUsize,
}

/// Point-in-time copy of [`MemoryStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub acquisitions: usize,
    pub releases: usize,
    pub failures: usize,
    pub bytes_outstanding: usize,
    pub bytes_zeroed: usize,
}

impl MemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_acquire(&self, size: usize) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.bytes_outstanding.fetch_add(size, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_release(&self, size: usize) {
        self.releases.fetch_add(1, Ordering::Relaxed);
        self.bytes_outstanding.fetch_sub(size, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_zeroed(&self, bytes: usize) {
        self.bytes_zeroed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::Relaxed)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    /// Bytes acquired and not yet released.
    pub fn bytes_outstanding(&self) -> usize {
        self.bytes_outstanding.load(Ordering::Relaxed)
    }

    /// Bytes zeroed on acquire or release, summed.
    pub fn bytes_zeroed(&self) -> usize {
        self.bytes_zeroed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            acquisitions: self.acquisitions(),
            releases: self.releases(),
            failures: self.failures(),
            bytes_outstanding: self.bytes_outstanding(),
            bytes_zeroed: self.bytes_zeroed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_balance() {
        let stats = MemoryStats::new();
        stats.record_acquire(100);
        stats.record_acquire(28);
        assert_eq!(stats.bytes_outstanding(), 128);

        stats.record_release(100);
        let snap = stats.snapshot();
        assert_eq!(snap.acquisitions, 2);
        assert_eq!(snap.releases, 1);
        assert_eq!(snap.bytes_outstanding, 28);
    }

    #[test]
    fn multiple_increments() {
        let stats = MemoryStats::new();
        for _ in 0..100 {
            stats.record_failure();
            stats.record_zeroed(2);
        }
        assert_eq!(stats.failures(), 100);
        assert_eq!(stats.bytes_zeroed(), 200);
    }
}
