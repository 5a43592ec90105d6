//! ## strom-core::alloc::region
//! **Owned byte regions**
//!
//! A [`Region`] is the unit of transfer across the allocation contract and
//! between host and engine. It remembers the `(tag, size)` pair it was
//! acquired with so it can always be released under the same pair, even
//! when the allocator handed out more than was asked for.

use std::fmt;

use thiserror::Error;
use zeroize::Zeroize;

use super::{AllocError, TypeTag, OPAQUE};

/// A write would run past the end of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("region full: need {needed} bytes, {remaining} remaining")]
pub struct RegionFull {
    pub needed: usize,
    pub remaining: usize,
}

pub struct Region {
    bytes: Vec<u8>,
    tag: TypeTag,
    size: usize,
    requested: usize,
}

impl Region {
    /// An empty region able to hold `size` bytes. Its contents are
    /// unspecified until written; this is what tag [`OPAQUE`] receives.
    pub fn try_uninit(tag: TypeTag, size: usize) -> Result<Self, AllocError> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(size)
            .map_err(|_| AllocError::Exhausted { tag, size })?;
        Ok(Self {
            bytes,
            tag,
            size,
            requested: size,
        })
    }

    /// `size` zero bytes.
    pub fn try_zeroed(tag: TypeTag, size: usize) -> Result<Self, AllocError> {
        let mut region = Self::try_uninit(tag, size)?;
        region.bytes.resize(size, 0);
        Ok(region)
    }

    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    /// Bytes the allocator provided; at least [`Region::requested`].
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes asked for at acquisition. The region is released under this
    /// size and never holds more than it.
    pub fn requested(&self) -> usize {
        self.requested
    }

    pub(crate) fn set_requested(&mut self, requested: usize) {
        debug_assert!(requested <= self.size);
        self.requested = requested;
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.requested.saturating_sub(self.bytes.len())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// The initialised bytes within the requested size. For a tagged region
    /// this is the fixed-layout object, without any slack the allocator
    /// rounded up to.
    pub fn contents(&self) -> &[u8] {
        let end = self.bytes.len().min(self.requested);
        &self.bytes[..end]
    }

    pub fn contents_mut(&mut self) -> &mut [u8] {
        let end = self.bytes.len().min(self.requested);
        &mut self.bytes[..end]
    }

    /// Appends `data` if it fits. Never reallocates.
    pub fn try_extend(&mut self, data: &[u8]) -> Result<(), RegionFull> {
        if data.len() > self.remaining() {
            return Err(RegionFull {
                needed: data.len(),
                remaining: self.remaining(),
            });
        }
        self.bytes.extend_from_slice(data);
        Ok(())
    }

    /// Forgets the contents of an opaque region so it can be refilled.
    pub fn clear(&mut self) {
        debug_assert_eq!(self.tag, OPAQUE, "only opaque regions change length");
        self.bytes.clear();
    }

    /// Overwrites the initialised bytes with zeroes, keeping the length.
    /// Returns the number of bytes wiped.
    pub fn wipe(&mut self) -> usize {
        self.bytes.as_mut_slice().zeroize();
        self.bytes.len()
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("tag", &self.tag)
            .field("size", &self.size)
            .field("requested", &self.requested)
            .field("len", &self.bytes.len())
            .finish()
    }
}
