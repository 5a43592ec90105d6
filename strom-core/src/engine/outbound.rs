//! The outbound region a single `process` call appends packets to.

use thiserror::Error;

use crate::alloc::{acquire_region, release_region, AllocError, Allocator, Region, OPAQUE};

#[derive(Debug, Error)]
pub(crate) enum EmitError {
    #[error("outbound region unavailable: {0}")]
    Alloc(#[from] AllocError),
    /// An earlier acquisition in this call already failed.
    #[error("outbound region unavailable")]
    Unavailable,
    #[error("outbound region full")]
    Full,
}

pub(crate) struct Outbound {
    region: Option<Region>,
    host_supplied: bool,
    capacity: usize,
    failed: bool,
}

impl Outbound {
    /// `supplied` is the region the host handed in, if any; otherwise one
    /// of `capacity` bytes is acquired on first write.
    pub(crate) fn new(supplied: Option<Region>, capacity: usize) -> Self {
        Self {
            host_supplied: supplied.is_some(),
            region: supplied,
            capacity,
            failed: false,
        }
    }

    pub(crate) fn write<A: Allocator + ?Sized>(
        &mut self,
        bytes: &[u8],
        allocator: &A,
    ) -> Result<(), EmitError> {
        if self.region.is_none() {
            if self.failed {
                return Err(EmitError::Unavailable);
            }
            match acquire_region(allocator, OPAQUE, self.capacity) {
                Ok(region) => self.region = Some(region),
                Err(e) => {
                    self.failed = true;
                    return Err(e.into());
                }
            }
        }
        let Some(region) = self.region.as_mut() else {
            return Err(EmitError::Unavailable);
        };
        region.try_extend(bytes).map_err(|_| EmitError::Full)
    }

    /// Whether a packet of `len` bytes would still fit.
    pub(crate) fn has_room(&self, len: usize) -> bool {
        match &self.region {
            Some(region) => region.remaining() >= len,
            None => !self.failed && self.capacity >= len,
        }
    }

    /// The region to hand back to the host. An engine-acquired region that
    /// ended up empty is released instead.
    pub(crate) fn finish<A: Allocator + ?Sized>(self, allocator: &A) -> Option<Region> {
        let region = self.region?;
        if region.is_empty() && !self.host_supplied {
            release_region(allocator, region);
            return None;
        }
        Some(region)
    }
}
