//! ## strom-proto::demux
//! **Splitting a region into its concatenated packets**
//!
//! A host may coalesce several packets into one region. The iterator yields
//! each packet in order; a packet whose framing is intact but whose contents
//! are invalid is reported and skipped, while a framing error ends iteration
//! because the next boundary is unknown.

use crate::packet::{self, Packet, PacketError};

/// Outcome of one demultiplexing step.
#[derive(Debug)]
pub enum Demuxed<'a> {
    /// A well-formed packet.
    Packet(Packet<'a>),
    /// A packet that was skipped; `len` bytes were consumed.
    Skipped { error: PacketError, len: usize },
    /// The rest of the region (`len` bytes) cannot be framed and was discarded.
    Discarded { error: PacketError, len: usize },
}

/// Iterator over the packets in a region.
#[derive(Debug, Clone)]
pub struct PacketIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> PacketIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes not yet consumed.
    pub fn remainder(&self) -> &'a [u8] {
        &self.data[self.offset..]
    }
}

impl<'a> Iterator for PacketIter<'a> {
    type Item = Demuxed<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.remainder();
        if rest.is_empty() {
            return None;
        }

        match packet::decode(rest) {
            Ok((packet, len)) => {
                self.offset += len;
                Some(Demuxed::Packet(packet))
            }
            Err(error) if error.is_framing() => {
                let len = rest.len();
                self.offset = self.data.len();
                Some(Demuxed::Discarded { error, len })
            }
            Err(error) => {
                // Non-framing errors are only raised after framing succeeded.
                let len = packet::frame_len(rest).unwrap_or(rest.len());
                self.offset += len;
                Some(Demuxed::Skipped { error, len })
            }
        }
    }
}
