//! # Strom wire codec
//!
//! The compact packet framing the engine demultiplexes. Parsing is zero-copy:
//! decoded packets borrow their payload from the region they came from.

pub mod demux;
pub mod frames;
pub mod packet;

pub use demux::{Demuxed, PacketIter};
pub use frames::{CloseCode, TOKEN_LEN};
pub use packet::{
    ConnectionId, Packet, PacketError, PacketHeader, PacketKind, PacketNumber, HEADER_LEN, VERSION,
};
