//! ## strom-proto::packet
//! **Packet header codec**
//!
//! Layout (big endian):
//!
//! ```text
//! +------+---------+---------------+---------------+-------------+---------+
//! | form | version | connection id | packet number | payload len | payload |
//! |  u8  |   u32   |      u64      |      u32      |     u16     |  [len]  |
//! +------+---------+---------------+---------------+-------------+---------+
//! ```
//!
//! The form byte carries `0xC0` in its top bits and the packet kind in the low
//! six. Framing (header length plus payload length) is checked before the form,
//! kind and version, so a packet with a bad kind can be skipped without losing
//! the packets that follow it.

use std::fmt;

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Wire version understood by this codec.
pub const VERSION: u32 = 0x5354_0001;

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 19;

const FORM_BITS: u8 = 0xC0;
const FORM_MASK: u8 = 0xC0;
const KIND_MASK: u8 = 0x3F;

/// Per-connection packet sequence number.
pub type PacketNumber = u32;

/// Errors produced while decoding or encoding packets.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Fewer bytes remain than a header needs.
    #[error("truncated header: need {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    /// The declared payload runs past the end of the region.
    #[error("payload length {declared} exceeds the {available} bytes remaining")]
    LengthOverrun { declared: usize, available: usize },
    /// Top bits of the form byte are not `0xC0`.
    #[error("invalid form byte {0:#04x}")]
    InvalidForm(u8),
    /// Low bits of the form byte name no known kind.
    #[error("unknown packet kind {0}")]
    UnknownKind(u8),
    #[error("unsupported version {0:#010x}")]
    UnsupportedVersion(u32),
    /// Connection id zero is reserved.
    #[error("connection id zero is reserved")]
    ZeroConnectionId,
    /// The payload does not fit the 16-bit length field.
    #[error("payload of {0} bytes is too large to encode")]
    PayloadTooLarge(usize),
    /// The payload is not valid for the packet kind.
    #[error("malformed {0:?} payload")]
    InvalidPayload(PacketKind),
}

impl PacketError {
    /// True when the error leaves the packet boundary unknown, so nothing after
    /// it in the same region can be decoded.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            PacketError::Truncated { .. } | PacketError::LengthOverrun { .. }
        )
    }
}

/// Packet kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Client's first packet for a new connection.
    Initial = 1,
    /// Server's answer to an Initial; carries the handshake token.
    Handshake = 2,
    /// Acknowledges one packet number.
    Ack = 3,
    /// Application data.
    Data = 4,
    /// Keep-alive probe.
    Ping = 5,
    /// Connection teardown; carries a close code.
    Close = 6,
}

impl PacketKind {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Initial),
            2 => Some(Self::Handshake),
            3 => Some(Self::Ack),
            4 => Some(Self::Data),
            5 => Some(Self::Ping),
            6 => Some(Self::Close),
            _ => None,
        }
    }

    /// Kinds the receiver must acknowledge, and the sender must retransmit
    /// until it does.
    pub fn is_ack_eliciting(self) -> bool {
        matches!(
            self,
            Self::Initial | Self::Handshake | Self::Data | Self::Ping
        )
    }
}

/// Connection identifier. Zero is reserved.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Returns `None` for the reserved value zero.
    pub fn new(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_bytes()))
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self)
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    pub connection_id: ConnectionId,
    pub packet_number: PacketNumber,
}

/// A packet borrowing its payload from the inbound region.
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    pub header: PacketHeader,
    pub payload: &'a [u8],
}

/// Bytes a packet with `payload_len` bytes of payload occupies on the wire.
#[inline]
pub fn encoded_len(payload_len: usize) -> usize {
    HEADER_LEN + payload_len
}

/// Appends one encoded packet to `out`.
pub fn encode(
    header: &PacketHeader,
    payload: &[u8],
    out: &mut BytesMut,
) -> Result<(), PacketError> {
    let len =
        u16::try_from(payload.len()).map_err(|_| PacketError::PayloadTooLarge(payload.len()))?;
    out.reserve(encoded_len(payload.len()));
    out.put_u8(FORM_BITS | header.kind as u8);
    out.put_u32(VERSION);
    out.put_u64(header.connection_id.get());
    out.put_u32(header.packet_number);
    out.put_u16(len);
    out.put_slice(payload);
    Ok(())
}

/// Decodes the packet at the start of `data`.
///
/// On success returns the packet and the number of bytes it spans. Errors for
/// which [`PacketError::is_framing`] is false still consumed a known number of
/// bytes; [`frame_len`] recovers it.
pub fn decode(data: &[u8]) -> Result<(Packet<'_>, usize), PacketError> {
    let total = frame_len(data)?;

    let form = data[0];
    if form & FORM_MASK != FORM_BITS {
        return Err(PacketError::InvalidForm(form));
    }
    let kind = PacketKind::from_wire(form & KIND_MASK)
        .ok_or(PacketError::UnknownKind(form & KIND_MASK))?;

    let version = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    if version != VERSION {
        return Err(PacketError::UnsupportedVersion(version));
    }

    let mut raw_id = [0u8; 8];
    raw_id.copy_from_slice(&data[5..13]);
    let connection_id =
        ConnectionId::new(u64::from_be_bytes(raw_id)).ok_or(PacketError::ZeroConnectionId)?;
    let packet_number = u32::from_be_bytes([data[13], data[14], data[15], data[16]]);

    Ok((
        Packet {
            header: PacketHeader {
                kind,
                connection_id,
                packet_number,
            },
            payload: &data[HEADER_LEN..total],
        },
        total,
    ))
}

/// Length of the packet at the start of `data`, checking framing only.
pub fn frame_len(data: &[u8]) -> Result<usize, PacketError> {
    if data.len() < HEADER_LEN {
        return Err(PacketError::Truncated {
            needed: HEADER_LEN,
            available: data.len(),
        });
    }
    let declared = u16::from_be_bytes([data[17], data[18]]) as usize;
    let available = data.len() - HEADER_LEN;
    if declared > available {
        return Err(PacketError::LengthOverrun {
            declared,
            available,
        });
    }
    Ok(HEADER_LEN + declared)
}
