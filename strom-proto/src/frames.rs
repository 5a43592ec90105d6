//! Payload layouts for the control packet kinds.

use crate::packet::{PacketError, PacketKind, PacketNumber};

/// Length of the token carried by a Handshake packet.
pub const TOKEN_LEN: usize = 32;

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    /// Closed by the application on either side.
    Application = 0,
    /// No packet arrived within the idle timeout.
    IdleTimeout = 1,
    /// A packet went unacknowledged past the retransmission limit.
    RetransmitLimit = 2,
    /// The execution unit is shutting down.
    Shutdown = 3,
    /// Any code this implementation does not know.
    Unknown = 0xFFFF,
}

impl CloseCode {
    pub fn from_wire(value: u16) -> Self {
        match value {
            0 => Self::Application,
            1 => Self::IdleTimeout,
            2 => Self::RetransmitLimit,
            3 => Self::Shutdown,
            _ => Self::Unknown,
        }
    }
}

pub fn encode_ack(packet_number: PacketNumber) -> [u8; 4] {
    packet_number.to_be_bytes()
}

pub fn decode_ack(payload: &[u8]) -> Result<PacketNumber, PacketError> {
    let raw: [u8; 4] = payload
        .try_into()
        .map_err(|_| PacketError::InvalidPayload(PacketKind::Ack))?;
    Ok(u32::from_be_bytes(raw))
}

pub fn encode_close(code: CloseCode) -> [u8; 2] {
    (code as u16).to_be_bytes()
}

pub fn decode_close(payload: &[u8]) -> Result<CloseCode, PacketError> {
    let raw: [u8; 2] = payload
        .try_into()
        .map_err(|_| PacketError::InvalidPayload(PacketKind::Close))?;
    Ok(CloseCode::from_wire(u16::from_be_bytes(raw)))
}

pub fn decode_token(payload: &[u8]) -> Result<&[u8; TOKEN_LEN], PacketError> {
    payload
        .try_into()
        .map_err(|_| PacketError::InvalidPayload(PacketKind::Handshake))
}
