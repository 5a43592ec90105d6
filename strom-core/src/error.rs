use strom_proto::{ConnectionId, PacketError, PacketKind};
use thiserror::Error;

use crate::alloc::AllocError;
use crate::connection::ConnectionState;
use crate::context::UnitId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("connection {id} is already registered to {owner}")]
    AlreadyRegistered { id: ConnectionId, owner: UnitId },

    #[error("connection limit of {limit} reached")]
    Full { limit: usize },
}

/// Errors returned to the host by the unit's connection operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("connection {0} is closing")]
    ConnectionClosing(ConnectionId),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("allocation failed: {0}")]
    Alloc(#[from] AllocError),
}

/// A packet a connection could not accept. The packet is dropped; the
/// connection carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("{kind:?} packet not expected in state {state:?}")]
    UnexpectedPacket {
        kind: PacketKind,
        state: ConnectionState,
    },

    #[error("invalid payload: {0}")]
    Payload(#[from] PacketError),
}
