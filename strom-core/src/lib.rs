//! # strom-core
//!
//! Non-blocking core of a connection-oriented, datagram-carried transport
//! engine. The host owns every socket and clock; the engine only turns
//! inbound regions and elapsed deadlines into outbound regions and the next
//! deadline, through [`process`].
//!
//! ### Key Submodules:
//! - `alloc`: the pluggable allocation contract, default heap allocator and
//!   the unit-local region pool
//! - `context`: process-wide registry and per-execution-unit state
//! - `deadline`: per-unit deadline queue
//! - `connection`: per-connection protocol state machine
//! - `engine`: the `process` entry point and the event record
//! - `time`: timestamps and host-side clocks

pub mod alloc;
pub mod connection;
pub mod context;
pub mod deadline;
pub mod engine;
pub mod error;
pub mod time;

pub mod prelude {
    pub use crate::alloc::{
        Allocator, AllocError, EngineTag, HeapAllocator, Region, SharedAllocator, TypeTag, OPAQUE,
    };
    pub use crate::connection::ConnectionState;
    pub use crate::context::{ProcessContext, UnitContext, UnitId};
    pub use crate::engine::{process, Budget, EventRecord, NextDeadline, UnitStats};
    pub use crate::error::*;
    pub use crate::time::{Clock, SystemClock, Timestamp, VirtualClock};
}

pub use context::unit::{AcceptAll, Admission};
pub use engine::{process, Budget, EventRecord, NextDeadline, UnitStats};
pub use error::{ConnectionError, EngineError, RegistryError};
