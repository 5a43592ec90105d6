//! ## strom-core::context
//! **Two-tier context hierarchy**
//!
//! - `process`: one per process; owns the connection registry, the only
//!   state shared between execution units
//! - `unit`: one per execution unit; owns its connections, deadline queue
//!   and region pool without any synchronisation

pub mod process;
pub mod unit;

pub use process::{ProcessContext, RegistryEntry, UnitId};
pub use unit::UnitContext;
