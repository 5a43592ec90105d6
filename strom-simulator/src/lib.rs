/*!
# Strom Simulator

A deterministic host for the engine. One client process and one server
process, each with its own registry, exchange datagrams over an in-memory
network driven by a virtual clock. Every outbound region the engine emits is
folded into a BLAKE3 transcript hash, so two runs with the same seed and
configuration can be compared by a single string.

## Key Components:
- **Network:** fixed latency and seeded packet loss.
- **Routing:** per-packet dispatch of datagrams to the owning unit.
- **Simulation:** the event loop and its run report.
*/

use strom_config::ConfigError;
use strom_core::time::Timestamp;
use strom_core::EngineError;
use thiserror::Error;

pub mod network;
pub mod routing;
pub mod simulation;

pub use network::{NoPacketLossModel, PacketLossModel, ProbabilisticLossModel, SimNetwork, Side};
pub use simulation::{Simulation, SimulationReport};

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("loss probability {0} is outside 0..=1")]
    InvalidLossProbability(f64),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The loop kept finding work at the same instant.
    #[error("simulation made no progress at {at}")]
    Stalled { at: Timestamp },
}
