//! Host-side configuration.
//!
//! The engine never performs I/O itself; these settings belong to the
//! binaries that embed it:
//! - The UDP host (`strom serve`)
//! - The deterministic simulator (`strom simulate`)

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

use crate::validation;

/// Settings for a host that drives the engine over real sockets.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct HostConfig {
    /// Number of execution units (worker tasks).
    #[validate(range(min = 1, max = 1024))]
    #[serde(default = "default_units")]
    pub units: usize,

    /// UDP bind address.
    #[validate(custom(function = validation::validate_bind))]
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_units() -> usize {
    num_cpus::get()
}

fn default_bind() -> String {
    "127.0.0.1:4433".into()
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            units: default_units(),
            bind: default_bind(),
        }
    }
}

/// Deterministic simulation parameters.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct SimulatorConfig {
    /// Seed for the loss model and connection identifiers.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Server-side execution units.
    #[validate(range(min = 1, max = 64))]
    #[serde(default = "default_sim_units")]
    pub units: usize,

    /// Client connections opened at the start of the run.
    #[validate(range(min = 1, max = 100000))]
    #[serde(default = "default_connections")]
    pub connections: usize,

    /// Probability that a datagram is lost in flight.
    #[validate(range(min = 0.0, max = 1.0))]
    #[serde(default)]
    pub loss_probability: f64,

    /// One-way network latency (milliseconds).
    #[validate(range(max = 10000))]
    #[serde(default = "default_latency")]
    pub latency_ms: u64,

    /// Virtual time the run lasts (milliseconds).
    #[validate(range(min = 1, max = 86400000))]
    #[serde(default = "default_duration")]
    pub duration_ms: u64,

    /// Virtual clock granularity (milliseconds).
    #[validate(range(min = 1, max = 1000))]
    #[serde(default = "default_step")]
    pub step_ms: u64,
}

fn default_seed() -> u64 {
    42
}

fn default_sim_units() -> usize {
    2
}

fn default_connections() -> usize {
    16
}

fn default_latency() -> u64 {
    10
}

fn default_duration() -> u64 {
    5000
}

fn default_step() -> u64 {
    1
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            units: default_sim_units(),
            connections: default_connections(),
            loss_probability: 0.0,
            latency_ms: default_latency(),
            duration_ms: default_duration(),
            step_ms: default_step(),
        }
    }
}
