//! Engine configuration parameters.
//!
//! Governs the processing engine shared by every execution unit:
//! - Datagram and outbound region sizing
//! - Retransmission and idle timers
//! - Admission cap and per-call work budget
//! - Next-deadline reporting policy

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

use crate::validation;
use crate::ConfigError;

/// How `process` reports the next deadline back to the host.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlinePolicy {
    /// Report the queue head after every call.
    #[default]
    Always,
    /// Report only when the head moved earlier than the last reported value.
    OnChange,
}

/// Processing engine configuration.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct EngineConfig {
    /// Largest datagram the engine will emit (bytes).
    #[validate(range(min = 1200, max = 65527))]
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,

    /// Capacity of an engine-acquired outbound region (bytes).
    #[validate(range(min = 1200, max = 16777216))]
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// Initial retransmission timeout (milliseconds).
    #[validate(range(min = 1, max = 60000))]
    #[serde(default = "default_initial_rto")]
    pub initial_rto_ms: u64,

    /// Upper bound for the backed-off retransmission timeout (milliseconds).
    #[validate(range(min = 1, max = 600000))]
    #[serde(default = "default_max_rto")]
    pub max_rto_ms: u64,

    /// Retransmissions of one packet before the connection is declared dead.
    #[validate(range(min = 1, max = 64))]
    #[serde(default = "default_max_retransmits")]
    pub max_retransmits: u32,

    /// Close a connection after this long without inbound packets (milliseconds).
    #[validate(range(min = 10, max = 3600000))]
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Period of the per-unit maintenance task (milliseconds).
    #[validate(range(min = 1, max = 3600000))]
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_ms: u64,

    /// Admission cap on connections registered process-wide.
    #[validate(range(min = 1, max = 16777216))]
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Next-deadline reporting policy.
    #[serde(default)]
    pub deadline_policy: DeadlinePolicy,

    /// Advisory cap on work items (packets and timers) handled by one `process` call.
    #[validate(range(min = 1))]
    #[serde(default)]
    pub work_budget: Option<u32>,

    /// Regions cached by an execution unit's local pool.
    #[validate(range(max = 65536))]
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,

    /// Hex-encoded 32-byte key for handshake tokens; random per process when unset.
    #[validate(custom(function = validation::validate_secret))]
    #[serde(default)]
    pub secret: Option<String>,
}

fn default_max_datagram_size() -> usize {
    1350
}

fn default_outbound_capacity() -> usize {
    65536
}

fn default_initial_rto() -> u64 {
    200
}

fn default_max_rto() -> u64 {
    60000
}

fn default_max_retransmits() -> u32 {
    8
}

fn default_idle_timeout() -> u64 {
    30000
}

fn default_maintenance_interval() -> u64 {
    1000
}

fn default_max_connections() -> usize {
    65536
}

fn default_pool_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_datagram_size: default_max_datagram_size(),
            outbound_capacity: default_outbound_capacity(),
            initial_rto_ms: default_initial_rto(),
            max_rto_ms: default_max_rto(),
            max_retransmits: default_max_retransmits(),
            idle_timeout_ms: default_idle_timeout(),
            maintenance_interval_ms: default_maintenance_interval(),
            max_connections: default_max_connections(),
            deadline_policy: DeadlinePolicy::default(),
            work_budget: None,
            pool_capacity: default_pool_capacity(),
            secret: None,
        }
    }
}

impl EngineConfig {
    pub fn initial_rto(&self) -> Duration {
        Duration::from_millis(self.initial_rto_ms)
    }

    pub fn max_rto(&self) -> Duration {
        Duration::from_millis(self.max_rto_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    /// Decoded handshake key, if one was configured.
    ///
    /// Only meaningful after validation; an invalid secret yields `None`.
    pub fn secret_bytes(&self) -> Option<[u8; validation::SECRET_LEN]> {
        let raw = hex::decode(self.secret.as_ref()?).ok()?;
        raw.try_into().ok()
    }

    /// Cross-field checks `validator` cannot express per field.
    pub fn check_consistency(&self) -> Result<(), ConfigError> {
        if self.outbound_capacity < self.max_datagram_size {
            return Err(ConfigError::Inconsistent(format!(
                "outbound_capacity {} is smaller than max_datagram_size {}",
                self.outbound_capacity, self.max_datagram_size
            )));
        }
        if self.max_rto_ms < self.initial_rto_ms {
            return Err(ConfigError::Inconsistent(format!(
                "max_rto_ms {} is below initial_rto_ms {}",
                self.max_rto_ms, self.initial_rto_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_engine_config_is_valid() {
        let config = EngineConfig::default();
        config.validate().expect("Default config should be valid");
        config.check_consistency().unwrap();
    }

    #[test]
    fn rejects_tiny_datagrams() {
        let config = EngineConfig {
            max_datagram_size: 512,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_rto_bounds() {
        let config = EngineConfig {
            initial_rto_ms: 500,
            max_rto_ms: 100,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.check_consistency(),
            Err(ConfigError::Inconsistent(_))
        ));
    }

    #[test]
    fn secret_decodes() {
        let config = EngineConfig {
            secret: Some("11".repeat(32)),
            ..EngineConfig::default()
        };
        config.validate().unwrap();
        assert_eq!(config.secret_bytes(), Some([0x11; 32]));
    }
}
