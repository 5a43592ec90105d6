//! # Strom Configuration System
//!
//! Layered configuration for the engine and the hosts that embed it.
//!
//! ## Features
//! - **Unified Configuration**: one `StromConfig` for engine, host, simulator and telemetry
//! - **Validation**: per-field ranges through `validator`, plus cross-field consistency checks
//! - **Environment Awareness**: `STROM_ENV` selects an override file, `STROM_*` variables win last

#![warn(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

mod engine;
mod error;
mod host;
mod telemetry;
mod validation;

pub use engine::{DeadlinePolicy, EngineConfig};
pub use error::ConfigError;
pub use host::{HostConfig, SimulatorConfig};
pub use telemetry::TelemetryConfig;
pub use validation::SECRET_LEN;

/// Top‑level configuration container.
#[derive(Debug, Serialize, Deserialize, Validate, Default, Clone)]
pub struct StromConfig {
    /// Processing engine parameters shared by all execution units.
    #[validate(nested)]
    #[serde(default)]
    pub engine: EngineConfig,

    /// Socket host parameters.
    #[validate(nested)]
    #[serde(default)]
    pub host: HostConfig,

    /// Deterministic simulation parameters.
    #[validate(nested)]
    #[serde(default)]
    pub simulator: SimulatorConfig,

    /// Logging and metrics.
    #[validate(nested)]
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl StromConfig {
    /// Load configuration from default files and environment.
    ///
    /// Hierarchy:
    /// 1. Default values
    /// 2. `config/strom.yaml` if present
    /// 3. `config/<STROM_ENV>.yaml` if present (`STROM_ENV` defaults to `development`)
    /// 4. `STROM_*` environment variables, nested with `__`
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(StromConfig::default()));

        if Path::new("config/strom.yaml").exists() {
            figment = figment.merge(Yaml::file("config/strom.yaml"));
        }

        let env = std::env::var("STROM_ENV").unwrap_or_else(|_| "development".into());
        let env_file = format!("config/{}.yaml", env);
        if Path::new(&env_file).exists() {
            figment = figment.merge(Yaml::file(env_file));
        }

        Self::extract(figment.merge(Env::prefixed("STROM_").split("__")))
    }

    /// Load configuration from a specific file, still honouring `STROM_*` overrides.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(PathBuf::from(path)));
        }

        Self::extract(
            Figment::from(Serialized::defaults(StromConfig::default()))
                .merge(Yaml::file(path))
                .merge(Env::prefixed("STROM_").split("__")),
        )
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        config.engine.check_consistency()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_validation() {
        let config = StromConfig::default();
        config.validate().expect("Default config should validate");
    }

    #[test]
    fn environment_override() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("STROM_ENGINE__MAX_CONNECTIONS", "128");
            jail.set_env("STROM_ENGINE__DEADLINE_POLICY", "on_change");
            let config = StromConfig::load().expect("load");
            assert_eq!(config.engine.max_connections, 128);
            assert_eq!(config.engine.deadline_policy, DeadlinePolicy::OnChange);
            Ok(())
        });
    }

    #[test]
    fn file_then_environment() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "strom.yaml",
                r#"
engine:
  initial_rto_ms: 50
  work_budget: 16
simulator:
  connections: 4
"#,
            )?;
            jail.set_env("STROM_SIMULATOR__SEED", "7");
            let config = StromConfig::load_from_path("strom.yaml").expect("load");
            assert_eq!(config.engine.initial_rto_ms, 50);
            assert_eq!(config.engine.work_budget, Some(16));
            assert_eq!(config.simulator.connections, 4);
            assert_eq!(config.simulator.seed, 7);
            Ok(())
        });
    }

    #[test]
    fn inconsistent_file_is_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "strom.yaml",
                "engine:\n  max_datagram_size: 9000\n  outbound_capacity: 2000\n",
            )?;
            assert!(matches!(
                StromConfig::load_from_path("strom.yaml"),
                Err(ConfigError::Inconsistent(_))
            ));
            Ok(())
        });
    }

    #[test]
    fn missing_file() {
        assert!(matches!(
            StromConfig::load_from_path("does/not/exist.yaml"),
            Err(ConfigError::FileNotFound(_))
        ));
    }
}
