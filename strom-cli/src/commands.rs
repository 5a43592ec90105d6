use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use opentelemetry::KeyValue;
use strom_config::StromConfig;
use strom_simulator::Simulation;
use strom_telemetry::{EventLogger, MetricsRecorder};
use tracing::{info, instrument};

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    /// Configuration file; defaults to config/strom.yaml and STROM_* variables.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a deterministic simulation over an in-memory network
    Simulate(SimulateArgs),
    /// Serve an echo endpoint over UDP
    Serve(ServeArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct SimulateArgs {
    #[arg(long)]
    pub seed: Option<u64>,
    /// Client connections to open
    #[arg(long)]
    pub connections: Option<usize>,
    /// Server execution units
    #[arg(long)]
    pub units: Option<usize>,
    /// Probability a datagram is lost in flight
    #[arg(long)]
    pub loss: Option<f64>,
    /// Virtual run time in milliseconds
    #[arg(long)]
    pub duration_ms: Option<u64>,
    /// Fail unless the run's transcript hash equals this value
    #[arg(long)]
    pub validate_hash: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// UDP address to bind
    #[arg(short, long)]
    pub bind: Option<String>,
    /// Execution units, each on its own task
    #[arg(short, long)]
    pub units: Option<usize>,
}

impl SimulateArgs {
    fn apply(&self, config: &mut StromConfig) {
        let sim = &mut config.simulator;
        if let Some(seed) = self.seed {
            sim.seed = seed;
        }
        if let Some(connections) = self.connections {
            sim.connections = connections;
        }
        if let Some(units) = self.units {
            sim.units = units;
        }
        if let Some(loss) = self.loss {
            sim.loss_probability = loss;
        }
        if let Some(duration_ms) = self.duration_ms {
            sim.duration_ms = duration_ms;
        }
    }
}

impl ServeArgs {
    fn apply(&self, config: &mut StromConfig) {
        if let Some(bind) = &self.bind {
            config.host.bind = bind.clone();
        }
        if let Some(units) = self.units {
            config.host.units = units;
        }
    }
}

#[instrument(level = "info", name = "run_simulation_mode", skip_all)]
pub async fn run_simulation_mode(
    args: SimulateArgs,
    mut config: StromConfig,
    metrics: MetricsRecorder,
) -> anyhow::Result<()> {
    args.apply(&mut config);
    let seed = config.simulator.seed;

    let started = Instant::now();
    let simulation = Simulation::new(config.engine.clone(), config.simulator.clone())?;
    let report = tokio::task::spawn_blocking(move || simulation.run())
        .await
        .context("simulation task panicked")??;
    info!(elapsed = ?started.elapsed(), "simulation complete");

    metrics.record_unit(&report.client);
    metrics.record_unit(&report.servers);

    println!("{}", report);
    if config.telemetry.metrics {
        println!("{}", metrics.gather_metrics()?);
    }

    EventLogger::log_event(
        "simulation_complete",
        vec![
            KeyValue::new("seed", seed.to_string()),
            KeyValue::new("transcript", report.transcript.clone()),
        ],
    )
    .await;

    if let Some(expected) = args.validate_hash {
        if report.transcript != expected {
            bail!(
                "transcript mismatch: expected {}, got {}",
                expected,
                report.transcript
            );
        }
    }
    Ok(())
}

pub async fn run_serve_mode(
    args: ServeArgs,
    mut config: StromConfig,
    metrics: MetricsRecorder,
) -> anyhow::Result<()> {
    args.apply(&mut config);
    let print_metrics = config.telemetry.metrics;
    crate::serve::run(config, metrics.clone()).await?;
    if print_metrics {
        println!("{}", metrics.gather_metrics()?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simulate_overrides() {
        let cli = Cli::try_parse_from([
            "strom",
            "simulate",
            "--seed",
            "7",
            "--loss",
            "0.25",
            "--validate-hash",
            "abc",
        ])
        .unwrap();
        let Commands::Simulate(args) = cli.command else {
            panic!("expected simulate");
        };

        let mut config = StromConfig::default();
        args.apply(&mut config);
        assert_eq!(config.simulator.seed, 7);
        assert_eq!(config.simulator.loss_probability, 0.25);
        assert_eq!(args.validate_hash.as_deref(), Some("abc"));
    }

    #[test]
    fn parses_serve_with_global_config() {
        let cli = Cli::try_parse_from(["strom", "serve", "-b", "0.0.0.0:9000", "-c", "strom.yaml"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("strom.yaml")));
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let mut config = StromConfig::default();
        args.apply(&mut config);
        assert_eq!(config.host.bind, "0.0.0.0:9000");
    }
}
