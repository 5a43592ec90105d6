//! ## strom-cli
//! **Host binary for the transport engine**
//!
//! `strom simulate` runs the deterministic simulator and prints its report;
//! `strom serve` drives execution units over a real UDP socket as an echo
//! service.

use clap::Parser;
use strom_config::StromConfig;
use strom_telemetry::{EventLogger, MetricsRecorder};

mod commands;
mod serve;

use commands::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => StromConfig::load_from_path(path)?,
        None => StromConfig::load()?,
    };
    EventLogger::init(&config.telemetry.log_level)?;
    let metrics = MetricsRecorder::new()?;

    match cli.command {
        Commands::Simulate(args) => commands::run_simulation_mode(args, config, metrics).await,
        Commands::Serve(args) => commands::run_serve_mode(args, config, metrics).await,
    }
}
