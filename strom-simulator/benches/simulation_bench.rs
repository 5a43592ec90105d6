#[macro_use]
extern crate criterion;

use criterion::{black_box, Criterion};
use strom_config::{EngineConfig, SimulatorConfig};
use strom_simulator::Simulation;

/// Full runs: handshake, echo and teardown for a batch of connections.
fn benchmark_simulation_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("simulation");
    group.sample_size(20);

    for connections in [16usize, 256] {
        group.bench_function(format!("connections_{}", connections), |b| {
            b.iter(|| {
                let settings = SimulatorConfig {
                    connections,
                    duration_ms: 1_000,
                    ..SimulatorConfig::default()
                };
                let simulation = Simulation::new(EngineConfig::default(), settings).unwrap();
                black_box(simulation.run().unwrap())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_simulation_throughput);
criterion_main!(benches);
