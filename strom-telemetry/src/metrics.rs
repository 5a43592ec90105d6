//! ## strom-telemetry::metrics
//! **Prometheus exporter with histograms**
//!
//! Execution units keep plain counters in [`UnitStats`]; hosts fold the
//! difference between two snapshots into the process-wide registry here.

use std::time::Duration;

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use strom_core::UnitStats;

#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    pub registry: Registry,
    pub process_calls: IntCounter,
    pub packets_in: IntCounter,
    pub packets_out: IntCounter,
    pub packets_dropped: IntCounter,
    pub alloc_failures: IntCounter,
    pub connections_opened: IntCounter,
    pub connections_closed: IntCounter,
    pub retransmits: IntCounter,
    pub process_latency: Histogram,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl MetricsRecorder {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let process_latency = Histogram::with_opts(
            HistogramOpts::new("strom_process_latency_ns", "Wall time of one process call")
                .buckets(vec![1_000.0, 10_000.0, 100_000.0, 1_000_000.0, 10_000_000.0]),
        )?;
        registry.register(Box::new(process_latency.clone()))?;

        Ok(Self {
            process_calls: counter(&registry, "strom_process_calls_total", "Calls to process")?,
            packets_in: counter(&registry, "strom_packets_in_total", "Packets demultiplexed")?,
            packets_out: counter(&registry, "strom_packets_out_total", "Packets emitted")?,
            packets_dropped: counter(
                &registry,
                "strom_packets_dropped_total",
                "Packets lost to malformed input, routing or a missing outbound region",
            )?,
            alloc_failures: counter(
                &registry,
                "strom_alloc_failures_total",
                "Acquisitions refused by the allocator",
            )?,
            connections_opened: counter(
                &registry,
                "strom_connections_opened_total",
                "Connections admitted or initiated",
            )?,
            connections_closed: counter(
                &registry,
                "strom_connections_closed_total",
                "Connections finalised",
            )?,
            retransmits: counter(&registry, "strom_retransmits_total", "Packets retransmitted")?,
            process_latency,
            registry,
        })
    }

    /// Adds the counts in `delta`, normally `now.since(&previous)`.
    pub fn record_unit(&self, delta: &UnitStats) {
        self.process_calls.inc_by(delta.process_calls);
        self.packets_in.inc_by(delta.packets_in);
        self.packets_out.inc_by(delta.packets_out);
        self.packets_dropped.inc_by(
            delta.packets_dropped
                + delta.packets_malformed
                + delta.packets_unroutable
                + delta.packets_rejected,
        );
        self.alloc_failures.inc_by(delta.alloc_failures);
        self.connections_opened.inc_by(delta.connections_opened);
        self.connections_closed.inc_by(delta.connections_closed);
        self.retransmits.inc_by(delta.retransmits);
    }

    pub fn observe_process_latency(&self, elapsed: Duration) {
        self.process_latency.observe(elapsed.as_nanos() as f64);
    }

    pub fn gather_metrics(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::<u8>::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
