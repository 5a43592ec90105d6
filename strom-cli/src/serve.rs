//! UDP echo host.
//!
//! One receive loop splits each datagram by connection id and forwards the
//! pieces to the owning execution unit's task. Each unit task sleeps until
//! its reported deadline or its next batch, calls `process`, echoes whatever
//! its connections received and sends every outbound packet to the address
//! its connection was last heard from.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use parking_lot::RwLock;
use strom_config::StromConfig;
use strom_core::context::{ProcessContext, UnitContext};
use strom_core::time::{Clock, SystemClock, Timestamp};
use strom_core::{process, EventRecord, NextDeadline, UnitStats};
use strom_proto::ConnectionId;
use strom_simulator::routing::{dispatch, packet_connection_id, packets};
use strom_telemetry::{EventLogger, MetricsRecorder};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn, Instrument};

/// Inbound batches buffered per unit before the receive loop waits.
const UNIT_QUEUE: usize = 1024;

type Peers = Arc<RwLock<HashMap<ConnectionId, SocketAddr>>>;

#[instrument(level = "info", name = "serve", skip_all, fields(bind = %config.host.bind))]
pub async fn run(config: StromConfig, metrics: MetricsRecorder) -> anyhow::Result<()> {
    let socket = Arc::new(UdpSocket::bind(&config.host.bind).await?);
    let process_context = ProcessContext::create(config.engine.clone());
    let peers: Peers = Arc::new(RwLock::new(HashMap::new()));
    let clock = SystemClock::new();

    let mut unit_ids = Vec::with_capacity(config.host.units);
    let mut senders = Vec::with_capacity(config.host.units);
    let mut tasks = JoinSet::new();
    for _ in 0..config.host.units {
        let unit = UnitContext::with_default_allocator(&process_context);
        let (tx, rx) = mpsc::channel(UNIT_QUEUE);
        unit_ids.push(unit.id());
        senders.push(tx);

        let span = tracing::info_span!("unit_task", unit = %unit.id());
        let worker = UnitWorker {
            unit,
            socket: Arc::clone(&socket),
            peers: Arc::clone(&peers),
            metrics: metrics.clone(),
            clock,
            reported: UnitStats::default(),
        };
        tasks.spawn(worker.run(rx).instrument(span));
    }

    info!(local = %socket.local_addr()?, units = unit_ids.len(), "serving");
    EventLogger::log_event(
        "serve_started",
        vec![KeyValue::new("units", unit_ids.len() as i64)],
    )
    .await;

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, from) = received?;
                let datagram = &buf[..len];
                {
                    let mut peers = peers.write();
                    for id in packets(datagram).filter_map(packet_connection_id) {
                        peers.insert(id, from);
                    }
                }
                let batches = dispatch(&process_context, &unit_ids, datagram);
                for (sender, batch) in senders.iter().zip(batches) {
                    if !batch.is_empty() && sender.send(batch).await.is_err() {
                        warn!("unit task gone, datagram dropped");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    drop(senders);
    while let Some(joined) = tasks.join_next().await {
        joined?;
    }
    process_context.destroy();
    EventLogger::log_event("serve_stopped", Vec::new()).await;
    Ok(())
}

struct UnitWorker {
    unit: UnitContext,
    socket: Arc<UdpSocket>,
    peers: Peers,
    metrics: MetricsRecorder,
    clock: SystemClock,
    reported: UnitStats,
}

impl UnitWorker {
    async fn run(mut self, mut inbound: mpsc::Receiver<Vec<u8>>) {
        let mut wake = Some(self.clock.now());
        loop {
            let batch = match wake {
                Some(at) => {
                    let deadline = tokio::time::Instant::from_std(self.clock.instant(at));
                    tokio::select! {
                        batch = inbound.recv() => match batch {
                            Some(batch) => Some(batch),
                            None => break,
                        },
                        _ = tokio::time::sleep_until(deadline) => None,
                    }
                }
                None => match inbound.recv().await {
                    Some(batch) => Some(batch),
                    None => break,
                },
            };

            if let Some(next) = self.step(batch.as_deref()).await {
                wake = next;
            }
            if self.echo() {
                wake = Some(self.clock.now());
            }
        }

        self.unit.close_all();
        self.step(None).await;
        let stats = self.unit.destroy();
        self.metrics.record_unit(&stats.since(&self.reported));
        info!(?stats, "unit task finished");
    }

    /// One `process` call. Returns the new wake-up time, or `None` when the
    /// engine reported no change.
    async fn step(&mut self, batch: Option<&[u8]>) -> Option<Option<Timestamp>> {
        let mut events = EventRecord::new();
        if let Some(data) = batch {
            match self.unit.inbound_region(data) {
                Ok(region) => events.inbound = Some(region),
                Err(e) => warn!(error = %e, "inbound batch dropped"),
            }
        }

        let now = self.clock.now();
        let started = Instant::now();
        process(&mut self.unit, &mut events, now);
        self.metrics.observe_process_latency(started.elapsed());

        if let Some(region) = events.take_outbound() {
            self.transmit(region.as_slice()).await;
            self.unit.release(region);
        }

        let stats = self.unit.stats();
        self.metrics.record_unit(&stats.since(&self.reported));
        if stats.connections_closed != self.reported.connections_closed {
            let process_context = self.unit.process_context();
            self.peers.write().retain(|id, _| process_context.route(*id).is_some());
        }
        self.reported = stats;

        match events.next_deadline {
            NextDeadline::At(at) => Some(Some(at)),
            NextDeadline::Idle => Some(None),
            NextDeadline::Unchanged => None,
        }
    }

    async fn transmit(&self, region: &[u8]) {
        for packet in packets(region) {
            let Some(id) = packet_connection_id(packet) else {
                continue;
            };
            let Some(addr) = self.peers.read().get(&id).copied() else {
                debug!(connection = %id, "no peer address, packet dropped");
                continue;
            };
            if let Err(e) = self.socket.send_to(packet, addr).await {
                warn!(%addr, error = %e, "send failed");
            }
        }
    }

    /// Queues everything received back to its sender. True if anything
    /// was queued.
    fn echo(&mut self) -> bool {
        let mut queued = false;
        let ids: Vec<ConnectionId> = self.unit.connection_ids().collect();
        for id in ids {
            while let Some(bytes) = self.unit.recv(id) {
                if self.unit.send(id, bytes).is_err() {
                    break;
                }
                queued = true;
            }
        }
        queued
    }
}
