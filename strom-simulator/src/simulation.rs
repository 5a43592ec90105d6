//! ## strom-simulator::simulation
//! **The deterministic event loop**
//!
//! The client opens `connections` connections at time zero and sends one
//! message on each once its handshake completes; servers echo whatever they
//! receive. When `duration_ms` has elapsed the client closes everything and
//! the run drains until both sides are empty or the idle timeout passes.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use blake3::Hasher;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use strom_config::{EngineConfig, SimulatorConfig};
use strom_core::alloc::{HeapAllocator, MemorySnapshot};
use strom_core::connection::ConnectionState;
use strom_core::context::{ProcessContext, UnitContext, UnitId};
use strom_core::time::{Clock, Timestamp, VirtualClock};
use strom_core::{process, EventRecord, NextDeadline, UnitStats};
use strom_proto::ConnectionId;
use tracing::{debug, info, instrument, warn};

use crate::network::{NoPacketLossModel, PacketLossModel, ProbabilisticLossModel, SimNetwork, Side};
use crate::routing::{dispatch, packets};
use crate::SimulationError;

/// Loop iterations allowed without the clock moving.
const MAX_ITERATIONS_PER_TICK: usize = 10_000;

struct Endpoint {
    unit: UnitContext,
    wake: Option<Timestamp>,
    inbound: Vec<u8>,
}

impl Endpoint {
    fn new(process: &Arc<ProcessContext>) -> Self {
        Self {
            unit: UnitContext::with_default_allocator(process),
            wake: Some(Timestamp::ZERO),
            inbound: Vec::new(),
        }
    }

    fn is_due(&self, now: Timestamp) -> bool {
        !self.inbound.is_empty() || self.wake.is_some_and(|at| at <= now)
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationReport {
    pub seed: u64,
    /// Hex BLAKE3 digest over every emitted region and when it was emitted.
    pub transcript: String,
    pub finished_at: Timestamp,
    pub connections_requested: usize,
    pub connections_established: usize,
    pub bytes_sent: u64,
    pub bytes_echoed: u64,
    pub datagrams_sent: u64,
    pub datagrams_lost: u64,
    pub client: UnitStats,
    pub servers: UnitStats,
    pub memory: MemorySnapshot,
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "seed:        {}", self.seed)?;
        writeln!(f, "transcript:  {}", self.transcript)?;
        writeln!(f, "finished at: {}", self.finished_at)?;
        writeln!(
            f,
            "connections: {}/{} established",
            self.connections_established, self.connections_requested
        )?;
        writeln!(f, "echo:        {}/{} bytes", self.bytes_echoed, self.bytes_sent)?;
        writeln!(
            f,
            "datagrams:   {} sent, {} lost",
            self.datagrams_sent, self.datagrams_lost
        )?;
        writeln!(
            f,
            "retransmits: client {}, servers {}",
            self.client.retransmits, self.servers.retransmits
        )?;
        write!(
            f,
            "memory:      {} acquisitions, {} releases, {} bytes outstanding",
            self.memory.acquisitions, self.memory.releases, self.memory.bytes_outstanding
        )
    }
}

pub struct Simulation {
    settings: SimulatorConfig,
    clock: VirtualClock,
    network: SimNetwork,
    heap: Arc<HeapAllocator>,
    client_process: Arc<ProcessContext>,
    server_process: Arc<ProcessContext>,
    client: Endpoint,
    servers: Vec<Endpoint>,
    server_ids: Vec<UnitId>,
    rng: SmallRng,
    transcript: Hasher,
    opened: Vec<ConnectionId>,
    pending: BTreeSet<ConnectionId>,
    established: usize,
    bytes_sent: u64,
    bytes_echoed: u64,
}

impl Simulation {
    pub fn new(
        mut engine: EngineConfig,
        settings: SimulatorConfig,
    ) -> Result<Self, SimulationError> {
        engine.check_consistency()?;
        if engine.secret.is_none() {
            let key = blake3::hash(&settings.seed.to_le_bytes());
            engine.secret = Some(hex::encode(key.as_bytes()));
        }

        let loss: Box<dyn PacketLossModel> = if settings.loss_probability > 0.0 {
            Box::new(ProbabilisticLossModel::new(
                settings.loss_probability,
                settings.seed,
            )?)
        } else {
            Box::new(NoPacketLossModel)
        };

        let heap = Arc::new(HeapAllocator::new());
        let client_process = ProcessContext::with_allocator(engine.clone(), heap.clone());
        let server_process = ProcessContext::with_allocator(engine, heap.clone());

        let client = Endpoint::new(&client_process);
        let servers: Vec<Endpoint> = (0..settings.units)
            .map(|_| Endpoint::new(&server_process))
            .collect();
        let server_ids = servers.iter().map(|s| s.unit.id()).collect();

        Ok(Self {
            clock: VirtualClock::new(0),
            network: SimNetwork::new(Duration::from_millis(settings.latency_ms), loss),
            rng: SmallRng::seed_from_u64(settings.seed.rotate_left(32)),
            heap,
            client_process,
            server_process,
            client,
            servers,
            server_ids,
            transcript: Hasher::new(),
            opened: Vec::new(),
            pending: BTreeSet::new(),
            established: 0,
            bytes_sent: 0,
            bytes_echoed: 0,
            settings,
        })
    }

    /// Runs to completion and tears every context down.
    #[instrument(skip(self), fields(seed = self.settings.seed))]
    pub fn run(mut self) -> Result<SimulationReport, SimulationError> {
        let end = Timestamp::from_millis(self.settings.duration_ms);
        let drain_limit = end + self.client_process.config().idle_timeout();
        self.open_connections()?;

        let mut closing = false;
        let mut last_tick = Timestamp::ZERO;
        let mut iterations = 0usize;

        loop {
            let now = self.clock.now();
            if now == last_tick {
                iterations += 1;
                if iterations > MAX_ITERATIONS_PER_TICK {
                    return Err(SimulationError::Stalled { at: now });
                }
            } else {
                last_tick = now;
                iterations = 0;
            }

            self.deliver(now);
            self.step_client(now);
            for index in 0..self.servers.len() {
                self.step_server(index, now);
            }

            if !closing && now >= end {
                info!(at = %now, "run time elapsed, closing connections");
                self.client.unit.close_all();
                self.client.wake = Some(now);
                closing = true;
                continue;
            }
            if closing && (self.drained() || now >= drain_limit) {
                break;
            }

            let Some(next) = self.next_event() else {
                break;
            };
            self.clock.advance_to(self.tick(next, now));
        }

        Ok(self.finish())
    }

    fn open_connections(&mut self) -> Result<(), SimulationError> {
        for _ in 0..self.settings.connections {
            let id = loop {
                if let Some(id) = ConnectionId::new(self.rng.random()) {
                    break id;
                }
            };
            self.client.unit.connect_with_id(id, Timestamp::ZERO)?;
            self.opened.push(id);
            self.pending.insert(id);
        }
        debug!(connections = self.opened.len(), "connections opened");
        Ok(())
    }

    fn deliver(&mut self, now: Timestamp) {
        for (side, datagram) in self.network.deliver_due(now) {
            match side {
                Side::Client => self.client.inbound.extend_from_slice(&datagram),
                Side::Server => {
                    let batches = dispatch(&self.server_process, &self.server_ids, &datagram);
                    for (server, batch) in self.servers.iter_mut().zip(batches) {
                        server.inbound.extend(batch);
                    }
                }
            }
        }
    }

    fn step_client(&mut self, now: Timestamp) {
        if !self.client.is_due(now) {
            return;
        }
        drive(&mut self.client, Side::Server, &mut self.network, &mut self.transcript, now);

        let mut sent_any = false;
        let ready: Vec<ConnectionId> = self.pending.iter().copied().collect();
        for id in ready {
            match self.client.unit.connection_state(id) {
                Some(ConnectionState::Established) => {
                    let message = format!("hello from {}", id).into_bytes();
                    self.bytes_sent += message.len() as u64;
                    if self.client.unit.send(id, message).is_ok() {
                        sent_any = true;
                    }
                    self.established += 1;
                    self.pending.remove(&id);
                }
                Some(_) => {}
                None => {
                    self.pending.remove(&id);
                }
            }
        }

        for id in &self.opened {
            while let Some(bytes) = self.client.unit.recv(*id) {
                self.bytes_echoed += bytes.len() as u64;
            }
        }

        if sent_any {
            self.client.wake = Some(now);
        }
    }

    fn step_server(&mut self, index: usize, now: Timestamp) {
        let server = &mut self.servers[index];
        if !server.is_due(now) {
            return;
        }
        drive(server, Side::Client, &mut self.network, &mut self.transcript, now);

        let mut ids: Vec<ConnectionId> = server.unit.connection_ids().collect();
        ids.sort_unstable();
        let mut echoed = false;
        for id in ids {
            while let Some(bytes) = server.unit.recv(id) {
                echoed |= server.unit.send(id, bytes).is_ok();
            }
        }
        if echoed {
            server.wake = Some(now);
        }
    }

    fn drained(&self) -> bool {
        self.network.is_idle()
            && self.client.unit.connection_count() == 0
            && self.servers.iter().all(|s| s.unit.connection_count() == 0)
    }

    fn next_event(&self) -> Option<Timestamp> {
        std::iter::once(self.client.wake)
            .chain(self.servers.iter().map(|s| s.wake))
            .chain(std::iter::once(self.network.next_delivery()))
            .flatten()
            .min()
    }

    /// Rounds `at` up onto the configured step grid, never before `now`.
    fn tick(&self, at: Timestamp, now: Timestamp) -> Timestamp {
        if at <= now {
            return now;
        }
        let step = Duration::from_millis(self.settings.step_ms).as_nanos() as u64;
        let nanos = at.as_nanos().div_ceil(step).saturating_mul(step);
        Timestamp::from_nanos(nanos)
    }

    fn finish(self) -> SimulationReport {
        let Simulation {
            settings,
            clock,
            network,
            heap,
            client_process,
            server_process,
            client,
            servers,
            transcript,
            opened,
            established,
            bytes_sent,
            bytes_echoed,
            ..
        } = self;

        let client_stats = client.unit.destroy();
        let mut server_stats = UnitStats::default();
        for server in servers {
            server_stats.accumulate(&server.unit.destroy());
        }
        client_process.destroy();
        server_process.destroy();

        let memory = heap.stats().snapshot();
        if memory.bytes_outstanding != 0 {
            warn!(bytes = memory.bytes_outstanding, "regions outstanding after teardown");
        }

        let report = SimulationReport {
            seed: settings.seed,
            transcript: hex::encode(transcript.finalize().as_bytes()),
            finished_at: clock.now(),
            connections_requested: opened.len(),
            connections_established: established,
            bytes_sent,
            bytes_echoed,
            datagrams_sent: network.sent(),
            datagrams_lost: network.dropped(),
            client: client_stats,
            servers: server_stats,
            memory,
        };
        info!(transcript = %report.transcript, "simulation finished");
        report
    }
}

/// One `process` call for `endpoint`; everything it emits goes on the
/// wire towards `to`, one datagram per packet.
fn drive(
    endpoint: &mut Endpoint,
    to: Side,
    network: &mut SimNetwork,
    transcript: &mut Hasher,
    now: Timestamp,
) {
    let mut events = EventRecord::new();
    if !endpoint.inbound.is_empty() {
        match endpoint.unit.inbound_region(&endpoint.inbound) {
            Ok(region) => events.inbound = Some(region),
            Err(e) => warn!(unit = %endpoint.unit.id(), error = %e, "inbound datagrams dropped"),
        }
        endpoint.inbound.clear();
    }

    process(&mut endpoint.unit, &mut events, now);

    if let Some(region) = events.take_outbound() {
        transcript.update(&now.as_nanos().to_le_bytes());
        transcript.update(&endpoint.unit.id().get().to_le_bytes());
        transcript.update(region.as_slice());
        for packet in packets(region.as_slice()) {
            network.send(now, to, packet.to_vec());
        }
        endpoint.unit.release(region);
    }

    match events.next_deadline {
        NextDeadline::At(at) => endpoint.wake = Some(at),
        NextDeadline::Idle => endpoint.wake = None,
        NextDeadline::Unchanged => {}
    }
}
