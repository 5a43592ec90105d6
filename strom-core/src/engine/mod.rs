//! ## strom-core::engine
//! **The processing engine**
//!
//! [`process`] is the single entry point a host calls whenever a datagram
//! arrives or a previously reported deadline passes. One call:
//!
//! 1. services every deadline due at `now` (retransmissions, idle checks,
//!    maintenance), earliest first
//! 2. demultiplexes inbound data, resuming any backlog from an earlier
//!    call before the new region
//! 3. flushes packets queued by the host (`send`, `close`, `connect`)
//! 4. reports the next deadline
//!
//! All of it is non-blocking and touches only the unit's own state, apart
//! from registry updates when a connection is admitted or finalised.

use std::mem;

use strom_proto::frames::{CloseCode, TOKEN_LEN};
use strom_proto::packet::encoded_len;
use strom_proto::{ConnectionId, Demuxed, Packet, PacketIter, PacketKind, PacketNumber};
use strom_config::DeadlinePolicy;
use tracing::{debug, instrument, trace, warn};

use crate::alloc::{acquire_region, release_region, Allocator, EngineTag, Region};
use crate::connection::{Connection, ConnectionAction, Outgoing, SentPacket};
use crate::context::UnitContext;
use crate::deadline::{DeadlineEntry, TimerCause, TimerOwner};
use crate::time::Timestamp;

mod event;
mod outbound;
mod stats;

pub use event::{Budget, EventRecord, NextDeadline};
pub use stats::UnitStats;

use event::WorkMeter;
use outbound::{EmitError, Outbound};

/// Inbound bytes left unprocessed by an earlier call, copied into a region
/// tagged `InboundBacklog`.
#[derive(Debug)]
pub(crate) struct Backlog {
    pub(crate) region: Region,
    pub(crate) offset: usize,
}

impl Backlog {
    pub(crate) fn pending(&self) -> &[u8] {
        &self.region.contents()[self.offset..]
    }
}

/// Runs one processing step for `unit`. See [`UnitContext::process`].
pub fn process<A: Allocator>(unit: &mut UnitContext<A>, events: &mut EventRecord, now: Timestamp) {
    unit.process(events, now)
}

impl<A: Allocator> UnitContext<A> {
    /// Processes `events` at `now` under the configured work budget.
    pub fn process(&mut self, events: &mut EventRecord, now: Timestamp) {
        let budget = Budget {
            max_work: self.process.config().work_budget,
            wall_deadline: None,
        };
        self.process_with_budget(events, now, budget)
    }

    /// Processes `events` at `now`, stopping early when `budget` runs out.
    ///
    /// Nothing is lost to an early stop: unhandled inbound bytes are kept in
    /// the unit's backlog, unhandled timers stay queued, and the reported
    /// deadline is `now` so the host calls again straight away.
    #[instrument(level = "trace", skip_all, fields(unit = %self.id))]
    pub fn process_with_budget(
        &mut self,
        events: &mut EventRecord,
        now: Timestamp,
        budget: Budget,
    ) {
        self.stats.process_calls += 1;
        let mut work = WorkMeter::new(budget);
        let mut out = Outbound::new(
            events.outbound.take(),
            self.process.config().outbound_capacity,
        );

        self.service_deadlines(now, &mut work, &mut out);
        self.drain_inbound(events.inbound.take(), now, &mut work, &mut out);
        self.flush(now, &mut out);
        self.arm_maintenance(now);

        events.outbound = out.finish(&self.allocator);
        events.next_deadline = self.report_deadline(now);
        trace!(work = work.spent(), deadline = ?events.next_deadline, "process complete");
    }

    fn service_deadlines(&mut self, now: Timestamp, work: &mut WorkMeter, out: &mut Outbound) {
        while !work.exhausted() {
            let Some(entry) = self.deadlines.pop_next_due(now) else {
                break;
            };
            work.spend();
            self.stats.timers_fired += 1;
            self.on_deadline(entry, now, out);
        }
    }

    fn on_deadline(&mut self, entry: DeadlineEntry, now: Timestamp, out: &mut Outbound) {
        let TimerOwner::Connection(id) = entry.owner else {
            self.run_maintenance();
            return;
        };
        let (max_retransmits, max_rto, idle_timeout) = {
            let config = self.process.config();
            (config.max_retransmits, config.max_rto(), config.idle_timeout())
        };

        let mut actions = mem::take(&mut self.actions);
        if let Some(conn) = self.connections.get_mut(&id) {
            match entry.cause {
                TimerCause::Retransmit(pn) => {
                    conn.on_retransmit_timeout(pn, max_retransmits, max_rto, &mut actions)
                }
                TimerCause::Idle => conn.on_idle_timeout(now, idle_timeout, &mut actions),
                TimerCause::Maintenance => {}
            }
        }
        self.apply(id, &mut actions, now, out);
        self.actions = actions;
    }

    fn drain_inbound(
        &mut self,
        inbound: Option<Region>,
        now: Timestamp,
        work: &mut WorkMeter,
        out: &mut Outbound,
    ) {
        while let Some(mut backlog) = self.backlog.pop_front() {
            let consumed = self.demux(backlog.pending(), now, work, out);
            backlog.offset += consumed;
            if !backlog.pending().is_empty() {
                self.backlog.push_front(backlog);
                break;
            }
            release_region(&self.allocator, backlog.region);
        }

        let Some(region) = inbound else {
            return;
        };
        let consumed = if self.backlog.is_empty() {
            self.demux(region.as_slice(), now, work, out)
        } else {
            0
        };
        if consumed < region.len() {
            self.defer(&region.as_slice()[consumed..]);
        }
        release_region(&self.allocator, region);
    }

    /// Handles packets from `data` until it or the budget runs out.
    /// Returns the bytes consumed.
    fn demux(
        &mut self,
        data: &[u8],
        now: Timestamp,
        work: &mut WorkMeter,
        out: &mut Outbound,
    ) -> usize {
        let mut packets = PacketIter::new(data);
        while !packets.remainder().is_empty() && !work.exhausted() {
            let Some(item) = packets.next() else {
                break;
            };
            work.spend();
            match item {
                Demuxed::Packet(packet) => {
                    self.stats.packets_in += 1;
                    self.stats.bytes_in += encoded_len(packet.payload.len()) as u64;
                    self.handle_packet(&packet, now, out);
                }
                Demuxed::Skipped { error, len } => {
                    self.stats.packets_malformed += 1;
                    debug!(unit = %self.id, %error, len, "skipped malformed packet");
                }
                Demuxed::Discarded { error, len } => {
                    self.stats.packets_malformed += 1;
                    debug!(unit = %self.id, %error, len, "discarded unframeable bytes");
                }
            }
        }
        packets.offset()
    }

    /// Copies unprocessed inbound bytes so the host's region can go back.
    fn defer(&mut self, data: &[u8]) {
        match acquire_region(&self.allocator, EngineTag::InboundBacklog.tag(), data.len()) {
            Ok(mut region) => {
                region.contents_mut().copy_from_slice(data);
                self.backlog.push_back(Backlog { region, offset: 0 });
            }
            Err(error) => {
                self.stats.alloc_failures += 1;
                self.stats.packets_dropped += 1;
                warn!(unit = %self.id, %error, bytes = data.len(), "inbound backlog dropped");
            }
        }
    }

    fn handle_packet(&mut self, packet: &Packet<'_>, now: Timestamp, out: &mut Outbound) {
        let id = packet.header.connection_id;
        trace!(
            unit = %self.id,
            connection = %id,
            kind = ?packet.header.kind,
            pn = packet.header.packet_number,
            "packet in"
        );

        let mut actions = mem::take(&mut self.actions);
        match self.connections.get_mut(&id) {
            Some(conn) => {
                if let Err(error) = conn.on_packet(now, packet, &mut actions) {
                    self.stats.packets_rejected += 1;
                    debug!(unit = %self.id, connection = %id, %error, "packet rejected");
                }
            }
            None if packet.header.kind == PacketKind::Initial => {
                self.admit(id, now);
                if let Some(conn) = self.connections.get_mut(&id) {
                    if let Err(error) = conn.on_packet(now, packet, &mut actions) {
                        self.stats.packets_rejected += 1;
                        debug!(unit = %self.id, connection = %id, %error, "packet rejected");
                    }
                }
            }
            None => {
                self.stats.packets_unroutable += 1;
                match self.process.route(id) {
                    Some(owner) => warn!(
                        unit = %self.id,
                        %owner,
                        connection = %id,
                        "packet delivered to the wrong unit"
                    ),
                    None => trace!(
                        unit = %self.id,
                        connection = %id,
                        "packet for unknown connection"
                    ),
                }
            }
        }
        self.apply(id, &mut actions, now, out);
        self.actions = actions;
        self.schedule_flush(id);
    }

    /// Server-side admission of a new connection id.
    fn admit(&mut self, id: ConnectionId, now: Timestamp) {
        if !self.admission.admit(id, self.connections.len()) {
            self.stats.admissions_rejected += 1;
            debug!(unit = %self.id, connection = %id, "admission refused");
            return;
        }
        if let Err(error) = self.process.try_register(id, self.id, now) {
            self.stats.admissions_rejected += 1;
            debug!(unit = %self.id, connection = %id, %error, "registration refused");
            return;
        }
        let mut secrets = match self.pool.acquire(
            &self.allocator,
            EngineTag::ConnectionSecrets.tag(),
            TOKEN_LEN,
        ) {
            Ok(region) => region,
            Err(error) => {
                self.process.deregister(id, self.id);
                self.stats.alloc_failures += 1;
                self.stats.admissions_rejected += 1;
                warn!(
                    unit = %self.id,
                    connection = %id,
                    %error,
                    "no memory for connection secrets"
                );
                return;
            }
        };
        secrets
            .contents_mut()
            .copy_from_slice(&self.process.handshake_token(id));

        self.open(Connection::accept(id, now, secrets), now);
        debug!(unit = %self.id, connection = %id, "connection accepted");
    }

    /// Installs a new connection and arms its idle timer.
    pub(crate) fn open(&mut self, conn: Connection, now: Timestamp) {
        let id = conn.id();
        let idle = self.process.config().idle_timeout();
        self.connections.insert(id, conn);
        self.deadlines
            .insert(TimerOwner::Connection(id), now + idle, TimerCause::Idle);
        self.stats.connections_opened += 1;
    }

    fn apply(
        &mut self,
        id: ConnectionId,
        actions: &mut Vec<ConnectionAction>,
        now: Timestamp,
        out: &mut Outbound,
    ) {
        let owner = TimerOwner::Connection(id);
        for action in actions.drain(..) {
            match action {
                ConnectionAction::Send(outgoing) => self.transmit(id, outgoing, now, out),
                ConnectionAction::Retransmit { packet_number, rto } => {
                    self.retransmit(id, packet_number, now, out);
                    self.deadlines
                        .insert(owner, now + rto, TimerCause::Retransmit(packet_number));
                }
                ConnectionAction::Release(sent) => self.release_sent(id, sent),
                ConnectionAction::ArmIdle(at) => {
                    self.deadlines.insert(owner, at, TimerCause::Idle);
                }
                ConnectionAction::Close { code, notify_peer } => {
                    if notify_peer {
                        self.transmit(id, Outgoing::Close(code), now, out);
                    }
                    self.finalize(id, code);
                }
            }
        }
    }

    /// Encodes and emits one packet, keeping a copy for retransmission if
    /// it is ack-eliciting. The copy is kept even when emission fails, so a
    /// dropped packet is recovered by its retransmission timer.
    fn transmit(
        &mut self,
        id: ConnectionId,
        outgoing: Outgoing,
        now: Timestamp,
        out: &mut Outbound,
    ) {
        let (max_datagram, rto) = {
            let config = self.process.config();
            (config.max_datagram_size, config.initial_rto())
        };
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let kind = outgoing.kind();
        let pn = conn.next_packet_number();

        self.scratch.clear();
        if let Err(error) = outgoing.encode(id, pn, &mut self.scratch) {
            warn!(unit = %self.id, connection = %id, %error, "failed to encode packet");
            return;
        }
        debug_assert!(self.scratch.len() <= max_datagram);

        match out.write(&self.scratch, &self.allocator) {
            Ok(()) => {
                self.stats.packets_out += 1;
                self.stats.bytes_out += self.scratch.len() as u64;
                trace!(unit = %self.id, connection = %id, ?kind, pn, "packet out");
            }
            Err(error) => {
                self.stats.packets_dropped += 1;
                if let EmitError::Alloc(_) = error {
                    self.stats.alloc_failures += 1;
                }
                debug!(
                    unit = %self.id,
                    connection = %id,
                    ?kind,
                    pn,
                    %error,
                    "outbound packet dropped"
                );
            }
        }

        if !kind.is_ack_eliciting() {
            return;
        }
        match self
            .pool
            .acquire(&self.allocator, EngineTag::SentPacket.tag(), max_datagram)
        {
            Ok(mut region) => {
                let len = self.scratch.len();
                region.contents_mut()[..len].copy_from_slice(&self.scratch);
                conn.track(SentPacket::new(pn, kind, region, len, now, rto));
                self.deadlines.insert(
                    TimerOwner::Connection(id),
                    now + rto,
                    TimerCause::Retransmit(pn),
                );
            }
            Err(error) => {
                self.stats.alloc_failures += 1;
                warn!(
                    unit = %self.id,
                    connection = %id,
                    pn,
                    %error,
                    "packet sent without retransmission record"
                );
            }
        }
    }

    fn retransmit(
        &mut self,
        id: ConnectionId,
        pn: PacketNumber,
        now: Timestamp,
        out: &mut Outbound,
    ) {
        let Some(sent) = self
            .connections
            .get(&id)
            .and_then(|conn| conn.sent_packet(pn))
        else {
            return;
        };
        self.stats.retransmits += 1;
        match out.write(sent.bytes(), &self.allocator) {
            Ok(()) => {
                self.stats.packets_out += 1;
                self.stats.bytes_out += sent.bytes().len() as u64;
                debug!(
                    unit = %self.id,
                    connection = %id,
                    pn,
                    attempt = sent.transmissions(),
                    waited = ?now.saturating_duration_since(sent.sent_at()),
                    "packet retransmitted"
                );
            }
            Err(error) => {
                self.stats.packets_dropped += 1;
                if let EmitError::Alloc(_) = error {
                    self.stats.alloc_failures += 1;
                }
                debug!(unit = %self.id, connection = %id, pn, %error, "retransmission dropped");
            }
        }
    }

    fn release_sent(&mut self, id: ConnectionId, sent: SentPacket) {
        self.deadlines.remove_cause(
            TimerOwner::Connection(id),
            TimerCause::Retransmit(sent.packet_number()),
        );
        self.pool.release(&self.allocator, sent.into_region());
    }

    /// Removes a connection and returns everything it held: retransmission
    /// records and secrets to the pool, its timers, its registry entry.
    pub(crate) fn finalize(&mut self, id: ConnectionId, code: CloseCode) {
        let Some(mut conn) = self.connections.remove(&id) else {
            return;
        };
        self.deadlines.remove(TimerOwner::Connection(id));
        for sent in conn.drain_sent() {
            self.pool.release(&self.allocator, sent.into_region());
        }
        if let Some(secrets) = conn.take_secrets() {
            self.pool.release(&self.allocator, secrets);
        }
        self.process.deregister(id, self.id);
        self.stats.connections_closed += 1;
        debug!(unit = %self.id, connection = %id, ?code, role = ?conn.role(), "connection closed");
    }

    /// Queues `id` for the flush step if it has something to send.
    pub(crate) fn schedule_flush(&mut self, id: ConnectionId) {
        if let Some(conn) = self.connections.get_mut(&id) {
            if !conn.flush_queued && conn.wants_flush() {
                conn.flush_queued = true;
                self.ready.push_back(id);
            }
        }
    }

    fn flush(&mut self, now: Timestamp, out: &mut Outbound) {
        let max_datagram = self.process.config().max_datagram_size;
        while out.has_room(max_datagram) {
            let Some(id) = self.ready.pop_front() else {
                break;
            };
            let mut actions = mem::take(&mut self.actions);
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.flush_queued = false;
                conn.poll_transmit(&mut actions);
            }
            self.apply(id, &mut actions, now, out);
            self.actions = actions;
        }
    }

    fn arm_maintenance(&mut self, now: Timestamp) {
        if self.maintenance_armed || (self.connections.is_empty() && self.pool.cached() == 0) {
            return;
        }
        let interval = self.process.config().maintenance_interval();
        self.deadlines
            .insert(TimerOwner::Maintenance, now + interval, TimerCause::Maintenance);
        self.maintenance_armed = true;
    }

    /// Periodic housekeeping: shrinks the region pool, entirely once the
    /// unit has no connections left.
    fn run_maintenance(&mut self) {
        self.maintenance_armed = false;
        let keep = if self.connections.is_empty() {
            0
        } else {
            self.pool.capacity() / 2
        };
        let trimmed = self.pool.trim_to(&self.allocator, keep);
        trace!(
            unit = %self.id,
            trimmed,
            connections = self.connections.len(),
            deadlines = self.deadlines.len(),
            "maintenance"
        );
    }

    fn report_deadline(&mut self, now: Timestamp) -> NextDeadline {
        let head = if self.backlog.is_empty() && self.ready.is_empty() {
            self.deadlines.next_deadline()
        } else {
            Some(now)
        };

        match (self.process.config().deadline_policy, head) {
            (_, None) => {
                self.last_reported = None;
                NextDeadline::Idle
            }
            (DeadlinePolicy::OnChange, Some(at))
                if self
                    .last_reported
                    .is_some_and(|reported| reported > now && reported <= at) =>
            {
                NextDeadline::Unchanged
            }
            (_, Some(at)) => {
                self.last_reported = Some(at);
                NextDeadline::At(at)
            }
        }
    }
}
