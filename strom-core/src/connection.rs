//! ## strom-core::connection
//! **Per-connection protocol state**
//!
//! A sans-IO state machine: it never touches the allocator, the deadline
//! queue or the outbound region. Inputs (packets, timer expiries, host
//! requests) append [`ConnectionAction`]s that the engine carries out.
//!
//! States: `Initiating` (client sent Initial), `Handshaking` (server
//! answered an Initial), `Established`, `Closed`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use strom_proto::frames::{self, CloseCode, TOKEN_LEN};
use strom_proto::packet::{self, PacketError};
use strom_proto::{ConnectionId, Packet, PacketHeader, PacketKind, PacketNumber};

use crate::alloc::Region;
use crate::error::ConnectionError;
use crate::time::Timestamp;

/// Packet numbers remembered for duplicate detection.
const RECEIVE_WINDOW: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initiating,
    Handshaking,
    Established,
    Closed,
}

/// A packet the engine should build and emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Initial,
    Handshake([u8; TOKEN_LEN]),
    Ack(PacketNumber),
    Data(Bytes),
    Ping,
    Close(CloseCode),
}

impl Outgoing {
    pub fn kind(&self) -> PacketKind {
        match self {
            Outgoing::Initial => PacketKind::Initial,
            Outgoing::Handshake(_) => PacketKind::Handshake,
            Outgoing::Ack(_) => PacketKind::Ack,
            Outgoing::Data(_) => PacketKind::Data,
            Outgoing::Ping => PacketKind::Ping,
            Outgoing::Close(_) => PacketKind::Close,
        }
    }

    /// Appends the encoded packet to `out`.
    pub fn encode(
        &self,
        connection_id: ConnectionId,
        packet_number: PacketNumber,
        out: &mut BytesMut,
    ) -> Result<(), PacketError> {
        let header = PacketHeader {
            kind: self.kind(),
            connection_id,
            packet_number,
        };
        match self {
            Outgoing::Initial | Outgoing::Ping => packet::encode(&header, &[], out),
            Outgoing::Handshake(token) => packet::encode(&header, token, out),
            Outgoing::Ack(acked) => packet::encode(&header, &frames::encode_ack(*acked), out),
            Outgoing::Data(data) => packet::encode(&header, data, out),
            Outgoing::Close(code) => packet::encode(&header, &frames::encode_close(*code), out),
        }
    }

    /// Data and Ping wait for the handshake; everything else goes out at once.
    fn sendable_in(&self, state: ConnectionState) -> bool {
        match self {
            Outgoing::Data(_) | Outgoing::Ping => state == ConnectionState::Established,
            _ => true,
        }
    }
}

/// An ack-eliciting packet kept until it is acknowledged. The bytes live
/// in a region tagged `SentPacket`.
#[derive(Debug)]
pub struct SentPacket {
    packet_number: PacketNumber,
    kind: PacketKind,
    region: Region,
    len: usize,
    sent_at: Timestamp,
    rto: Duration,
    transmissions: u32,
}

impl SentPacket {
    pub fn new(
        packet_number: PacketNumber,
        kind: PacketKind,
        region: Region,
        len: usize,
        sent_at: Timestamp,
        rto: Duration,
    ) -> Self {
        debug_assert!(len <= region.len());
        Self {
            packet_number,
            kind,
            region,
            len,
            sent_at,
            rto,
            transmissions: 1,
        }
    }

    pub fn packet_number(&self) -> PacketNumber {
        self.packet_number
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// The encoded packet.
    pub fn bytes(&self) -> &[u8] {
        &self.region.as_slice()[..self.len]
    }

    pub fn sent_at(&self) -> Timestamp {
        self.sent_at
    }

    pub fn transmissions(&self) -> u32 {
        self.transmissions
    }

    pub fn into_region(self) -> Region {
        self.region
    }
}

/// What the engine must do in response to a connection input.
#[derive(Debug)]
pub enum ConnectionAction {
    Send(Outgoing),
    /// Re-emit a tracked packet and re-arm its timer `rto` from now.
    Retransmit {
        packet_number: PacketNumber,
        rto: Duration,
    },
    /// An acknowledged packet: cancel its timer and release its region.
    Release(SentPacket),
    ArmIdle(Timestamp),
    /// Finalise the connection, first sending a Close if `notify_peer`.
    Close { code: CloseCode, notify_peer: bool },
}

/// Duplicate detection over a sliding window of packet numbers.
#[derive(Debug, Default)]
struct ReceivedSet {
    floor: PacketNumber,
    seen: BTreeSet<PacketNumber>,
}

impl ReceivedSet {
    /// Records `pn`; false if it was seen before or fell out of the window.
    fn insert(&mut self, pn: PacketNumber) -> bool {
        if pn < self.floor || !self.seen.insert(pn) {
            return false;
        }
        while self.seen.len() > RECEIVE_WINDOW {
            if let Some(lowest) = self.seen.pop_first() {
                self.floor = lowest.saturating_add(1);
            }
        }
        true
    }
}

#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    role: Role,
    state: ConnectionState,
    secrets: Option<Region>,
    next_pn: PacketNumber,
    sent: BTreeMap<PacketNumber, SentPacket>,
    received: ReceivedSet,
    inbox: VecDeque<Bytes>,
    outbox: VecDeque<Outgoing>,
    pending_close: Option<CloseCode>,
    last_activity: Timestamp,
    pub(crate) flush_queued: bool,
}

impl Connection {
    fn new(
        id: ConnectionId,
        role: Role,
        state: ConnectionState,
        secrets: Region,
        now: Timestamp,
    ) -> Self {
        debug_assert_eq!(secrets.contents().len(), TOKEN_LEN);
        Self {
            id,
            role,
            state,
            secrets: Some(secrets),
            next_pn: 0,
            sent: BTreeMap::new(),
            received: ReceivedSet::default(),
            inbox: VecDeque::new(),
            outbox: VecDeque::new(),
            pending_close: None,
            last_activity: now,
            flush_queued: false,
        }
    }

    /// Client side. `secrets` is a zeroed region that will hold the token.
    pub fn initiate(id: ConnectionId, now: Timestamp, secrets: Region) -> Self {
        let mut conn = Self::new(id, Role::Client, ConnectionState::Initiating, secrets, now);
        conn.outbox.push_back(Outgoing::Initial);
        conn
    }

    /// Server side. `secrets` already holds the token derived for `id`.
    pub fn accept(id: ConnectionId, now: Timestamp, secrets: Region) -> Self {
        Self::new(id, Role::Server, ConnectionState::Handshaking, secrets, now)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_activity(&self) -> Timestamp {
        self.last_activity
    }

    /// Packets sent and not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.sent.len()
    }

    pub fn sent_packet(&self, pn: PacketNumber) -> Option<&SentPacket> {
        self.sent.get(&pn)
    }

    pub fn next_packet_number(&mut self) -> PacketNumber {
        let pn = self.next_pn;
        self.next_pn = self.next_pn.wrapping_add(1);
        pn
    }

    pub fn track(&mut self, sent: SentPacket) {
        self.sent.insert(sent.packet_number, sent);
    }

    fn token(&self) -> Option<[u8; TOKEN_LEN]> {
        self.secrets
            .as_ref()
            .and_then(|region| region.contents().try_into().ok())
    }

    pub fn on_packet(
        &mut self,
        now: Timestamp,
        packet: &Packet<'_>,
        actions: &mut Vec<ConnectionAction>,
    ) -> Result<(), ConnectionError> {
        let pn = packet.header.packet_number;
        let unexpected = ConnectionError::UnexpectedPacket {
            kind: packet.header.kind,
            state: self.state,
        };

        match (packet.header.kind, self.role, self.state) {
            (_, _, ConnectionState::Closed) => return Ok(()),

            (PacketKind::Initial, Role::Server, ConnectionState::Handshaking) => {
                if !self.handshake_in_flight() {
                    let token = self.token().ok_or(unexpected)?;
                    actions.push(ConnectionAction::Send(Outgoing::Handshake(token)));
                }
            }
            (PacketKind::Initial, Role::Server, _) => {}

            (PacketKind::Handshake, Role::Client, ConnectionState::Initiating) => {
                let token = frames::decode_token(packet.payload)?;
                if let Some(secrets) = self.secrets.as_mut() {
                    secrets.contents_mut().copy_from_slice(token);
                }
                self.establish(actions);
                actions.push(ConnectionAction::Send(Outgoing::Ack(pn)));
            }
            (PacketKind::Handshake, Role::Client, ConnectionState::Established) => {
                actions.push(ConnectionAction::Send(Outgoing::Ack(pn)));
            }

            (PacketKind::Ack, _, _) => {
                let acked = frames::decode_ack(packet.payload)?;
                if let Some(sent) = self.sent.remove(&acked) {
                    let confirms = sent.kind == PacketKind::Handshake;
                    actions.push(ConnectionAction::Release(sent));
                    if confirms && self.state == ConnectionState::Handshaking {
                        self.establish(actions);
                    }
                }
            }

            (PacketKind::Data, _, ConnectionState::Handshaking | ConnectionState::Established) => {
                // Data from the client proves it received the Handshake.
                if self.state == ConnectionState::Handshaking {
                    self.establish(actions);
                }
                actions.push(ConnectionAction::Send(Outgoing::Ack(pn)));
                if self.received.insert(pn) {
                    self.inbox.push_back(Bytes::copy_from_slice(packet.payload));
                }
            }

            (PacketKind::Ping, _, ConnectionState::Handshaking | ConnectionState::Established) => {
                actions.push(ConnectionAction::Send(Outgoing::Ack(pn)));
            }

            (PacketKind::Close, _, _) => {
                let code = frames::decode_close(packet.payload)?;
                self.state = ConnectionState::Closed;
                actions.push(ConnectionAction::Close {
                    code,
                    notify_peer: false,
                });
            }

            _ => return Err(unexpected),
        }

        self.last_activity = now;
        Ok(())
    }

    /// Drops every retransmission record from the handshake phase and
    /// moves to `Established`.
    fn establish(&mut self, actions: &mut Vec<ConnectionAction>) {
        self.state = ConnectionState::Established;
        let handshake: Vec<PacketNumber> = self
            .sent
            .values()
            .filter(|sent| matches!(sent.kind, PacketKind::Initial | PacketKind::Handshake))
            .map(|sent| sent.packet_number)
            .collect();
        for pn in handshake {
            if let Some(sent) = self.sent.remove(&pn) {
                actions.push(ConnectionAction::Release(sent));
            }
        }
    }

    fn handshake_in_flight(&self) -> bool {
        self.sent.values().any(|sent| sent.kind == PacketKind::Handshake)
    }

    pub fn on_retransmit_timeout(
        &mut self,
        pn: PacketNumber,
        max_retransmits: u32,
        max_rto: Duration,
        actions: &mut Vec<ConnectionAction>,
    ) {
        let Some(sent) = self.sent.get_mut(&pn) else {
            return;
        };
        if sent.transmissions > max_retransmits {
            self.state = ConnectionState::Closed;
            actions.push(ConnectionAction::Close {
                code: CloseCode::RetransmitLimit,
                notify_peer: true,
            });
            return;
        }
        sent.transmissions += 1;
        sent.rto = sent.rto.saturating_mul(2).min(max_rto);
        actions.push(ConnectionAction::Retransmit {
            packet_number: pn,
            rto: sent.rto,
        });
    }

    /// The idle timer is armed once and re-armed lazily: when it fires early
    /// because traffic arrived since, it is pushed out to the real expiry.
    pub fn on_idle_timeout(
        &mut self,
        now: Timestamp,
        idle_timeout: Duration,
        actions: &mut Vec<ConnectionAction>,
    ) {
        let expiry = self.last_activity + idle_timeout;
        if now >= expiry {
            self.state = ConnectionState::Closed;
            actions.push(ConnectionAction::Close {
                code: CloseCode::IdleTimeout,
                notify_peer: true,
            });
        } else {
            actions.push(ConnectionAction::ArmIdle(expiry));
        }
    }

    /// Queues application data, split into packets of at most `max_payload`.
    pub fn queue_data(&mut self, mut data: Bytes, max_payload: usize) {
        while !data.is_empty() {
            let chunk = data.split_to(data.len().min(max_payload));
            self.outbox.push_back(Outgoing::Data(chunk));
        }
    }

    pub fn queue_ping(&mut self) {
        self.outbox.push_back(Outgoing::Ping);
    }

    /// Requests a close; the Close packet goes out on the next flush.
    pub fn close(&mut self, code: CloseCode) {
        if self.state != ConnectionState::Closed {
            self.pending_close.get_or_insert(code);
        }
    }

    pub fn is_closing(&self) -> bool {
        self.pending_close.is_some() || self.state == ConnectionState::Closed
    }

    /// Whether a flush would produce anything.
    pub fn wants_flush(&self) -> bool {
        self.pending_close.is_some()
            || self
                .outbox
                .front()
                .is_some_and(|next| next.sendable_in(self.state))
    }

    /// Moves sendable queued packets into `actions`, in queue order. A
    /// pending close goes last and discards anything still waiting on the
    /// handshake.
    pub fn poll_transmit(&mut self, actions: &mut Vec<ConnectionAction>) {
        while self
            .outbox
            .front()
            .is_some_and(|next| next.sendable_in(self.state))
        {
            if let Some(next) = self.outbox.pop_front() {
                actions.push(ConnectionAction::Send(next));
            }
        }
        if let Some(code) = self.pending_close.take() {
            self.outbox.clear();
            self.state = ConnectionState::Closed;
            actions.push(ConnectionAction::Close {
                code,
                notify_peer: true,
            });
        }
    }

    /// Next delivered payload, in packet order of arrival.
    pub fn recv(&mut self) -> Option<Bytes> {
        self.inbox.pop_front()
    }

    pub fn drain_sent(&mut self) -> impl Iterator<Item = SentPacket> {
        std::mem::take(&mut self.sent).into_values()
    }

    pub fn take_secrets(&mut self) -> Option<Region> {
        self.secrets.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{EngineTag, Region};

    fn cid() -> ConnectionId {
        ConnectionId::new(0xc0ffee).unwrap()
    }

    fn secrets() -> Region {
        Region::try_zeroed(EngineTag::ConnectionSecrets.tag(), TOKEN_LEN).unwrap()
    }

    fn sent(pn: PacketNumber, kind: PacketKind) -> SentPacket {
        let region = Region::try_zeroed(EngineTag::SentPacket.tag(), 64).unwrap();
        SentPacket::new(pn, kind, region, 19, Timestamp::ZERO, Duration::from_millis(100))
    }

    fn packet(kind: PacketKind, pn: PacketNumber, payload: &[u8]) -> Packet<'_> {
        Packet {
            header: PacketHeader {
                kind,
                connection_id: cid(),
                packet_number: pn,
            },
            payload,
        }
    }

    fn handshaken_client() -> Connection {
        let mut conn = Connection::initiate(cid(), Timestamp::ZERO, secrets());
        let mut actions = Vec::new();
        conn.poll_transmit(&mut actions);
        let pn = conn.next_packet_number();
        conn.track(sent(pn, PacketKind::Initial));
        let handshake = packet(PacketKind::Handshake, 0, &[7; TOKEN_LEN]);
        conn.on_packet(Timestamp::ZERO, &handshake, &mut actions).unwrap();
        conn
    }

    #[test]
    fn client_handshake_establishes_and_releases_initial() {
        let mut conn = Connection::initiate(cid(), Timestamp::ZERO, secrets());
        let mut actions = Vec::new();
        conn.poll_transmit(&mut actions);
        assert!(matches!(actions.as_slice(), [ConnectionAction::Send(Outgoing::Initial)]));
        actions.clear();

        let pn = conn.next_packet_number();
        conn.track(sent(pn, PacketKind::Initial));
        conn.on_packet(
            Timestamp::from_millis(5),
            &packet(PacketKind::Handshake, 0, &[7; TOKEN_LEN]),
            &mut actions,
        )
        .unwrap();

        assert_eq!(conn.state(), ConnectionState::Established);
        assert_eq!(conn.in_flight(), 0);
        assert_eq!(conn.token(), Some([7; TOKEN_LEN]));
        assert!(matches!(
            actions[0],
            ConnectionAction::Release(ref s) if s.kind() == PacketKind::Initial
        ));
        assert!(matches!(actions[1], ConnectionAction::Send(Outgoing::Ack(0))));
    }

    #[test]
    fn server_answers_initial_once_while_handshake_in_flight() {
        let mut conn = Connection::accept(cid(), Timestamp::ZERO, secrets());
        let mut actions = Vec::new();
        conn.on_packet(Timestamp::ZERO, &packet(PacketKind::Initial, 0, &[]), &mut actions)
            .unwrap();
        assert!(matches!(actions.as_slice(), [ConnectionAction::Send(Outgoing::Handshake(_))]));
        actions.clear();

        let pn = conn.next_packet_number();
        conn.track(sent(pn, PacketKind::Handshake));
        conn.on_packet(Timestamp::ZERO, &packet(PacketKind::Initial, 0, &[]), &mut actions)
            .unwrap();
        assert!(actions.is_empty());

        let ack_frame = frames::encode_ack(0);
        let ack = packet(PacketKind::Ack, 0, &ack_frame);
        conn.on_packet(Timestamp::ZERO, &ack, &mut actions).unwrap();
        assert_eq!(conn.state(), ConnectionState::Established);
        assert!(matches!(actions.as_slice(), [ConnectionAction::Release(_)]));
    }

    #[test]
    fn duplicate_data_is_acked_but_delivered_once() {
        let mut conn = handshaken_client();
        let mut actions = Vec::new();
        for _ in 0..2 {
            conn.on_packet(Timestamp::ZERO, &packet(PacketKind::Data, 4, b"hello"), &mut actions)
                .unwrap();
        }
        let acks = actions
            .iter()
            .filter(|a| matches!(a, ConnectionAction::Send(Outgoing::Ack(4))))
            .count();
        assert_eq!(acks, 2);
        assert_eq!(conn.recv().as_deref(), Some(&b"hello"[..]));
        assert!(conn.recv().is_none());
    }

    #[test]
    fn data_before_handshake_is_rejected() {
        let mut conn = Connection::initiate(cid(), Timestamp::ZERO, secrets());
        let mut actions = Vec::new();
        let err = conn
            .on_packet(Timestamp::ZERO, &packet(PacketKind::Data, 0, b"x"), &mut actions)
            .unwrap_err();
        assert_eq!(
            err,
            ConnectionError::UnexpectedPacket {
                kind: PacketKind::Data,
                state: ConnectionState::Initiating
            }
        );
    }

    #[test]
    fn retransmit_backs_off_then_gives_up() {
        let mut conn = handshaken_client();
        conn.track(sent(9, PacketKind::Data));
        let mut actions = Vec::new();
        let max_rto = Duration::from_millis(300);

        conn.on_retransmit_timeout(9, 2, max_rto, &mut actions);
        conn.on_retransmit_timeout(9, 2, max_rto, &mut actions);
        let rtos: Vec<Duration> = actions
            .iter()
            .map(|a| match a {
                ConnectionAction::Retransmit { rto, .. } => *rto,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(rtos, vec![Duration::from_millis(200), Duration::from_millis(300)]);

        actions.clear();
        conn.on_retransmit_timeout(9, 2, max_rto, &mut actions);
        assert!(matches!(
            actions.as_slice(),
            [ConnectionAction::Close {
                code: CloseCode::RetransmitLimit,
                notify_peer: true
            }]
        ));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn idle_timer_rearms_until_quiet() {
        let mut conn = handshaken_client();
        let idle = Duration::from_millis(100);
        let mut actions = Vec::new();
        conn.on_packet(Timestamp::from_millis(60), &packet(PacketKind::Ping, 1, &[]), &mut actions)
            .unwrap();
        actions.clear();

        conn.on_idle_timeout(Timestamp::from_millis(100), idle, &mut actions);
        assert!(matches!(
            actions.as_slice(),
            [ConnectionAction::ArmIdle(at)] if *at == Timestamp::from_millis(160)
        ));
        actions.clear();

        conn.on_idle_timeout(Timestamp::from_millis(160), idle, &mut actions);
        assert!(matches!(
            actions.as_slice(),
            [ConnectionAction::Close {
                code: CloseCode::IdleTimeout,
                ..
            }]
        ));
    }

    #[test]
    fn data_waits_for_handshake_and_is_chunked() {
        let mut conn = Connection::initiate(cid(), Timestamp::ZERO, secrets());
        conn.queue_data(Bytes::from_static(b"abcdefg"), 3);
        let mut actions = Vec::new();
        conn.poll_transmit(&mut actions);
        assert_eq!(actions.len(), 1);
        assert!(!conn.wants_flush());

        let mut conn = handshaken_client();
        conn.queue_data(Bytes::from_static(b"abcdefg"), 3);
        assert!(conn.wants_flush());
        let mut actions = Vec::new();
        conn.poll_transmit(&mut actions);
        let chunks: Vec<&[u8]> = actions
            .iter()
            .map(|a| match a {
                ConnectionAction::Send(Outgoing::Data(d)) => &d[..],
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(chunks, vec![&b"abc"[..], &b"def"[..], &b"g"[..]]);
    }

    #[test]
    fn local_close_goes_out_after_queued_data() {
        let mut conn = handshaken_client();
        conn.queue_data(Bytes::from_static(b"bye"), 100);
        conn.close(CloseCode::Application);
        let mut actions = Vec::new();
        conn.poll_transmit(&mut actions);
        assert!(matches!(actions[0], ConnectionAction::Send(Outgoing::Data(_))));
        assert!(matches!(
            actions[1],
            ConnectionAction::Close {
                code: CloseCode::Application,
                notify_peer: true
            }
        ));
    }

    #[test]
    fn received_window_slides() {
        let mut set = ReceivedSet::default();
        for pn in 0..(RECEIVE_WINDOW as u32 + 10) {
            assert!(set.insert(pn));
        }
        assert!(!set.insert(3));
        assert!(!set.insert(RECEIVE_WINDOW as u32));
    }
}
