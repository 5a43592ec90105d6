#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use strom_config::EngineConfig;
use strom_core::alloc::{AllocError, Allocator, HeapAllocator, Region, TypeTag, OPAQUE};
use strom_core::connection::ConnectionState;
use strom_core::context::{ProcessContext, UnitContext};
use strom_core::time::Timestamp;
use strom_core::{Budget, EventRecord, NextDeadline};
use strom_proto::packet::frame_len;
use strom_proto::{ConnectionId, Demuxed, PacketIter, PacketKind};

pub fn ms(v: u64) -> Timestamp {
    Timestamp::from_millis(v)
}

pub fn config() -> EngineConfig {
    EngineConfig {
        secret: Some("5a".repeat(32)),
        ..EngineConfig::default()
    }
}

/// A unit in a process of its own, the way two hosts would run.
pub fn endpoint<A: Allocator>(config: EngineConfig, allocator: A) -> UnitContext<A> {
    let process = ProcessContext::create(config);
    UnitContext::create(&process, allocator)
}

pub fn heap_endpoint(
    config: EngineConfig,
) -> (UnitContext<Arc<HeapAllocator>>, Arc<HeapAllocator>) {
    let heap = Arc::new(HeapAllocator::new());
    (endpoint(config, Arc::clone(&heap)), heap)
}

/// One `process` call with no inbound data. Returns the emitted bytes and
/// the reported deadline.
pub fn step<A: Allocator>(unit: &mut UnitContext<A>, now: Timestamp) -> (Vec<u8>, NextDeadline) {
    step_with_budget(unit, None, now, Budget::unlimited())
}

/// One `process` call delivering `data`.
pub fn deliver<A: Allocator>(
    unit: &mut UnitContext<A>,
    data: &[u8],
    now: Timestamp,
) -> (Vec<u8>, NextDeadline) {
    step_with_budget(unit, Some(data), now, Budget::unlimited())
}

pub fn step_with_budget<A: Allocator>(
    unit: &mut UnitContext<A>,
    inbound: Option<&[u8]>,
    now: Timestamp,
    budget: Budget,
) -> (Vec<u8>, NextDeadline) {
    let mut events = EventRecord::new();
    if let Some(data) = inbound {
        events.inbound = Some(unit.inbound_region(data).expect("inbound region"));
    }
    unit.process_with_budget(&mut events, now, budget);
    assert!(events.inbound.is_none(), "engine must take the inbound region");

    let out = match events.take_outbound() {
        Some(region) => {
            let bytes = region.as_slice().to_vec();
            unit.release(region);
            bytes
        }
        None => Vec::new(),
    };
    (out, events.next_deadline)
}

/// Drives a full handshake between `client` and each of `servers`, all fed
/// the same datagrams. Returns the connection id.
pub fn handshake<A: Allocator, B: Allocator>(
    client: &mut UnitContext<A>,
    servers: &mut [&mut UnitContext<B>],
    id: ConnectionId,
    now: Timestamp,
) {
    client.connect_with_id(id, now).expect("connect");
    let (initial, _) = step(client, now);

    let mut reply = Vec::new();
    for server in servers.iter_mut() {
        let (handshake, _) = deliver(&mut **server, &initial, now);
        reply = handshake;
    }
    let (ack, _) = deliver(client, &reply, now);
    for server in servers.iter_mut() {
        deliver(&mut **server, &ack, now);
        assert_eq!(server.connection_state(id), Some(ConnectionState::Established));
    }
    assert_eq!(client.connection_state(id), Some(ConnectionState::Established));
}

/// Splits a coalesced datagram into its packets.
pub fn split_packets(data: &[u8]) -> Vec<Vec<u8>> {
    let mut packets = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let len = frame_len(rest).expect("well framed");
        packets.push(rest[..len].to_vec());
        rest = &rest[len..];
    }
    packets
}

pub fn kinds(data: &[u8]) -> Vec<PacketKind> {
    PacketIter::new(data)
        .filter_map(|item| match item {
            Demuxed::Packet(p) => Some(p.header.kind),
            _ => None,
        })
        .collect()
}

pub fn drain_recv<A: Allocator>(unit: &mut UnitContext<A>, id: ConnectionId) -> Vec<Vec<u8>> {
    std::iter::from_fn(|| unit.recv(id)).map(|b| b.to_vec()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Acquire,
    Release,
}

#[derive(Debug, Clone)]
pub struct Record {
    pub op: Op,
    pub tag: TypeTag,
    pub size: usize,
    /// Region contents at the time of the call.
    pub bytes: Vec<u8>,
}

/// Heap allocator that records every call with a snapshot of the bytes.
#[derive(Default)]
pub struct RecordingAllocator {
    pub heap: HeapAllocator,
    pub log: Mutex<Vec<Record>>,
}

impl Allocator for RecordingAllocator {
    fn acquire(&self, tag: TypeTag, size: usize) -> Result<Region, AllocError> {
        let region = self.heap.acquire(tag, size)?;
        self.log.lock().push(Record {
            op: Op::Acquire,
            tag,
            size,
            bytes: region.as_slice().to_vec(),
        });
        Ok(region)
    }

    fn release(&self, tag: TypeTag, size: usize, region: Region) {
        self.log.lock().push(Record {
            op: Op::Release,
            tag,
            size,
            bytes: region.as_slice().to_vec(),
        });
        self.heap.release(tag, size, region);
    }
}

/// Granularity of [`SizeClassAllocator`] regions.
pub const SIZE_CLASS: usize = 256;

/// Hands out regions rounded up to a multiple of [`SIZE_CLASS`], the way a
/// slab allocator would, and logs the `(tag, size)` pair of every call.
#[derive(Default)]
pub struct SizeClassAllocator {
    pub log: Mutex<Vec<(Op, TypeTag, usize)>>,
}

impl SizeClassAllocator {
    pub fn class_of(size: usize) -> usize {
        size.div_ceil(SIZE_CLASS).max(1) * SIZE_CLASS
    }
}

impl Allocator for SizeClassAllocator {
    fn acquire(&self, tag: TypeTag, size: usize) -> Result<Region, AllocError> {
        let class = Self::class_of(size);
        let region = if tag == OPAQUE {
            Region::try_uninit(tag, class)?
        } else {
            Region::try_zeroed(tag, class)?
        };
        self.log.lock().push((Op::Acquire, tag, size));
        Ok(region)
    }

    fn release(&self, tag: TypeTag, size: usize, region: Region) {
        assert_eq!(region.tag(), tag, "released under a different tag");
        assert_eq!(region.size(), Self::class_of(size), "released under a different size class");
        self.log.lock().push((Op::Release, tag, size));
    }
}
