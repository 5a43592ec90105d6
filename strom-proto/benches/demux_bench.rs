#[macro_use]
extern crate criterion;

use bytes::BytesMut;
use criterion::{black_box, Criterion, Throughput};

use strom_proto::packet::encode;
use strom_proto::{ConnectionId, Demuxed, PacketHeader, PacketIter, PacketKind};

fn coalesced(count: u32, payload: &[u8]) -> BytesMut {
    let mut out = BytesMut::new();
    for pn in 0..count {
        let header = PacketHeader {
            kind: PacketKind::Data,
            connection_id: ConnectionId::new(0xfeed).unwrap(),
            packet_number: pn,
        };
        encode(&header, payload, &mut out).unwrap();
    }
    out
}

fn bench_demux(c: &mut Criterion) {
    let mut group = c.benchmark_group("demux");
    let payload = [0xAB; 1200];

    for count in [1u32, 8, 64] {
        let region = coalesced(count, &payload);
        group.throughput(Throughput::Bytes(region.len() as u64));
        group.bench_function(format!("packets_{}", count), |b| {
            b.iter(|| {
                let packets = PacketIter::new(black_box(&region))
                    .filter(|item| matches!(item, Demuxed::Packet(_)))
                    .count();
                assert_eq!(packets, count as usize);
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_demux);
criterion_main!(benches);
