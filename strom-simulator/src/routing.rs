//! ## strom-simulator::routing
//! **Host-side dispatch of inbound datagrams to execution units**
//!
//! A datagram may coalesce packets of several connections. Each packet goes
//! to the unit the registry names for its connection id; packets for ids
//! nobody owns yet (a new Initial) are spread by id, and bytes that cannot
//! be framed go to the first unit so they are still counted.

use strom_core::context::{ProcessContext, UnitId};
use strom_proto::packet::{self, frame_len};
use strom_proto::ConnectionId;

/// Connection id of the packet at the start of `data`, if it decodes.
pub fn packet_connection_id(data: &[u8]) -> Option<ConnectionId> {
    packet::decode(data).ok().map(|(p, _)| p.header.connection_id)
}

/// Splits `datagram` into one byte batch per unit. `units[i]` is the
/// registry identity of unit `i`; the result has the same length.
pub fn dispatch(process: &ProcessContext, units: &[UnitId], datagram: &[u8]) -> Vec<Vec<u8>> {
    let mut batches = vec![Vec::new(); units.len()];
    if units.is_empty() {
        return batches;
    }

    let mut rest = datagram;
    while !rest.is_empty() {
        let len = match frame_len(rest) {
            Ok(len) => len,
            Err(_) => {
                batches[0].extend_from_slice(rest);
                break;
            }
        };
        let (packet, tail) = rest.split_at(len);
        batches[unit_for(process, units, packet)].extend_from_slice(packet);
        rest = tail;
    }
    batches
}

fn unit_for(process: &ProcessContext, units: &[UnitId], packet: &[u8]) -> usize {
    let Some(id) = packet_connection_id(packet) else {
        return 0;
    };
    process
        .route(id)
        .and_then(|owner| units.iter().position(|u| *u == owner))
        .unwrap_or_else(|| (id.get() % units.len() as u64) as usize)
}

/// Splits an outbound region into its packets, for hosts that send one
/// datagram per connection.
pub fn packets(region: &[u8]) -> impl Iterator<Item = &[u8]> + '_ {
    let mut rest = region;
    std::iter::from_fn(move || {
        let len = frame_len(rest).ok()?;
        let (packet, tail) = rest.split_at(len);
        rest = tail;
        Some(packet)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use strom_config::EngineConfig;
    use strom_core::context::UnitContext;
    use strom_core::time::Timestamp;
    use strom_proto::{PacketKind, HEADER_LEN, VERSION};

    fn packet_bytes(kind: PacketKind, id: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN);
        out.push(0xC0 | kind as u8);
        out.extend_from_slice(&VERSION.to_be_bytes());
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out
    }

    #[test]
    fn spreads_unknown_ids_and_honours_the_registry() {
        let process = ProcessContext::create(EngineConfig::default());
        let first = UnitContext::with_default_allocator(&process);
        let second = UnitContext::with_default_allocator(&process);
        let units = [first.id(), second.id()];

        // Id 4 would hash to the first unit; the registry says otherwise.
        let owned = ConnectionId::new(4).unwrap();
        process.try_register(owned, units[1], Timestamp::ZERO).unwrap();

        let mut datagram = packet_bytes(PacketKind::Initial, 3);
        datagram.extend(packet_bytes(PacketKind::Ping, 4));
        datagram.extend_from_slice(&[0xC4, 0x00]);

        let batches = dispatch(&process, &units, &datagram);
        assert_eq!(batches[1].len(), 2 * HEADER_LEN);
        assert_eq!(batches[0], vec![0xC4, 0x00]);
        assert!(process.deregister(owned, units[1]));
    }

    #[test]
    fn packets_splits_coalesced_regions() {
        let mut region = packet_bytes(PacketKind::Ping, 1);
        region.extend(packet_bytes(PacketKind::Ping, 2));
        let ids: Vec<_> = packets(&region).filter_map(packet_connection_id).collect();
        assert_eq!(ids, vec![ConnectionId::new(1).unwrap(), ConnectionId::new(2).unwrap()]);
    }
}
