/// Counters kept by one execution unit. Plain integers: only the owning
/// unit writes them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitStats {
    pub process_calls: u64,
    pub timers_fired: u64,
    pub packets_in: u64,
    pub bytes_in: u64,
    pub packets_out: u64,
    pub bytes_out: u64,
    /// Inbound packets that failed to parse.
    pub packets_malformed: u64,
    /// Inbound packets for connections this unit does not own.
    pub packets_unroutable: u64,
    /// Inbound packets the owning connection refused.
    pub packets_rejected: u64,
    /// Outbound packets or inbound bytes lost to a full or missing region.
    pub packets_dropped: u64,
    pub retransmits: u64,
    pub alloc_failures: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub admissions_rejected: u64,
}

impl UnitStats {
    /// Counts accumulated since `earlier`.
    pub fn since(&self, earlier: &UnitStats) -> UnitStats {
        UnitStats {
            process_calls: self.process_calls.saturating_sub(earlier.process_calls),
            timers_fired: self.timers_fired.saturating_sub(earlier.timers_fired),
            packets_in: self.packets_in.saturating_sub(earlier.packets_in),
            bytes_in: self.bytes_in.saturating_sub(earlier.bytes_in),
            packets_out: self.packets_out.saturating_sub(earlier.packets_out),
            bytes_out: self.bytes_out.saturating_sub(earlier.bytes_out),
            packets_malformed: self.packets_malformed.saturating_sub(earlier.packets_malformed),
            packets_unroutable: self.packets_unroutable.saturating_sub(earlier.packets_unroutable),
            packets_rejected: self.packets_rejected.saturating_sub(earlier.packets_rejected),
            packets_dropped: self.packets_dropped.saturating_sub(earlier.packets_dropped),
            retransmits: self.retransmits.saturating_sub(earlier.retransmits),
            alloc_failures: self.alloc_failures.saturating_sub(earlier.alloc_failures),
            connections_opened: self.connections_opened.saturating_sub(earlier.connections_opened),
            connections_closed: self.connections_closed.saturating_sub(earlier.connections_closed),
            admissions_rejected: self
                .admissions_rejected
                .saturating_sub(earlier.admissions_rejected),
        }
    }

    /// Adds `other` into `self`; used to total several units.
    pub fn accumulate(&mut self, other: &UnitStats) {
        self.process_calls += other.process_calls;
        self.timers_fired += other.timers_fired;
        self.packets_in += other.packets_in;
        self.bytes_in += other.bytes_in;
        self.packets_out += other.packets_out;
        self.bytes_out += other.bytes_out;
        self.packets_malformed += other.packets_malformed;
        self.packets_unroutable += other.packets_unroutable;
        self.packets_rejected += other.packets_rejected;
        self.packets_dropped += other.packets_dropped;
        self.retransmits += other.retransmits;
        self.alloc_failures += other.alloc_failures;
        self.connections_opened += other.connections_opened;
        self.connections_closed += other.connections_closed;
        self.admissions_rejected += other.admissions_rejected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn since_and_accumulate() {
        let earlier = UnitStats {
            packets_in: 3,
            retransmits: 1,
            ..UnitStats::default()
        };
        let later = UnitStats {
            packets_in: 10,
            retransmits: 1,
            ..UnitStats::default()
        };
        let delta = later.since(&earlier);
        assert_eq!(delta.packets_in, 7);
        assert_eq!(delta.retransmits, 0);

        let mut total = UnitStats::default();
        total.accumulate(&later);
        total.accumulate(&delta);
        assert_eq!(total.packets_in, 17);
    }
}
