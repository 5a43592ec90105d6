//! ## strom-simulator::network
//! **In-memory datagram network with latency and loss**
//!
//! Every datagram is delayed by the same fixed latency, so delivery order is
//! send order. Loss decisions come from a seeded generator and are the only
//! randomness in a run.

use std::collections::VecDeque;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use strom_core::time::Timestamp;

use crate::SimulationError;

/// Decides whether a datagram is lost in flight.
pub trait PacketLossModel: Send {
    fn should_drop(&mut self) -> bool;
}

/// Never drops a datagram.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPacketLossModel;

impl PacketLossModel for NoPacketLossModel {
    #[inline]
    fn should_drop(&mut self) -> bool {
        false
    }
}

/// Drops each datagram independently with a fixed probability.
#[derive(Debug)]
pub struct ProbabilisticLossModel {
    drop_probability: f64,
    rng: SmallRng,
}

impl ProbabilisticLossModel {
    pub fn new(drop_probability: f64, seed: u64) -> Result<Self, SimulationError> {
        if !(0.0..=1.0).contains(&drop_probability) {
            return Err(SimulationError::InvalidLossProbability(drop_probability));
        }
        Ok(Self {
            drop_probability,
            rng: SmallRng::seed_from_u64(seed),
        })
    }
}

impl PacketLossModel for ProbabilisticLossModel {
    #[inline]
    fn should_drop(&mut self) -> bool {
        self.rng.random_bool(self.drop_probability)
    }
}

/// Which side of the simulated link a datagram travels to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

#[derive(Debug)]
struct InFlight {
    deliver_at: Timestamp,
    to: Side,
    datagram: Vec<u8>,
}

pub struct SimNetwork {
    latency: Duration,
    loss: Box<dyn PacketLossModel>,
    in_flight: VecDeque<InFlight>,
    sent: u64,
    dropped: u64,
}

impl SimNetwork {
    pub fn new(latency: Duration, loss: Box<dyn PacketLossModel>) -> Self {
        Self {
            latency,
            loss,
            in_flight: VecDeque::new(),
            sent: 0,
            dropped: 0,
        }
    }

    /// Puts `datagram` on the wire at `now`. Returns false if it was lost.
    pub fn send(&mut self, now: Timestamp, to: Side, datagram: Vec<u8>) -> bool {
        self.sent += 1;
        if self.loss.should_drop() {
            self.dropped += 1;
            return false;
        }
        self.in_flight.push_back(InFlight {
            deliver_at: now + self.latency,
            to,
            datagram,
        });
        true
    }

    pub fn next_delivery(&self) -> Option<Timestamp> {
        self.in_flight.front().map(|d| d.deliver_at)
    }

    /// Removes and returns every datagram due at or before `now`, in send
    /// order.
    pub fn deliver_due(&mut self, now: Timestamp) -> Vec<(Side, Vec<u8>)> {
        let mut due = Vec::new();
        while self.in_flight.front().is_some_and(|d| d.deliver_at <= now) {
            if let Some(d) = self.in_flight.pop_front() {
                due.push((d.to, d.datagram));
            }
        }
        due
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
