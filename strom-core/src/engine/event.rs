//! The record exchanged between host and engine on every `process` call.

use std::time::{Duration, Instant};

use crate::alloc::Region;
use crate::time::Timestamp;

/// When the host should call `process` again if nothing arrives first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NextDeadline {
    /// No deadline is pending.
    #[default]
    Idle,
    At(Timestamp),
    /// The deadline reported earlier still stands (only under the
    /// `on_change` policy).
    Unchanged,
}

impl NextDeadline {
    pub fn at(self) -> Option<Timestamp> {
        match self {
            NextDeadline::At(at) => Some(at),
            _ => None,
        }
    }

    /// Time left until the deadline; zero when it is already due.
    pub fn timeout_from(self, now: Timestamp) -> Option<Duration> {
        self.at().map(|at| at.saturating_duration_since(now))
    }
}

/// Inputs and outputs of one `process` call.
///
/// On entry `inbound` optionally holds a region of received packets, which
/// the engine takes; `outbound` optionally holds a region the host wants
/// packets written into. On return `inbound` is `None`, `outbound` holds
/// whatever the engine emitted, and `next_deadline` is set.
#[derive(Debug, Default)]
pub struct EventRecord {
    pub inbound: Option<Region>,
    pub outbound: Option<Region>,
    pub next_deadline: NextDeadline,
}

impl EventRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_inbound(region: Region) -> Self {
        Self {
            inbound: Some(region),
            ..Self::default()
        }
    }

    pub fn take_outbound(&mut self) -> Option<Region> {
        self.outbound.take()
    }
}

/// Bounds on the work one `process` call may do. Work left over is kept
/// by the unit and resumed on the next call.
#[derive(Debug, Clone, Copy, Default)]
pub struct Budget {
    /// Packets plus timers handled per call.
    pub max_work: Option<u32>,
    /// Stop taking new work once this instant has passed.
    pub wall_deadline: Option<Instant>,
}

impl Budget {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn work(max_work: u32) -> Self {
        Self {
            max_work: Some(max_work),
            wall_deadline: None,
        }
    }

    pub fn until(wall_deadline: Instant) -> Self {
        Self {
            max_work: None,
            wall_deadline: Some(wall_deadline),
        }
    }
}

/// Tracks work done against a [`Budget`]. At least one item is always
/// allowed so every call makes progress.
#[derive(Debug)]
pub(crate) struct WorkMeter {
    remaining: Option<u32>,
    wall_deadline: Option<Instant>,
    spent: u32,
}

impl WorkMeter {
    pub(crate) fn new(budget: Budget) -> Self {
        Self {
            remaining: budget.max_work.map(|max| max.max(1)),
            wall_deadline: budget.wall_deadline,
            spent: 0,
        }
    }

    pub(crate) fn exhausted(&self) -> bool {
        if self.remaining == Some(0) {
            return true;
        }
        self.spent > 0
            && self
                .wall_deadline
                .is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub(crate) fn spend(&mut self) {
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
        self.spent += 1;
    }

    pub(crate) fn spent(&self) -> u32 {
        self.spent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_budget_allows_at_least_one_item() {
        let mut meter = WorkMeter::new(Budget::work(0));
        assert!(!meter.exhausted());
        meter.spend();
        assert!(meter.exhausted());
    }

    #[test]
    fn passed_wall_deadline_still_allows_one_item() {
        let mut meter = WorkMeter::new(Budget::until(Instant::now()));
        assert!(!meter.exhausted());
        meter.spend();
        assert!(meter.exhausted());
        assert_eq!(meter.spent(), 1);
    }

    #[test]
    fn deadline_timeout() {
        let now = Timestamp::from_millis(10);
        assert_eq!(
            NextDeadline::At(Timestamp::from_millis(25)).timeout_from(now),
            Some(Duration::from_millis(15))
        );
        assert_eq!(
            NextDeadline::At(Timestamp::from_millis(5)).timeout_from(now),
            Some(Duration::ZERO)
        );
        assert_eq!(NextDeadline::Idle.timeout_from(now), None);
        assert_eq!(NextDeadline::Unchanged.at(), None);
    }
}
