//! ## strom-core::context::process
//! **Process-wide context and connection registry**
//!
//! The registry maps every live connection id to the execution unit that
//! owns it. It is the only structure touched by more than one unit, and it
//! is touched only when connections are admitted or finalised, never per
//! packet. Admission is an atomic insert-if-absent, so two units racing to
//! admit the same id cannot both succeed.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use strom_config::{EngineConfig, SECRET_LEN};
use strom_proto::{ConnectionId, TOKEN_LEN};
use tracing::{debug, error, info, instrument};

use crate::alloc::{HeapAllocator, SharedAllocator};
use crate::error::RegistryError;
use crate::time::Timestamp;

/// Identifies an execution unit within its process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(u32);

impl UnitId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit-{}", self.0)
    }
}

/// Registry record for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryEntry {
    pub unit: UnitId,
    pub registered_at: Timestamp,
}

pub struct ProcessContext {
    config: EngineConfig,
    secret: [u8; SECRET_LEN],
    default_allocator: SharedAllocator,
    registry: RwLock<HashMap<ConnectionId, RegistryEntry>>,
    next_unit: AtomicU32,
    live_units: AtomicUsize,
}

impl ProcessContext {
    /// Creates a context whose default allocator is a [`HeapAllocator`].
    pub fn create(config: EngineConfig) -> Arc<Self> {
        Self::with_allocator(config, Arc::new(HeapAllocator::new()))
    }

    #[instrument(skip_all, fields(max_connections = config.max_connections))]
    pub fn with_allocator(config: EngineConfig, default_allocator: SharedAllocator) -> Arc<Self> {
        let secret = config.secret_bytes().unwrap_or_else(|| {
            let mut secret = [0u8; SECRET_LEN];
            rand::rng().fill(&mut secret[..]);
            secret
        });
        info!("process context created");

        Arc::new(Self {
            config,
            secret,
            default_allocator,
            registry: RwLock::new(HashMap::new()),
            next_unit: AtomicU32::new(0),
            live_units: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn default_allocator(&self) -> SharedAllocator {
        Arc::clone(&self.default_allocator)
    }

    /// Registers `id` as owned by `unit`.
    ///
    /// Fails if the id is already registered (to any unit) or the
    /// process-wide connection cap is reached.
    pub fn try_register(
        &self,
        id: ConnectionId,
        unit: UnitId,
        now: Timestamp,
    ) -> Result<(), RegistryError> {
        let mut registry = self.registry.write();
        let limit = self.config.max_connections;
        let full = registry.len() >= limit;
        match registry.entry(id) {
            Entry::Occupied(existing) => Err(RegistryError::AlreadyRegistered {
                id,
                owner: existing.get().unit,
            }),
            Entry::Vacant(_) if full => Err(RegistryError::Full { limit }),
            Entry::Vacant(slot) => {
                slot.insert(RegistryEntry {
                    unit,
                    registered_at: now,
                });
                Ok(())
            }
        }
    }

    pub fn lookup(&self, id: ConnectionId) -> Option<RegistryEntry> {
        self.registry.read().get(&id).copied()
    }

    /// The unit a datagram for `id` should be delivered to.
    pub fn route(&self, id: ConnectionId) -> Option<UnitId> {
        self.lookup(id).map(|entry| entry.unit)
    }

    /// Removes `id` if `unit` owns it. Returns whether it was removed.
    pub fn deregister(&self, id: ConnectionId, unit: UnitId) -> bool {
        let mut registry = self.registry.write();
        match registry.get(&id) {
            Some(entry) if entry.unit == unit => {
                registry.remove(&id);
                true
            }
            _ => false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.registry.read().len()
    }

    pub fn live_units(&self) -> usize {
        self.live_units.load(Ordering::Acquire)
    }

    /// Token a server hands out in its Handshake for `id`.
    pub fn handshake_token(&self, id: ConnectionId) -> [u8; TOKEN_LEN] {
        blake3::keyed_hash(&self.secret, &id.to_bytes()).into()
    }

    pub(crate) fn attach_unit(&self) -> UnitId {
        self.live_units.fetch_add(1, Ordering::AcqRel);
        UnitId(self.next_unit.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn detach_unit(&self, unit: UnitId) {
        self.live_units.fetch_sub(1, Ordering::AcqRel);
        debug!(%unit, "execution unit detached");
    }

    /// Tears the context down. Every execution unit must have been destroyed
    /// first and the registry must be empty.
    pub fn destroy(self: Arc<Self>) {
        let units = self.live_units();
        let connections = self.connection_count();
        if units != 0 || connections != 0 {
            error!(
                units,
                connections, "process context destroyed while still in use"
            );
        }
        debug_assert_eq!(units, 0, "process context destroyed with live execution units");
        debug_assert_eq!(connections, 0, "process context destroyed with registered connections");
        info!("process context destroyed");
    }
}

impl fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessContext")
            .field("connections", &self.connection_count())
            .field("live_units", &self.live_units())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn cid(raw: u64) -> ConnectionId {
        ConnectionId::new(raw).unwrap()
    }

    #[test]
    fn register_route_deregister() {
        let process = ProcessContext::create(EngineConfig::default());
        let unit = process.attach_unit();
        let other = process.attach_unit();

        process.try_register(cid(1), unit, Timestamp::ZERO).unwrap();
        assert_eq!(process.route(cid(1)), Some(unit));
        assert_eq!(
            process.try_register(cid(1), other, Timestamp::ZERO),
            Err(RegistryError::AlreadyRegistered {
                id: cid(1),
                owner: unit
            })
        );

        assert!(!process.deregister(cid(1), other));
        assert!(process.deregister(cid(1), unit));
        assert_eq!(process.connection_count(), 0);

        process.detach_unit(unit);
        process.detach_unit(other);
        process.destroy();
    }

    #[test]
    fn enforces_connection_cap() {
        let config = EngineConfig {
            max_connections: 2,
            ..EngineConfig::default()
        };
        let process = ProcessContext::create(config);
        let unit = process.attach_unit();
        process.try_register(cid(1), unit, Timestamp::ZERO).unwrap();
        process.try_register(cid(2), unit, Timestamp::ZERO).unwrap();
        assert_eq!(
            process.try_register(cid(3), unit, Timestamp::ZERO),
            Err(RegistryError::Full { limit: 2 })
        );
    }

    #[test]
    fn racing_units_admit_once() {
        let process = ProcessContext::create(EngineConfig::default());
        let units: Vec<UnitId> = (0..8).map(|_| process.attach_unit()).collect();

        let handles: Vec<_> = units
            .iter()
            .map(|unit| {
                let process = Arc::clone(&process);
                let unit = *unit;
                thread::spawn(move || {
                    (1..=100u64)
                        .filter(|raw| {
                            process
                                .try_register(cid(*raw), unit, Timestamp::ZERO)
                                .is_ok()
                        })
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
        assert_eq!(process.connection_count(), 100);
    }

    #[test]
    fn tokens_are_keyed_by_secret() {
        let key = "11".repeat(SECRET_LEN);
        let config = EngineConfig {
            secret: Some(key.clone()),
            ..EngineConfig::default()
        };
        let a = ProcessContext::create(config.clone());
        let b = ProcessContext::create(config);
        assert_eq!(a.handshake_token(cid(5)), b.handshake_token(cid(5)));
        assert_ne!(a.handshake_token(cid(5)), a.handshake_token(cid(6)));

        let random = ProcessContext::create(EngineConfig::default());
        assert_ne!(random.handshake_token(cid(5)), a.handshake_token(cid(5)));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "live execution units")]
    fn destroy_with_live_units_panics_in_debug() {
        let process = ProcessContext::create(EngineConfig::default());
        let _unit = process.attach_unit();
        process.destroy();
    }
}
