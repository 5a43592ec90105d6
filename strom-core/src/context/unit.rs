//! ## strom-core::context::unit
//! **Execution-unit context**
//!
//! Everything one execution unit owns. A unit is driven by exactly one
//! host thread or task at a time (`&mut self` everywhere), which is what
//! lets its connections, deadline queue and pool go unsynchronised.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use rand::Rng;
use strom_proto::frames::{CloseCode, TOKEN_LEN};
use strom_proto::{ConnectionId, HEADER_LEN};
use tracing::{debug, info, instrument};

use crate::alloc::{
    acquire_region, release_region, AllocError, Allocator, EngineTag, Region, RegionPool,
    SharedAllocator, OPAQUE,
};
use crate::connection::{Connection, ConnectionAction, ConnectionState};
use crate::context::{ProcessContext, UnitId};
use crate::deadline::DeadlineQueue;
use crate::engine::{Backlog, UnitStats};
use crate::error::{EngineError, RegistryError};
use crate::time::Timestamp;

/// Attempts at picking an unused random connection id.
const CONNECT_ATTEMPTS: usize = 8;

/// Decides whether a unit accepts a new inbound connection. The
/// process-wide connection cap is enforced separately by the registry.
pub trait Admission {
    /// `load` is the number of connections the unit already owns.
    fn admit(&self, id: ConnectionId, load: usize) -> bool;
}

/// Admits everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl Admission for AcceptAll {
    fn admit(&self, _id: ConnectionId, _load: usize) -> bool {
        true
    }
}

impl<F> Admission for F
where
    F: Fn(ConnectionId, usize) -> bool,
{
    fn admit(&self, id: ConnectionId, load: usize) -> bool {
        self(id, load)
    }
}

pub struct UnitContext<A: Allocator = SharedAllocator> {
    pub(crate) id: UnitId,
    pub(crate) process: Arc<ProcessContext>,
    pub(crate) allocator: A,
    pub(crate) connections: HashMap<ConnectionId, Connection>,
    pub(crate) deadlines: DeadlineQueue,
    pub(crate) pool: RegionPool,
    pub(crate) backlog: VecDeque<Backlog>,
    pub(crate) ready: VecDeque<ConnectionId>,
    pub(crate) actions: Vec<ConnectionAction>,
    pub(crate) scratch: BytesMut,
    pub(crate) admission: Box<dyn Admission + Send + Sync>,
    pub(crate) last_reported: Option<Timestamp>,
    pub(crate) maintenance_armed: bool,
    pub(crate) stats: UnitStats,
    destroyed: bool,
}

impl UnitContext<SharedAllocator> {
    /// A unit that allocates through the process's default allocator.
    pub fn with_default_allocator(process: &Arc<ProcessContext>) -> Self {
        Self::create(process, process.default_allocator())
    }
}

impl<A: Allocator> UnitContext<A> {
    #[instrument(skip_all)]
    pub fn create(process: &Arc<ProcessContext>, allocator: A) -> Self {
        let id = process.attach_unit();
        let config = process.config();
        info!(%id, "execution unit created");

        Self {
            id,
            process: Arc::clone(process),
            allocator,
            connections: HashMap::new(),
            deadlines: DeadlineQueue::new(),
            pool: RegionPool::new(config.pool_capacity),
            backlog: VecDeque::new(),
            ready: VecDeque::new(),
            actions: Vec::new(),
            scratch: BytesMut::with_capacity(config.max_datagram_size),
            admission: Box::new(AcceptAll),
            last_reported: None,
            maintenance_armed: false,
            stats: UnitStats::default(),
            destroyed: false,
        }
    }

    pub fn set_admission<P: Admission + Send + Sync + 'static>(&mut self, admission: P) {
        self.admission = Box::new(admission);
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn process_context(&self) -> &Arc<ProcessContext> {
        &self.process
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn stats(&self) -> UnitStats {
        self.stats
    }

    pub fn deadlines(&self) -> &DeadlineQueue {
        &self.deadlines
    }

    pub fn pool(&self) -> &RegionPool {
        &self.pool
    }

    /// Inbound bytes waiting for the next `process` call.
    pub fn backlog_bytes(&self) -> usize {
        self.backlog
            .iter()
            .map(|backlog| backlog.pending().len())
            .sum()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_ids(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.connections.keys().copied()
    }

    pub fn connection_state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.connections.get(&id).map(Connection::state)
    }

    /// Opens a client connection under a fresh random id. The Initial goes
    /// out on the next `process` call.
    pub fn connect(&mut self, now: Timestamp) -> Result<ConnectionId, EngineError> {
        let mut rng = rand::rng();
        let mut last = None;
        for _ in 0..CONNECT_ATTEMPTS {
            let Some(id) = ConnectionId::new(rng.random()) else {
                continue;
            };
            match self.connect_with_id(id, now) {
                Ok(()) => return Ok(id),
                Err(EngineError::Registry(e @ RegistryError::AlreadyRegistered { .. })) => {
                    last = Some(e)
                }
                Err(e) => return Err(e),
            }
        }
        Err(last
            .map(EngineError::Registry)
            .unwrap_or(EngineError::Registry(RegistryError::Full {
                limit: self.process.config().max_connections,
            })))
    }

    /// Opens a client connection under `id`.
    pub fn connect_with_id(&mut self, id: ConnectionId, now: Timestamp) -> Result<(), EngineError> {
        self.process.try_register(id, self.id, now)?;
        let secrets = match self.pool.acquire(
            &self.allocator,
            EngineTag::ConnectionSecrets.tag(),
            TOKEN_LEN,
        ) {
            Ok(region) => region,
            Err(e) => {
                self.process.deregister(id, self.id);
                self.stats.alloc_failures += 1;
                return Err(e.into());
            }
        };

        self.open(Connection::initiate(id, now, secrets), now);
        self.schedule_flush(id);
        debug!(unit = %self.id, connection = %id, "connection initiated");
        Ok(())
    }

    /// Queues application data. It is sent once the handshake completes.
    pub fn send(&mut self, id: ConnectionId, data: impl Into<Bytes>) -> Result<(), EngineError> {
        let max_payload = self
            .process
            .config()
            .max_datagram_size
            .saturating_sub(HEADER_LEN)
            .max(1);
        let conn = self.open_connection(id)?;
        conn.queue_data(data.into(), max_payload);
        self.schedule_flush(id);
        Ok(())
    }

    /// Queues a keep-alive probe.
    pub fn ping(&mut self, id: ConnectionId) -> Result<(), EngineError> {
        self.open_connection(id)?.queue_ping();
        self.schedule_flush(id);
        Ok(())
    }

    /// Next payload delivered on `id`, in order of arrival.
    pub fn recv(&mut self, id: ConnectionId) -> Option<Bytes> {
        self.connections.get_mut(&id)?.recv()
    }

    /// Closes `id`; the peer is notified on the next `process` call.
    pub fn close(&mut self, id: ConnectionId) -> Result<(), EngineError> {
        self.open_connection(id)?.close(CloseCode::Application);
        self.schedule_flush(id);
        Ok(())
    }

    /// Closes every connection, telling peers the unit is shutting down.
    pub fn close_all(&mut self) {
        let mut ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.close(CloseCode::Shutdown);
            }
            self.schedule_flush(id);
        }
    }

    fn open_connection(&mut self, id: ConnectionId) -> Result<&mut Connection, EngineError> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(EngineError::UnknownConnection(id))?;
        if conn.is_closing() {
            return Err(EngineError::ConnectionClosing(id));
        }
        Ok(conn)
    }

    /// Copies `data` into a fresh inbound region from the unit's allocator.
    pub fn inbound_region(&self, data: &[u8]) -> Result<Region, AllocError> {
        let mut region = acquire_region(&self.allocator, OPAQUE, data.len())?;
        if region.try_extend(data).is_err() {
            release_region(&self.allocator, region);
            return Err(AllocError::Exhausted {
                tag: OPAQUE,
                size: data.len(),
            });
        }
        Ok(region)
    }

    /// Hands a region the engine returned back to the unit's allocator.
    pub fn release(&self, region: Region) {
        release_region(&self.allocator, region);
    }

    /// Finalises every connection, returns all regions and detaches from
    /// the process context.
    pub fn destroy(mut self) -> UnitStats {
        self.shutdown();
        self.stats
    }

    fn shutdown(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.finalize(id, CloseCode::Shutdown);
        }
        for backlog in self.backlog.drain(..) {
            release_region(&self.allocator, backlog.region);
        }
        self.ready.clear();
        self.deadlines = DeadlineQueue::new();
        self.maintenance_armed = false;
        self.pool.trim(&self.allocator);
        self.process.detach_unit(self.id);
        info!(unit = %self.id, stats = ?self.stats, "execution unit destroyed");
    }
}

impl<A: Allocator> Drop for UnitContext<A> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<A: Allocator> fmt::Debug for UnitContext<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitContext")
            .field("id", &self.id)
            .field("connections", &self.connections.len())
            .field("deadlines", &self.deadlines.len())
            .field("backlog_bytes", &self.backlog_bytes())
            .finish_non_exhaustive()
    }
}
