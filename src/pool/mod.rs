//! Connection pooling segregated by transaction-round participation.
//! Grounded in pgdog's `backend::pool::pool_impl` (checkout/checkin against
//! a `parking_lot::Mutex<Inner>`) and `backend::pool::replicas` (per-server
//! handle accounting), narrowed to a two-class split instead of pgdog's
//! full sharded/mirrored pool hierarchy.

mod error;
mod handle;

pub use error::Error;
pub use handle::{Handle, HandleRef, Role};

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tracing::warn;

use crate::{
    domain::DbDomain,
    driver::ConnectionFactory,
    events::{EventListener, NullEventListener, PoolEvent},
    server_registry::ServerRegistry,
};

/// Which round a handle participates in. Segregation is mandatory: an
/// autocommit handle never participates in a round, even if the same
/// server is otherwise pool-round active. This exists so a short
/// out-of-band commit (a counter increment, say) can't corrupt the
/// read-your-writes snapshot or transaction size budget of the main round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolClass {
    Round,
    Autocommit,
}

type ClassMap = Mutex<HashMap<usize, Vec<Handle>>>;

/// Two disjoint pools keyed by participation class, each a mapping from
/// server index to an unordered list of live handles.
pub struct ConnectionPool {
    round: ClassMap,
    autocommit: ClassMap,
    factory: Arc<dyn ConnectionFactory>,
    modcount: Arc<AtomicU64>,
    next_id: AtomicU64,
    events: Arc<dyn EventListener>,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn ConnectionFactory>, modcount: Arc<AtomicU64>) -> Self {
        Self {
            round: Mutex::new(HashMap::new()),
            autocommit: Mutex::new(HashMap::new()),
            factory,
            modcount,
            next_id: AtomicU64::new(0),
            events: Arc::new(NullEventListener),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventListener>) -> Self {
        self.events = events;
        self
    }

    fn class_map(&self, class: PoolClass) -> &ClassMap {
        match class {
            PoolClass::Round => &self.round,
            PoolClass::Autocommit => &self.autocommit,
        }
    }

    /// `reuseOrOpenForNewRef`: select a reusable handle whose pool class
    /// matches and whose driver permits switching to the target domain,
    /// otherwise open a new one.
    pub async fn reuse_or_open(
        &self,
        registry: &ServerRegistry,
        server_index: usize,
        domain: &DbDomain,
        class: PoolClass,
        round_active: bool,
        round_id: Option<&str>,
    ) -> Result<Handle, Error> {
        let server = registry.get(server_index).ok_or(Error::NoSuchServer(server_index))?;

        let reused = {
            let mut map = self.class_map(class).lock();
            let list = map.entry(server_index).or_default();
            let position = list.iter().position(|h| h.shareable_for(domain));
            position.map(|i| list.remove(i))
        };

        let mut handle = if let Some(mut handle) = reused {
            handle.switch_domain(domain).await?;
            handle
        } else {
            let conn = self
                .factory
                .connect(server_index, domain)
                .await
                .map_err(Error::Connect)?;
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let role = if server.is_writer() {
                Role::Writer
            } else if server.is_static {
                Role::Static
            } else {
                Role::Replica
            };
            self.events.on_event(PoolEvent::HandleOpened {
                server_index,
                class,
            });
            Handle::new(id, server_index, class, role, conn)
        };

        if class == PoolClass::Round && server.is_writer() && round_active {
            handle.apply_round_flags(round_id);
        }

        Ok(handle)
    }

    /// Return a handle to its pool once the caller is done with it, unless
    /// it still holds a round id (callers finish the round first).
    pub fn checkin(&self, handle: Handle) {
        let server_index = handle.server_index();
        let class = handle.class();
        self.class_map(class).lock().entry(server_index).or_default().push(handle);
    }

    /// `closeConnection`: locate the handle in whichever pool contains it,
    /// remove it, and drop the driver connection. A handle absent from
    /// both pools is orphaned; log and close anyway.
    pub fn close(&self, server_index: usize, class: PoolClass, handle_id: u64) {
        let mut map = self.class_map(class).lock();
        if let Some(list) = map.get_mut(&server_index) {
            if let Some(pos) = list.iter().position(|h| h.id() == handle_id) {
                let handle = list.remove(pos);
                self.events.on_event(PoolEvent::HandleClosed {
                    server_index,
                    class,
                });
                drop(handle);
                return;
            }
        }
        warn!(
            server_index,
            handle_id, "closing orphaned handle absent from both pools"
        );
    }

    /// Peek at an already-open handle for `server_index`, in whichever class
    /// holds one, to read its driver-reported sanitisation flags without
    /// removing it from its pool. Used to sanitise `AUTOCOMMIT` before the
    /// pool class for a handle is decided, so the class decision and the
    /// flags agree by the time a handle is actually opened. A server with no
    /// open handle yet reports `None`: the very first connection to it is
    /// not sanitised, every one after it is.
    pub fn capability_hint(&self, server_index: usize) -> Option<(bool, bool)> {
        for class in [PoolClass::Round, PoolClass::Autocommit] {
            let map = self.class_map(class).lock();
            if let Some(handle) = map.get(&server_index).and_then(|list| list.first()) {
                return Some((handle.conn().database_level_locking(), handle.conn().temp_tables_only()));
            }
        }
        None
    }

    /// Attempt a silent (no query) connection to a server, used by the
    /// reader selector to probe reachability before committing to a reader
    /// choice. Returns the handle to the pool on success.
    pub async fn probe(&self, registry: &ServerRegistry, server_index: usize, domain: &DbDomain) -> Result<(), Error> {
        let handle = self
            .reuse_or_open(registry, server_index, domain, PoolClass::Autocommit, false, None)
            .await?;
        self.checkin(handle);
        Ok(())
    }

    /// All currently open primary-facing (writer) round handles. Used by
    /// the transaction round coordinator, which operates on every
    /// primary-facing handle acquired during the round.
    pub fn writer_round_handles(&self, writer_index: usize) -> Vec<Handle> {
        let mut map = self.round.lock();
        map.remove(&writer_index).unwrap_or_default()
    }

    pub fn return_writer_round_handles(&self, writer_index: usize, handles: Vec<Handle>) {
        let mut map = self.round.lock();
        map.entry(writer_index).or_default().extend(handles);
    }

    /// Close every handle in both pools, for every server. Idempotent.
    pub fn close_all(&self) {
        let mut round = self.round.lock();
        let mut autocommit = self.autocommit.lock();
        let closed: usize = round.values().map(|v| v.len()).sum::<usize>()
            + autocommit.values().map(|v| v.len()).sum::<usize>();
        round.clear();
        autocommit.clear();
        if closed > 0 {
            self.events.on_event(PoolEvent::AllClosed { count: closed });
        }
    }

    /// For all server indices and pool classes, a handle appears in at most
    /// one position; this is a structural invariant of the two disjoint
    /// maps, exposed here only for tests.
    #[cfg(test)]
    pub fn total_open(&self) -> usize {
        let round = self.round.lock();
        let autocommit = self.autocommit.lock();
        round.values().map(|v| v.len()).sum::<usize>()
            + autocommit.values().map(|v| v.len()).sum::<usize>()
    }

    pub fn modcount(&self) -> u64 {
        self.modcount.load(Ordering::Acquire)
    }
}
