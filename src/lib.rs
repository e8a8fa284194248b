//! Database load balancer and transaction round coordinator for a cluster
//! composed of one primary (writable) server and zero or more replica
//! (read-only) servers. See `README.md` for usage and `DESIGN.md` for how
//! each module maps to pgdog's own building blocks.
//!
//! Grounded throughout in pgdog's `backend::pool::cluster::Cluster` (the
//! single object application code asks for a connection from, which owns
//! the registry of servers, the pool, and the reader-selection strategy)
//! narrowed to the two-phase commit / transaction-round discipline this
//! crate adds on top.

pub mod cache;
pub mod config;
pub mod domain;
pub mod driver;
pub mod error;
pub mod events;
pub mod load_monitor;
pub mod pool;
pub mod read_only;
pub mod reader;
pub mod round;
pub mod server_registry;
pub mod session;

#[cfg(any(test, feature = "test-util"))]
pub mod test_support;

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::{
    cache::{InMemorySrvCache, InMemoryWanCache, SrvCache, WanCache},
    domain::{DbDomain, DomainInput, DomainResolver},
    driver::ConnectionFactory,
    error::Error,
    events::{EventListener, NullEventListener, PoolEvent},
    load_monitor::{LoadMonitor, NullLoadMonitor},
    pool::{ConnectionPool, HandleRef, PoolClass},
    read_only::ReadOnlyProbe,
    reader::ReaderSelector,
    round::{RoundCoordinator, Stage},
    server_registry::ServerRegistry,
    session::SessionPositionTracker,
};

pub use config::Config;

/// `getConnection`'s first argument: either an explicit server index or one
/// of the two sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerSelector {
    Primary,
    Replica,
    Index(usize),
}

/// `getConnection`'s flags bitfield, modeled as a struct of named booleans
/// rather than a hand-rolled bitmask -- nothing in this crate's dependency
/// stack pulls in a bitflags crate, and these flags are never serialised
/// over the wire, so a plain struct is the idiomatic fit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionFlags {
    pub autocommit: bool,
    pub silence_errors: bool,
    pub intent_writable: bool,
    pub refresh_read_only: bool,
}

/// The balancer itself. Request-scoped: construct one per logical
/// request/script -- a single-threaded cooperative core, with no internal
/// locking across suspension points beyond what guards purely synchronous
/// bookkeeping.
pub struct Balancer {
    registry: RwLock<ServerRegistry>,
    domains: DomainResolver,
    pool: ConnectionPool,
    reader: ReaderSelector,
    session: SessionPositionTracker,
    round: Mutex<RoundCoordinator>,
    read_only: ReadOnlyProbe,
    load_monitor: Arc<dyn LoadMonitor>,
    modcount: Arc<AtomicU64>,
    disabled: AtomicBool,
    events: Arc<dyn EventListener>,
    default_group: String,
    cluster_max_lag: f64,
    wait_timeout: Duration,
}

impl Balancer {
    pub fn new(
        registry: ServerRegistry,
        local_domain: DbDomain,
        factory: Arc<dyn ConnectionFactory>,
        config: &Config,
    ) -> Self {
        Self::with_events(registry, local_domain, factory, config, Arc::new(NullEventListener))
    }

    pub fn with_events(
        registry: ServerRegistry,
        local_domain: DbDomain,
        factory: Arc<dyn ConnectionFactory>,
        config: &Config,
        events: Arc<dyn EventListener>,
    ) -> Self {
        let modcount = Arc::new(AtomicU64::new(0));
        let round = match &config.round_stage {
            Some(resume) => RoundCoordinator::resume(Stage::from(resume.stage), resume.round_id.clone()),
            None => RoundCoordinator::new(),
        };

        Self {
            registry: RwLock::new(registry),
            domains: DomainResolver::new(local_domain),
            pool: ConnectionPool::new(factory, modcount.clone()).with_events(events.clone()),
            reader: ReaderSelector::new().with_events(events.clone()),
            session: SessionPositionTracker::new(Arc::new(InMemorySrvCache::new()) as Arc<dyn SrvCache>),
            round: Mutex::new(round),
            read_only: ReadOnlyProbe::new(
                Arc::new(InMemorySrvCache::new()) as Arc<dyn SrvCache>,
                Arc::new(InMemoryWanCache::new()) as Arc<dyn WanCache>,
            )
            .with_forced_reason(config.read_only_reason.clone()),
            load_monitor: Arc::new(NullLoadMonitor),
            modcount,
            disabled: AtomicBool::new(false),
            events,
            default_group: config.default_group.clone(),
            cluster_max_lag: config.max_lag,
            wait_timeout: Duration::from_secs_f64(config.wait_timeout),
        }
    }

    pub fn with_load_monitor(mut self, monitor: Arc<dyn LoadMonitor>) -> Self {
        self.load_monitor = monitor;
        self
    }

    pub fn modcount(&self) -> u64 {
        self.modcount.load(Ordering::Acquire)
    }

    pub fn round_stage(&self) -> Stage {
        self.round.lock().stage()
    }

    pub fn lagged_replica_mode(&self) -> bool {
        self.reader.lagged_replica_mode()
    }

    /// `getReadOnlyReason()`: non-`None` when the `readOnlyReason` config
    /// forces it, or when lagged-replica mode has forced reads stale
    /// (S2's "until replication lag decreases").
    pub fn read_only_reason(&self) -> Option<String> {
        if let Some(reason) = self.read_only.forced_reason() {
            return Some(reason.to_string());
        }
        if self.lagged_replica_mode() {
            return Some("until replication lag decreases".to_string());
        }
        None
    }

    /// `getConnection(server_index_or_sentinel, groups, domain, flags)`.
    pub async fn get_connection(
        &self,
        selector: ServerSelector,
        groups: &[String],
        domain: DomainInput,
        mut flags: ConnectionFlags,
    ) -> Result<HandleRef, Error> {
        if self.disabled.load(Ordering::Acquire) {
            return Err(Error::AccessDenied);
        }

        reader::check_explicit_server_with_group(
            match selector {
                ServerSelector::Index(i) => Some(i),
                _ => None,
            },
            groups,
            &self.default_group,
        )
        .map_err(Error::Config)?;

        let domain = self.domains.resolve(domain).map_err(Error::Config)?;
        let registry = self.registry.read();

        let server_index = match selector {
            ServerSelector::Index(i) => i,
            ServerSelector::Primary => registry.writer_index(),
            ServerSelector::Replica => self.pick_reader(&registry, groups, &domain, flags.silence_errors).await?,
        };

        let server = registry
            .get(server_index)
            .ok_or(pool::Error::NoSuchServer(server_index))
            .map_err(Error::Pool)?;

        if flags.autocommit && server.is_writer() && flags.refresh_read_only {
            let _ = self.read_only.is_primary_running_read_only(&registry, &self.pool, &domain).await;
        }

        // Flag sanitisation: AUTOCOMMIT is cleared when the
        // primary driver declares database-level locking, or when
        // temp-tables-only mode is active for the domain (snapshot
        // staleness is impossible by construction). Checked against an
        // already-open handle for this server, if one exists, so the
        // sanitised flag and the pool class it drives agree before a handle
        // is opened or reused.
        if flags.autocommit {
            if let Some((database_level_locking, temp_tables_only)) = self.pool.capability_hint(server_index) {
                if database_level_locking || temp_tables_only {
                    flags.autocommit = false;
                }
            }
        }

        let class = if flags.autocommit { PoolClass::Autocommit } else { PoolClass::Round };

        let round_active = self.round.lock().is_active();
        let round_id = self.round.lock().round_id().map(|s| s.to_string());
        let handle = self
            .pool
            .reuse_or_open(&registry, server_index, &domain, class, round_active, round_id.as_deref())
            .await
            .map_err(Error::Pool)?;

        let handle_ref = HandleRef::new(&handle, self.modcount());
        self.pool.checkin(handle);
        Ok(handle_ref)
    }

    async fn pick_reader(
        &self,
        registry: &ServerRegistry,
        groups: &[String],
        domain: &DbDomain,
        silence_errors: bool,
    ) -> Result<usize, Error> {
        self.session.load_pending();

        let chosen = self
            .reader
            .pick_reader_index(
                groups,
                &self.default_group,
                registry,
                self.load_monitor.as_ref(),
                &self.pool,
                domain,
                self.cluster_max_lag,
                self.session.current_timestamp(),
            )
            .await;

        let index = match chosen {
            Ok(index) => index,
            Err(e) => {
                if silence_errors {
                    return Ok(registry.writer_index());
                }
                return Err(Error::Reader(e));
            }
        };

        if let Some(pos) = self.session.current() {
            let caught_up = self
                .session
                .await_session_primary_pos(registry, &self.pool, domain, index, pos, self.wait_timeout)
                .await
                .unwrap_or(false);
            if !caught_up {
                warn!(server_index = index, "replica did not catch up to wait-for-pos in time, entering lagged-replica mode");
            }
        }

        Ok(index)
    }

    /// Take the round coordinator out from behind its mutex for the
    /// duration of an async mutation: the lock guards only synchronous
    /// bookkeeping and must never be held across an `.await`. Restored by
    /// [`Balancer::restore_round`] once the async body completes, success or
    /// error alike.
    fn take_round(&self) -> RoundCoordinator {
        std::mem::take(&mut *self.round.lock())
    }

    fn restore_round(&self, round: RoundCoordinator) {
        *self.round.lock() = round;
    }

    /// `beginPrimaryChanges`.
    pub async fn begin_primary_changes(&self, round_id: impl Into<String>) -> Result<(), Error> {
        let writer_index = self.registry.read().writer_index();
        let mut handles = self.pool.writer_round_handles(writer_index);

        let mut round = self.take_round();
        let outcome = round.begin(round_id, &mut handles).await;
        self.restore_round(round);

        self.pool.return_writer_round_handles(writer_index, handles);
        outcome.map_err(Error::Round)
    }

    /// `finalizePrimaryChanges` (pre-commit fixpoint).
    pub async fn finalize_primary_changes(&self) -> Result<(), Error> {
        let writer_index = self.registry.read().writer_index();
        let mut handles = self.pool.writer_round_handles(writer_index);

        let mut round = self.take_round();
        let outcome = round.finalize(&mut handles).await;
        self.restore_round(round);

        self.pool.return_writer_round_handles(writer_index, handles);
        outcome.map_err(Error::Round)
    }

    /// `approvePrimaryChanges(maxWriteDuration)`.
    pub async fn approve_primary_changes(&self, max_write_duration: Option<Duration>) -> Result<(), Error> {
        let writer_index = self.registry.read().writer_index();
        let mut handles = self.pool.writer_round_handles(writer_index);

        let mut round = self.take_round();
        let outcome = round.approve(&mut handles, max_write_duration).await;
        self.restore_round(round);

        self.pool.return_writer_round_handles(writer_index, handles);
        outcome.map_err(Error::Round)
    }

    /// `commitPrimaryChanges`.
    pub async fn commit_primary_changes(&self) -> Result<(), Error> {
        let writer_index = self.registry.read().writer_index();
        let mut handles = self.pool.writer_round_handles(writer_index);

        let mut round = self.take_round();
        let round_id = round.round_id().unwrap_or_default().to_string();
        let outcome = round.commit(&mut handles).await;
        self.restore_round(round);

        self.pool.return_writer_round_handles(writer_index, handles);
        if outcome.is_ok() {
            self.events.on_event(PoolEvent::RoundCommitted { round_id });
        }
        outcome.map_err(Error::Round)
    }

    /// `rollbackPrimaryChanges`. Callable from any stage, including `Error`.
    pub async fn rollback_primary_changes(&self) -> Result<(), Error> {
        let writer_index = self.registry.read().writer_index();
        let mut handles = self.pool.writer_round_handles(writer_index);

        let mut round = self.take_round();
        let round_id = round.round_id().unwrap_or_default().to_string();
        let outcome = round.rollback(&mut handles).await;
        self.restore_round(round);

        self.pool.return_writer_round_handles(writer_index, handles);
        if outcome.is_ok() {
            self.events.on_event(PoolEvent::RoundRolledBack { round_id });
        }
        outcome.map_err(Error::Round)
    }

    /// `runIdleCallbacks` (post-commit/rollback callback draining).
    pub async fn run_idle_callbacks(&self) -> Result<(), Error> {
        let writer_index = self.registry.read().writer_index();
        let mut handles = self.pool.writer_round_handles(writer_index);

        let mut round = self.take_round();
        let outcome = round.run_idle_callbacks(&mut handles).await;
        self.restore_round(round);

        self.pool.return_writer_round_handles(writer_index, handles);
        outcome.map_err(Error::Round)
    }

    /// `reconfigure(new servers)`: compares the two server lists by display
    /// name. If no server was removed, returns without effect. Otherwise
    /// rebuilds the registry, resets reader memoisation and pools, and
    /// bumps the modification counter so stale handle references
    /// re-resolve on next use.
    pub fn reconfigure(&self, new_servers: ServerRegistry) {
        let mut current = self.registry.write();
        if !current.removed_any(&new_servers) {
            return;
        }

        *current = new_servers;
        self.reader.reset();
        self.pool.close_all();
        self.modcount.fetch_add(1, Ordering::AcqRel);
        info!(
            modcount = self.modcount.load(Ordering::Acquire),
            "reconfigured: server removed, pools and reader memoisation reset"
        );
    }

    /// `closeConnection`: explicitly closes a single handle rather than
    /// waiting for `closeAll`. Locates the handle in whichever pool
    /// contains it and drops the driver connection; a reference for a
    /// handle already closed (or absent from both pools) is logged as
    /// orphaned and closed anyway, per §4.2.
    pub fn close_connection(&self, handle_ref: &HandleRef) {
        self.pool.close(handle_ref.server_index, handle_ref.class, handle_ref.handle_id);
    }

    /// `disable()`: subsequent opens fail unconditionally. Idempotent.
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
    }

    /// `closeAll`: idempotent; calling it twice in a row is a no-op.
    pub fn close_all(&self) {
        self.pool.close_all();
        self.reader.reset();
    }

    /// `shutdown()`: disable plus close every pooled handle. Idempotent.
    pub fn shutdown(&self) {
        self.disable();
        self.close_all();
    }
}
