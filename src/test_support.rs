//! Shared test fixtures: fakes for the external collaborators this crate
//! depends on only through a narrow trait (`Database`, `ConnectionFactory`).
//! Not part of the public API; used by unit and integration tests
//! throughout the crate.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    domain::DbDomain,
    driver::{ConnectionFactory, Database, DriverError, Position},
    load_monitor::{LagStatus, LoadMonitor},
};

pub struct FakeDatabase {
    pub domain: DbDomain,
    pub databases_independent: bool,
    pub autocommit: bool,
    pub in_transaction: bool,
    pub write_pending: bool,
    pub session_locks: bool,
    pub atomic_section_open: bool,
    pub write_duration: Duration,
    pub post_commit_suppressed: bool,
    pub precommit_queue: usize,
    pub idle_queue: usize,
    pub fail_ping: bool,
    pub fail_commit: bool,
    pub reached_position: Option<Position>,
    pub read_only: bool,
}

impl Default for FakeDatabase {
    fn default() -> Self {
        Self {
            domain: DbDomain::new(Some("pgdog".into()), None, "pub"),
            databases_independent: false,
            autocommit: true,
            in_transaction: false,
            write_pending: false,
            session_locks: false,
            atomic_section_open: false,
            write_duration: Duration::from_secs(0),
            post_commit_suppressed: false,
            precommit_queue: 0,
            idle_queue: 0,
            fail_ping: false,
            fail_commit: false,
            reached_position: None,
            read_only: false,
        }
    }
}

#[async_trait]
impl Database for FakeDatabase {
    fn current_domain(&self) -> &DbDomain {
        &self.domain
    }

    async fn switch_domain(&mut self, domain: &DbDomain) -> Result<(), DriverError> {
        self.domain = domain.clone();
        Ok(())
    }

    fn databases_are_independent(&self) -> bool {
        self.databases_independent
    }

    fn database_level_locking(&self) -> bool {
        false
    }

    fn temp_tables_only(&self) -> bool {
        false
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn write_pending(&self) -> bool {
        self.write_pending
    }

    fn session_locks_held(&self) -> bool {
        self.session_locks
    }

    fn atomic_section_open(&self) -> bool {
        self.atomic_section_open
    }

    fn estimate_write_duration(&self) -> Duration {
        self.write_duration
    }

    async fn flush_snapshot(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), DriverError> {
        if self.fail_ping {
            Err(DriverError::Ping("simulated".into()))
        } else {
            Ok(())
        }
    }

    async fn commit(&mut self, _flush_all_peers: bool) -> Result<(), DriverError> {
        if self.fail_commit {
            Err(DriverError::Query("simulated commit failure".into()))
        } else {
            self.in_transaction = false;
            Ok(())
        }
    }

    async fn rollback(&mut self, _flush_all_peers: bool) -> Result<(), DriverError> {
        self.in_transaction = false;
        Ok(())
    }

    async fn run_precommit_callbacks(&mut self) -> Result<usize, DriverError> {
        let ran = self.precommit_queue;
        self.precommit_queue = 0;
        Ok(ran)
    }

    async fn run_idle_callbacks(&mut self) -> Result<usize, DriverError> {
        let ran = self.idle_queue;
        self.idle_queue = 0;
        Ok(ran)
    }

    async fn run_transaction_listener_callbacks(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn set_post_commit_callbacks_suppressed(&mut self, suppressed: bool) {
        self.post_commit_suppressed = suppressed;
    }

    fn post_commit_callbacks_suppressed(&self) -> bool {
        self.post_commit_suppressed
    }

    async fn primary_pos_wait(
        &mut self,
        _pos: Position,
        _timeout: Duration,
    ) -> Result<Option<Position>, DriverError> {
        Ok(self.reached_position)
    }

    async fn server_is_read_only(&mut self) -> Result<bool, DriverError> {
        Ok(self.read_only)
    }

    fn set_autocommit(&mut self, autocommit: bool) {
        self.autocommit = autocommit;
    }

    fn is_autocommit(&self) -> bool {
        self.autocommit
    }
}

/// A factory that opens [`FakeDatabase`]s, optionally refusing to connect
/// to specific server indices to simulate an unreachable replica.
#[derive(Default, Clone)]
pub struct FakeConnectionFactory {
    unreachable: Arc<Mutex<HashSet<usize>>>,
}

impl FakeConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_unreachable(&self, server_index: usize) {
        self.unreachable.lock().unwrap().insert(server_index);
    }

    pub fn mark_reachable(&self, server_index: usize) {
        self.unreachable.lock().unwrap().remove(&server_index);
    }
}

/// Build a writer-role round handle over a [`FakeDatabase`] configured by
/// `f`, for tests that need to control write duration, failure injection,
/// etc. before the handle is boxed behind `dyn Database`.
pub fn writer_handle_with(id: u64, f: impl FnOnce(&mut FakeDatabase)) -> crate::pool::Handle {
    let mut db = FakeDatabase::default();
    f(&mut db);
    crate::pool::Handle::new(id, 0, crate::pool::PoolClass::Round, crate::pool::Role::Writer, Box::new(db))
}

/// A load monitor with fixed, per-server lag readings, for tests that need
/// to drive the reader selector's lag-tiering logic deterministically.
/// Never rescales weights.
#[derive(Default, Clone)]
pub struct FakeLoadMonitor {
    lag: Arc<Mutex<HashMap<usize, LagStatus>>>,
}

impl FakeLoadMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_lag(&self, server_index: usize, lag: LagStatus) {
        self.lag.lock().unwrap().insert(server_index, lag);
    }
}

impl LoadMonitor for FakeLoadMonitor {
    fn rescale(&self, _weights: &mut HashMap<usize, f64>) {}

    fn lag_times(&self, indices: &[usize]) -> HashMap<usize, LagStatus> {
        let lag = self.lag.lock().unwrap();
        indices
            .iter()
            .map(|i| (*i, lag.get(i).copied().unwrap_or(LagStatus::Seconds(0.0))))
            .collect()
    }
}

#[async_trait]
impl ConnectionFactory for FakeConnectionFactory {
    async fn connect(&self, server_index: usize, domain: &DbDomain) -> Result<Box<dyn Database>, DriverError> {
        if self.unreachable.lock().unwrap().contains(&server_index) {
            return Err(DriverError::Connect(format!("server {server_index} is down")));
        }
        Ok(Box::new(FakeDatabase {
            domain: domain.clone(),
            ..Default::default()
        }))
    }
}
