//! The driver layer is an external collaborator: it executes SQL, manages a
//! single connection's transaction state, and runs per-connection callbacks.
//! We depend on it only through the narrow [`Database`] capability, the way
//! pgdog's pool depends on `backend::Server` through a handful of accessor
//! methods rather than owning the protocol codec itself.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::DbDomain;

/// An opaque, comparable replication position. The balancer never
/// interprets the value, only compares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position(pub u64);

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver connect failed: {0}")]
    Connect(String),

    #[error("driver query failed: {0}")]
    Query(String),

    #[error("driver ping failed: {0}")]
    Ping(String),

    #[error("driver reports a dropped connection")]
    Dropped,
}

/// A single live connection to a server, as seen by the load balancer.
///
/// Implementations own the wire protocol and per-connection transaction
/// state; the balancer only ever calls through this trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Currently bound domain.
    fn current_domain(&self) -> &DbDomain;

    /// Switch the connection's bound domain. Must be a no-op if the target
    /// domain matches the current one.
    async fn switch_domain(&mut self, domain: &DbDomain) -> Result<(), DriverError>;

    /// `true` if databases on this server are independent -- a dbname
    /// change forces a reconnect rather than an in-place `USE`/`SET`.
    fn databases_are_independent(&self) -> bool;

    /// `true` if this server enforces database-level locking that makes
    /// concurrent autocommit writes unsafe (used for flag sanitisation).
    fn database_level_locking(&self) -> bool;

    /// `true` if only temp tables are in play for the current domain, so an
    /// autocommit snapshot can never go stale.
    fn temp_tables_only(&self) -> bool;

    fn in_transaction(&self) -> bool;
    fn write_pending(&self) -> bool;
    fn session_locks_held(&self) -> bool;
    fn atomic_section_open(&self) -> bool;

    /// Estimate of how long pending writes will take to commit, used by
    /// `approve` against `maxWriteDuration`.
    fn estimate_write_duration(&self) -> Duration;

    async fn flush_snapshot(&mut self) -> Result<(), DriverError>;
    async fn ping(&mut self) -> Result<(), DriverError>;
    async fn commit(&mut self, flush_all_peers: bool) -> Result<(), DriverError>;
    async fn rollback(&mut self, flush_all_peers: bool) -> Result<(), DriverError>;

    /// Run pre-commit callbacks queued on this connection. Returns the
    /// number executed, so the fixpoint loop in `finalize` can detect when
    /// no new callbacks were added.
    async fn run_precommit_callbacks(&mut self) -> Result<usize, DriverError>;

    /// Run post-commit/rollback ("idle") callbacks queued on this
    /// connection. Returns the number executed.
    async fn run_idle_callbacks(&mut self) -> Result<usize, DriverError>;

    /// Run long-lived, name-registered transaction-listener callbacks.
    async fn run_transaction_listener_callbacks(&mut self) -> Result<(), DriverError>;

    fn set_post_commit_callbacks_suppressed(&mut self, suppressed: bool);
    fn post_commit_callbacks_suppressed(&self) -> bool;

    /// Wait for this server to observe `pos`, or time out. `Ok(None)` and a
    /// driver-reported `-1` both mean "failed to reach position".
    async fn primary_pos_wait(
        &mut self,
        pos: Position,
        timeout: Duration,
    ) -> Result<Option<Position>, DriverError>;

    async fn server_is_read_only(&mut self) -> Result<bool, DriverError>;

    fn set_autocommit(&mut self, autocommit: bool);
    fn is_autocommit(&self) -> bool;
}

/// Produces new driver instances. An external collaborator, referenced only
/// through this capability.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(
        &self,
        server_index: usize,
        domain: &DbDomain,
    ) -> Result<Box<dyn Database>, DriverError>;
}
