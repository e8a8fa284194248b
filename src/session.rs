//! Session position tracker: the replication position a session must
//! observe before its reads are trusted.
//!
//! Grounded in pgdog's `backend::pool::lsn_monitor` (polls and compares an
//! LSN against a target, backed by a cache of last-known-reached positions)
//! narrowed to a single-slot `waitFor`/`waitForAll` contract.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use thiserror::Error;

use crate::{
    cache::SrvCache,
    domain::DbDomain,
    driver::{DriverError, Position},
    pool::{ConnectionPool, Error as PoolError, PoolClass},
    server_registry::ServerRegistry,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not obtain a primary position when none was supplied")]
    ReplicationWait,

    #[error("{0}")]
    Pool(#[from] PoolError),

    #[error("{0}")]
    Driver(#[from] DriverError),
}

/// One-shot loader for the replication position a session must see,
/// modeled as an optional function plus an "already fired" flag rather than
/// a generator or stream.
pub type ChronologyCallback = Arc<dyn Fn() -> Option<Position> + Send + Sync>;

/// Holds the single comparable `wait-for-pos` value for a session, plus the
/// wall-clock time it was last set or loaded -- the reader selector's lag
/// tiering (spec §4.3 step 2) needs that timestamp to compute a horizon
/// relative to "now", not just the position itself.
pub struct SessionPositionTracker {
    pos: Mutex<Option<Position>>,
    pos_set_at: Mutex<Option<Instant>>,
    chronology: Option<ChronologyCallback>,
    chronology_fired: Mutex<bool>,
    cache: Arc<dyn SrvCache>,
}

impl SessionPositionTracker {
    pub fn new(cache: Arc<dyn SrvCache>) -> Self {
        Self {
            pos: Mutex::new(None),
            pos_set_at: Mutex::new(None),
            chronology: None,
            chronology_fired: Mutex::new(false),
            cache,
        }
    }

    pub fn with_chronology_callback(mut self, callback: ChronologyCallback) -> Self {
        self.chronology = Some(callback);
        self
    }

    /// Lazily load the pending wait-for-position via the chronology
    /// callback. Fires at most once per session.
    pub fn load_pending(&self) {
        let mut fired = self.chronology_fired.lock();
        if *fired {
            return;
        }
        *fired = true;
        if let Some(callback) = &self.chronology {
            if let Some(pos) = callback() {
                let mut current = self.pos.lock();
                *current = Some(current.map_or(pos, |existing| existing.max(pos)));
                *self.pos_set_at.lock() = Some(Instant::now());
            }
        }
    }

    pub fn current(&self) -> Option<Position> {
        *self.pos.lock()
    }

    /// The wall-clock instant the current `wait-for-pos` was last set or
    /// loaded, if one is pending. `None` whenever `current()` is `None`.
    pub fn current_timestamp(&self) -> Option<Instant> {
        *self.pos_set_at.lock()
    }

    /// `waitFor(pos)`: replaces the current value, but restores the higher
    /// of the two on exit (lag protection never regresses the bound the
    /// session already committed to).
    pub fn set(&self, pos: Position) {
        let mut current = self.pos.lock();
        *current = Some(current.map_or(pos, |existing| existing.max(pos)));
        *self.pos_set_at.lock() = Some(Instant::now());
    }

    /// Clears the position. Only an explicit replacement clears it; reads
    /// of `current()` alone never do.
    pub fn clear(&self) {
        *self.pos.lock() = None;
        *self.pos_set_at.lock() = None;
    }

    /// Low-level wait: `awaitSessionPrimaryPos`.
    ///
    /// - the writer always trivially satisfies the wait.
    /// - a process-local cache of "known reached position" per server
    ///   short-circuits repeat waits within its TTL.
    /// - otherwise acquire any open handle on the index (or open and close
    ///   a silent one), and call the driver's `primaryPosWait`; `None` and a
    ///   driver-reported `-1` both count as failure.
    /// - on success, persist the reached position with a one-day TTL.
    pub async fn await_session_primary_pos(
        &self,
        registry: &ServerRegistry,
        pool: &ConnectionPool,
        domain: &DbDomain,
        server_index: usize,
        pos: Position,
        timeout: Duration,
    ) -> Result<bool, Error> {
        if server_index == registry.writer_index() {
            return Ok(true);
        }

        let server_name = &registry.get(server_index).ok_or(PoolError::NoSuchServer(server_index))?.name;
        let cache_key = format!("reached_pos:{server_name}");

        if let Some(cached) = self.cache.get(&cache_key) {
            if let Ok(reached) = cached.parse::<u64>() {
                if Position(reached) >= pos {
                    return Ok(true);
                }
            }
        }

        let mut handle = pool
            .reuse_or_open(registry, server_index, domain, PoolClass::Autocommit, false, None)
            .await?;

        let result = handle.conn_mut().primary_pos_wait(pos, timeout).await;
        let reached = match result {
            Ok(Some(reached)) if reached.0 != u64::MAX => Some(reached),
            _ => None,
        };

        pool.checkin(handle);

        match reached {
            Some(reached) => {
                self.cache
                    .put(&cache_key, reached.0.to_string(), Duration::from_secs(24 * 3600));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// `waitForAll(pos, timeout)`: iterates every streaming replica index
    /// that carries load in any group, waiting in sequence and honouring a
    /// shared time budget.
    pub async fn wait_for_all(
        &self,
        registry: &ServerRegistry,
        pool: &ConnectionPool,
        domain: &DbDomain,
        pos: Position,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.set(pos);

        let start = tokio::time::Instant::now();
        for server in registry.replicas() {
            if server.weight <= 0.0 && server.group_weights.values().all(|w| *w <= 0.0) {
                continue;
            }
            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                break;
            }
            self.await_session_primary_pos(registry, pool, domain, server.index, pos, remaining)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::InMemorySrvCache;
    use crate::driver::ConnectionFactory;
    use crate::server_registry::{ServerDescriptor, ServerRegistry};
    use crate::test_support::FakeConnectionFactory;

    fn registry() -> ServerRegistry {
        ServerRegistry::new(
            ServerDescriptor::writer("writer"),
            vec![ServerDescriptor::replica(1, "replica-a", 10.0)],
        )
    }

    fn domain() -> DbDomain {
        DbDomain::new(Some("pgdog".into()), None, "pub")
    }

    #[tokio::test]
    async fn test_writer_wait_is_trivially_satisfied() {
        let tracker = SessionPositionTracker::new(Arc::new(InMemorySrvCache::new()));
        let factory: Arc<dyn ConnectionFactory> = Arc::new(FakeConnectionFactory::new());
        let pool = ConnectionPool::new(factory, Arc::new(std::sync::atomic::AtomicU64::new(0)));
        let registry = registry();

        let reached = tracker
            .await_session_primary_pos(&registry, &pool, &domain(), 0, Position(5), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(reached);
    }

    #[tokio::test]
    async fn test_cached_reached_position_short_circuits() {
        let cache = Arc::new(InMemorySrvCache::new());
        cache.put("reached_pos:replica-a", "100".into(), Duration::from_secs(60));
        let tracker = SessionPositionTracker::new(cache);
        let factory: Arc<dyn ConnectionFactory> = Arc::new(FakeConnectionFactory::new());
        let pool = ConnectionPool::new(factory, Arc::new(std::sync::atomic::AtomicU64::new(0)));
        let registry = registry();

        let reached = tracker
            .await_session_primary_pos(&registry, &pool, &domain(), 1, Position(50), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(reached);
    }

    #[test]
    fn test_set_restores_higher_of_two() {
        let tracker = SessionPositionTracker::new(Arc::new(InMemorySrvCache::new()));
        tracker.set(Position(10));
        tracker.set(Position(5));
        assert_eq!(tracker.current(), Some(Position(10)));
    }

    #[test]
    fn test_set_stamps_and_clear_unstamps_timestamp() {
        let tracker = SessionPositionTracker::new(Arc::new(InMemorySrvCache::new()));
        assert!(tracker.current_timestamp().is_none());

        tracker.set(Position(10));
        assert!(tracker.current_timestamp().is_some());

        tracker.clear();
        assert!(tracker.current().is_none());
        assert!(tracker.current_timestamp().is_none());
    }

    #[test]
    fn test_chronology_fires_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let tracker = SessionPositionTracker::new(Arc::new(InMemorySrvCache::new())).with_chronology_callback(
            Arc::new(move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Some(Position(7))
            }),
        );

        tracker.load_pending();
        tracker.load_pending();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.current(), Some(Position(7)));
    }
}
