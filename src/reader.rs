//! Reader selection under weighted load, replication-lag thresholds, and
//! session consistency requirements. Grounded in pgdog's
//! `backend::pool::replicas`/`backend::pool::lb` (candidate list, strategy
//! dispatch, ban-on-failure loop), generalised to a stickiness-plus-lag-
//! tiering algorithm instead of pgdog's random/round-robin/least-connections
//! strategies.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
    time::Instant,
};

use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;
use tracing::warn;

use crate::{
    domain::DbDomain,
    error::ConfigError,
    events::{EventListener, NullEventListener, PoolEvent},
    load_monitor::{LagStatus, LoadMonitor},
    pool::{ConnectionPool, Error as PoolError},
    server_registry::ServerRegistry,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Pool(#[from] PoolError),
}

/// Normalise a group list to a non-empty ordered list ending in the default
/// group, deduplicated while preserving first-seen order.
pub fn normalize_groups(groups: &[String], default_group: &str) -> Vec<String> {
    let mut result = Vec::new();
    for g in groups {
        if !result.contains(g) {
            result.push(g.clone());
        }
    }
    if result.last().map(|s| s.as_str()) != Some(default_group) {
        result.push(default_group.to_string());
    }
    result
}

/// Selects, per query group, a replica index that is reachable and within
/// lag tolerance; memoises its choice per group for the session.
pub struct ReaderSelector {
    /// Sticky reader choice per group, for the lifetime of the session.
    sticky: Mutex<HashMap<String, usize>>,
    /// Session-wide flag: once true, remains true until `close_all`.
    lagged_replica_mode: AtomicBool,
    events: std::sync::Arc<dyn EventListener>,
}

impl Default for ReaderSelector {
    fn default() -> Self {
        Self {
            sticky: Mutex::new(HashMap::new()),
            lagged_replica_mode: AtomicBool::new(false),
            events: std::sync::Arc::new(NullEventListener),
        }
    }
}

impl ReaderSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(mut self, events: std::sync::Arc<dyn EventListener>) -> Self {
        self.events = events;
        self
    }

    pub fn lagged_replica_mode(&self) -> bool {
        self.lagged_replica_mode.load(Ordering::Acquire)
    }

    fn set_lagged_replica_mode(&self) {
        if !self.lagged_replica_mode.swap(true, Ordering::AcqRel) {
            self.events.on_event(PoolEvent::LaggedReplicaModeEntered);
        }
    }

    /// Clears stickiness and lagged-replica mode. Called by `closeAll` and
    /// by a removing reconfiguration.
    pub fn reset(&self) {
        self.sticky.lock().clear();
        self.lagged_replica_mode.store(false, Ordering::Release);
    }

    pub fn sticky_choice(&self, group: &str) -> Option<usize> {
        self.sticky.lock().get(group).copied()
    }

    /// `pickReaderIndex`: stickiness, lag-weight rescaling, lag-tiered
    /// candidate preference, reachability probing with exclude-and-retry.
    #[allow(clippy::too_many_arguments)]
    pub async fn pick_reader_index(
        &self,
        groups: &[String],
        default_group: &str,
        registry: &ServerRegistry,
        load_monitor: &dyn LoadMonitor,
        pool: &ConnectionPool,
        domain: &DbDomain,
        cluster_max_lag: f64,
        wait_for_pos_timestamp: Option<Instant>,
    ) -> Result<usize, Error> {
        // Single-server clusters short-circuit to the writer index.
        if registry.is_single_server() {
            return Ok(registry.writer_index());
        }

        let group_list = normalize_groups(groups, default_group);
        let group = group_list.first().cloned().unwrap_or_else(|| default_group.to_string());

        // Step 1: stickiness.
        if let Some(index) = self.sticky_choice(&group) {
            return Ok(index);
        }

        let replica_indices: Vec<usize> = registry.replicas().map(|s| s.index).collect();

        // Step 3: rescale weights.
        let mut weights: HashMap<usize, f64> = registry
            .replicas()
            .map(|s| (s.index, s.weight_for(&group)))
            .collect();
        load_monitor.rescale(&mut weights);

        let lag = load_monitor.lag_times(&replica_indices);

        // Statically-replicated archive hosts are excluded from fresh-read
        // candidate selection the same way a lagging replica would be, but
        // being static never by itself flips lagged-replica mode on -- only
        // a lag exclusion emptying the candidate set does that.
        let non_static_indices: Vec<usize> = registry.replicas().filter(|s| !s.is_static).map(|s| s.index).collect();

        // Lag scaling: exclude servers reporting "false" lag unless their
        // configured max lag is infinite, and servers exceeding their
        // per-server max lag.
        let mut working_set: Vec<usize> = non_static_indices
            .iter()
            .copied()
            .filter(|index| {
                let server = registry.get(*index).expect("index from registry");
                let max_lag = server.max_lag.unwrap_or(cluster_max_lag);
                match lag.get(index) {
                    Some(LagStatus::NotReplicating) => max_lag.is_infinite(),
                    Some(LagStatus::Seconds(s)) => *s <= max_lag,
                    None => false,
                }
            })
            .collect();

        // If all non-static replicas are excluded *by lag* and the primary
        // has zero configured load, the round falls into lagged-replica
        // mode up front. A candidate set that's empty only because every
        // replica is static never triggers this on its own -- there's no
        // lag exclusion to fall back from.
        let primary_has_load = registry.writer().weight_for(&group) > 0.0;
        if working_set.is_empty() && !non_static_indices.is_empty() && !primary_has_load {
            self.set_lagged_replica_mode();
            working_set = non_static_indices.clone();
        }

        if working_set.is_empty() {
            return Err(Error::Pool(PoolError::NoReachableReplica));
        }

        loop {
            if working_set.is_empty() {
                return Err(Error::Pool(PoolError::NoReachableReplica));
            }

            let chosen = if self.lagged_replica_mode() {
                weighted_choice(&working_set, &weights)
            } else if let Some(t) = wait_for_pos_timestamp {
                let horizon = t.elapsed().as_secs_f64() + 1.0;
                self.prefer_within_lag(&working_set, &lag, registry, horizon, cluster_max_lag)
                    .or_else(|| self.prefer_within_own_budget(&working_set, &lag, registry, cluster_max_lag))
                    .unwrap_or_else(|| {
                        self.set_lagged_replica_mode();
                        working_set[0]
                    })
            } else {
                self.prefer_within_own_budget(&working_set, &lag, registry, cluster_max_lag)
                    .unwrap_or_else(|| {
                        self.set_lagged_replica_mode();
                        working_set[0]
                    })
            };

            match pool.probe(registry, chosen, domain).await {
                Ok(()) => {
                    self.sticky.lock().insert(group.clone(), chosen);
                    self.events.on_event(PoolEvent::ReaderChosen {
                        group: group.clone(),
                        server_index: chosen,
                    });
                    return Ok(chosen);
                }
                Err(_) => {
                    warn!(server_index = chosen, "replica unreachable, excluding from candidates");
                    working_set.retain(|i| *i != chosen);
                }
            }
        }
    }

    fn prefer_within_lag(
        &self,
        candidates: &[usize],
        lag: &HashMap<usize, LagStatus>,
        _registry: &ServerRegistry,
        horizon_seconds: f64,
        _cluster_max_lag: f64,
    ) -> Option<usize> {
        candidates
            .iter()
            .copied()
            .find(|index| matches!(lag.get(index), Some(LagStatus::Seconds(s)) if *s <= horizon_seconds))
    }

    fn prefer_within_own_budget(
        &self,
        candidates: &[usize],
        lag: &HashMap<usize, LagStatus>,
        registry: &ServerRegistry,
        cluster_max_lag: f64,
    ) -> Option<usize> {
        candidates.iter().copied().find(|index| {
            let max_lag = registry
                .get(*index)
                .and_then(|s| s.max_lag)
                .unwrap_or(cluster_max_lag);
            matches!(lag.get(index), Some(LagStatus::Seconds(s)) if *s <= max_lag)
        })
    }
}

fn weighted_choice(candidates: &[usize], weights: &HashMap<usize, f64>) -> usize {
    let total: f64 = candidates.iter().map(|i| weights.get(i).copied().unwrap_or(0.0)).sum();
    if total <= 0.0 {
        return candidates[0];
    }
    let mut target = rand::rng().random_range(0.0..total);
    for index in candidates {
        let w = weights.get(index).copied().unwrap_or(0.0);
        if target < w {
            return *index;
        }
        target -= w;
    }
    *candidates.last().unwrap()
}

/// Supplying both a specific server index and a non-default group is a
/// programmer error -- filed as a [`ConfigError`] per spec's taxonomy
/// (an invalid combination of configuration-surfaced inputs), not as a
/// reader-runtime failure.
pub fn check_explicit_server_with_group(
    explicit_index: Option<usize>,
    groups: &[String],
    default_group: &str,
) -> Result<(), ConfigError> {
    if explicit_index.is_some() && groups.iter().any(|g| g != default_group) {
        return Err(ConfigError::ExplicitServerWithGroup);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::sync::{atomic::AtomicU64, Arc};

    use crate::{
        domain::DbDomain,
        driver::ConnectionFactory,
        load_monitor::NullLoadMonitor,
        server_registry::{ServerDescriptor, ServerRegistry},
        test_support::{FakeConnectionFactory, FakeLoadMonitor},
    };

    use super::*;

    fn domain() -> DbDomain {
        DbDomain::new(Some("pgdog".into()), None, "pub")
    }

    /// A statically-replicated archive host must never be handed out as a
    /// fresh-read candidate, even when its reported lag is well within
    /// tolerance -- its exclusion is unconditional, not lag-based.
    #[tokio::test]
    async fn test_static_replica_excluded_from_fresh_reads() {
        let registry = ServerRegistry::new(
            ServerDescriptor::writer("writer"),
            vec![ServerDescriptor::replica(1, "archive", 10.0).with_static(true)],
        );

        let factory: Arc<dyn ConnectionFactory> = Arc::new(FakeConnectionFactory::new());
        let pool = ConnectionPool::new(factory, Arc::new(AtomicU64::new(0)));
        let selector = ReaderSelector::new();

        let result = selector
            .pick_reader_index(&[], "default", &registry, &NullLoadMonitor, &pool, &domain(), 5.0, None)
            .await;

        assert!(result.is_err(), "a static-only replica set must never serve fresh reads");
    }

    /// A static replica never alone flips lagged-replica mode on: excluding
    /// it empties the candidate set for a reason other than lag.
    #[tokio::test]
    async fn test_static_only_exclusion_does_not_enter_lagged_replica_mode() {
        // Writer has zero configured load, which is exactly the condition
        // that would otherwise enter lagged-replica mode -- but the only
        // replica here is static, not lagging, so it must not.
        let registry = ServerRegistry::new(
            ServerDescriptor::writer("writer"),
            vec![ServerDescriptor::replica(1, "archive", 10.0).with_static(true)],
        );
        let factory: Arc<dyn ConnectionFactory> = Arc::new(FakeConnectionFactory::new());
        let pool = ConnectionPool::new(factory, Arc::new(AtomicU64::new(0)));
        let selector = ReaderSelector::new();

        let _ = selector
            .pick_reader_index(&[], "default", &registry, &NullLoadMonitor, &pool, &domain(), 5.0, None)
            .await;

        assert!(!selector.lagged_replica_mode());
    }

    /// With a known wait-for-pos timestamp, selection prefers a replica
    /// within `(now - t) + 1` second over one that is only within its own
    /// max-lag budget -- the tier that `wait_for_pos_timestamp: None` can
    /// never reach.
    #[tokio::test]
    async fn test_wait_for_pos_timestamp_prefers_tighter_horizon() {
        let registry = ServerRegistry::new(
            ServerDescriptor::writer("writer"),
            vec![
                ServerDescriptor::replica(1, "replica-a", 10.0),
                ServerDescriptor::replica(2, "replica-b", 10.0),
            ],
        );
        let monitor = FakeLoadMonitor::new();
        monitor.set_lag(1, LagStatus::Seconds(3.0));
        monitor.set_lag(2, LagStatus::Seconds(0.5));

        let factory: Arc<dyn ConnectionFactory> = Arc::new(FakeConnectionFactory::new());
        let pool = ConnectionPool::new(factory, Arc::new(AtomicU64::new(0)));
        let selector = ReaderSelector::new();

        let chosen = selector
            .pick_reader_index(
                &[],
                "default",
                &registry,
                &monitor,
                &pool,
                &domain(),
                5.0,
                Some(Instant::now()),
            )
            .await
            .unwrap();

        assert_eq!(chosen, 2, "replica-a's own-budget lag (3s) misses the ~1s horizon; replica-b (0.5s) meets it");
    }
}
