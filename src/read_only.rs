//! Read-only probe: a two-tier cache determining whether the primary is in
//! server-side read-only mode.
//!
//! Grounded in pgdog's `backend::pool::lag_check` (short-TTL process-local
//! caching of a server-reported boolean before deciding to route around a
//! server) generalised to a two-tier process-local/cluster-wide split with
//! busy-value stampede protection on the cluster tier.

use std::{sync::Arc, time::Duration};

use tracing::debug;

use crate::{
    cache::{SrvCache, WanCache},
    domain::DbDomain,
    pool::{ConnectionPool, PoolClass},
    server_registry::ServerRegistry,
};

const PROCESS_LOCAL_TTL: Duration = Duration::from_secs(1);
const CLUSTER_WIDE_TTL: Duration = Duration::from_secs(60);
const BUSY_CLAIM_TTL: Duration = Duration::from_secs(5);
const CACHE_KEY: &str = "primary_read_only";

/// Two-tier cache over `serverIsReadOnly()`. All driver errors during the
/// probe are swallowed and interpreted as "not read-only" so a transient
/// driver failure never escalates into a cluster-wide read-only state.
pub struct ReadOnlyProbe {
    process_local: Arc<dyn SrvCache>,
    cluster_wide: Arc<dyn WanCache>,
    /// Non-`false` value forces read-only regardless of the probe
    /// (`readOnlyReason` config key).
    forced_reason: Option<String>,
}

impl ReadOnlyProbe {
    pub fn new(process_local: Arc<dyn SrvCache>, cluster_wide: Arc<dyn WanCache>) -> Self {
        Self {
            process_local,
            cluster_wide,
            forced_reason: None,
        }
    }

    pub fn with_forced_reason(mut self, reason: Option<String>) -> Self {
        self.forced_reason = reason;
        self
    }

    fn read_bool(value: &str) -> bool {
        value == "true"
    }

    /// Process-local tier: short TTL, refreshed directly against the
    /// primary on miss.
    async fn refresh_process_local(&self, registry: &ServerRegistry, pool: &ConnectionPool, domain: &DbDomain) -> bool {
        if let Some(cached) = self.process_local.get(CACHE_KEY) {
            return Self::read_bool(&cached);
        }

        let read_only = match pool
            .reuse_or_open(registry, registry.writer_index(), domain, PoolClass::Autocommit, false, None)
            .await
        {
            Ok(mut handle) => {
                let result = handle.conn_mut().server_is_read_only().await.unwrap_or(false);
                pool.checkin(handle);
                result
            }
            Err(e) => {
                debug!(error = %e, "read-only probe connect failed, treating as not read-only");
                false
            }
        };

        self.process_local
            .put(CACHE_KEY, read_only.to_string(), PROCESS_LOCAL_TTL);
        read_only
    }

    /// `isPrimaryRunningReadOnly`: cluster-wide tier first, forcing a
    /// process-local refresh on miss to avoid backfilling from a
    /// potentially stale value. The cluster cache uses a busy value of
    /// "not read-only" so two concurrent probers don't both open writer
    /// connections.
    pub async fn is_primary_running_read_only(
        &self,
        registry: &ServerRegistry,
        pool: &ConnectionPool,
        domain: &DbDomain,
    ) -> bool {
        if self.forced_reason.is_some() {
            return true;
        }

        if let Some(cached) = self.cluster_wide.get_or_lock(CACHE_KEY, "false", BUSY_CLAIM_TTL) {
            return Self::read_bool(&cached);
        }

        let read_only = self.refresh_process_local(registry, pool, domain).await;
        self.cluster_wide
            .put(CACHE_KEY, read_only.to_string(), CLUSTER_WIDE_TTL);
        read_only
    }

    /// The `readOnlyReason` config override, if set. This is the
    /// config-forced half of `getReadOnlyReason()`; the balancer adds the
    /// lagged-replica-mode half on top.
    pub fn forced_reason(&self) -> Option<&str> {
        self.forced_reason.as_deref()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::{InMemorySrvCache, InMemoryWanCache};
    use crate::driver::ConnectionFactory;
    use crate::server_registry::ServerDescriptor;
    use crate::test_support::FakeConnectionFactory;
    use std::sync::atomic::AtomicU64;

    fn registry() -> ServerRegistry {
        ServerRegistry::new(ServerDescriptor::writer("writer"), vec![])
    }

    fn domain() -> DbDomain {
        DbDomain::new(Some("pgdog".into()), None, "pub")
    }

    #[tokio::test]
    async fn test_forced_reason_short_circuits_probe() {
        let probe = ReadOnlyProbe::new(Arc::new(InMemorySrvCache::new()), Arc::new(InMemoryWanCache::new()))
            .with_forced_reason(Some("maintenance".into()));
        let factory: Arc<dyn ConnectionFactory> = Arc::new(FakeConnectionFactory::new());
        let pool = ConnectionPool::new(factory, Arc::new(AtomicU64::new(0)));

        assert!(probe.is_primary_running_read_only(&registry(), &pool, &domain()).await);
        assert_eq!(probe.forced_reason(), Some("maintenance"));
    }

    #[tokio::test]
    async fn test_probe_swallows_driver_error_as_not_read_only() {
        let probe = ReadOnlyProbe::new(Arc::new(InMemorySrvCache::new()), Arc::new(InMemoryWanCache::new()));
        let factory = FakeConnectionFactory::new();
        factory.mark_unreachable(0);
        let factory: Arc<dyn ConnectionFactory> = Arc::new(factory);
        let pool = ConnectionPool::new(factory, Arc::new(AtomicU64::new(0)));

        assert!(!probe.is_primary_running_read_only(&registry(), &pool, &domain()).await);
    }

    #[tokio::test]
    async fn test_cluster_tier_caches_across_calls() {
        let probe = ReadOnlyProbe::new(Arc::new(InMemorySrvCache::new()), Arc::new(InMemoryWanCache::new()));
        let factory: Arc<dyn ConnectionFactory> = Arc::new(FakeConnectionFactory::new());
        let pool = ConnectionPool::new(factory, Arc::new(AtomicU64::new(0)));

        let first = probe.is_primary_running_read_only(&registry(), &pool, &domain()).await;
        let second = probe.is_primary_running_read_only(&registry(), &pool, &domain()).await;
        assert_eq!(first, second);
    }
}
