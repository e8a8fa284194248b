//! Load monitor capability: a narrow `rescale(weights)`/`lagTimes(indices)`
//! seam rather than dynamic dispatch over a family of monitor
//! implementations. The concrete monitor that measures lag and rescales
//! weights is an external collaborator; this module only defines the seam
//! and a null implementation, the way pgdog defines `lb::monitor::Monitor`
//! as a background task that mutates `TargetHealth` without the pool caring
//! how it got its numbers.

use std::collections::HashMap;

/// Replication lag as reported by the monitor for one server.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LagStatus {
    /// The server isn't streaming at all ("false" lag).
    NotReplicating,
    /// Lag in seconds.
    Seconds(f64),
}

impl LagStatus {
    pub fn seconds(self) -> Option<f64> {
        match self {
            LagStatus::NotReplicating => None,
            LagStatus::Seconds(s) => Some(s),
        }
    }
}

/// Capability required of a load monitor: rescale a weight table in place,
/// and report lag for a set of server indices.
pub trait LoadMonitor: Send + Sync {
    /// Rescale `weights` (keyed by server index) in place, e.g. to account
    /// for recently observed latency or error rates.
    fn rescale(&self, weights: &mut HashMap<usize, f64>);

    /// Report current lag for the given server indices. Servers not present
    /// in the result are treated as [`LagStatus::NotReplicating`].
    fn lag_times(&self, indices: &[usize]) -> HashMap<usize, LagStatus>;
}

/// A load monitor that never rescales and reports every replica as caught
/// up. Used for clusters with no external monitoring configured.
#[derive(Debug, Default)]
pub struct NullLoadMonitor;

impl LoadMonitor for NullLoadMonitor {
    fn rescale(&self, _weights: &mut HashMap<usize, f64>) {}

    fn lag_times(&self, indices: &[usize]) -> HashMap<usize, LagStatus> {
        indices.iter().map(|i| (*i, LagStatus::Seconds(0.0))).collect()
    }
}
