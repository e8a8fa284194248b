//! Observability seam. A concrete metrics sink is out of scope here, but
//! grounded in pgdog's `backend::pool::events` module, the pool and round
//! coordinator still emit structured events onto a listener so an ambient
//! metrics/logging layer can subscribe without the core depending on one.
//! `NullEventListener` is the default.

use crate::pool::PoolClass;

#[derive(Debug, Clone)]
pub enum PoolEvent {
    HandleOpened { server_index: usize, class: PoolClass },
    HandleClosed { server_index: usize, class: PoolClass },
    AllClosed { count: usize },
    ReaderChosen { group: String, server_index: usize },
    LaggedReplicaModeEntered,
    RoundCommitted { round_id: String },
    RoundRolledBack { round_id: String },
}

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: PoolEvent);
}

#[derive(Debug, Default)]
pub struct NullEventListener;

impl EventListener for NullEventListener {
    fn on_event(&self, _event: PoolEvent) {}
}
