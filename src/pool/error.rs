use thiserror::Error;

use crate::driver::DriverError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no server at index {0}")]
    NoSuchServer(usize),

    #[error("failed to open connection: {0}")]
    Connect(#[from] DriverError),

    /// The handle's driver-reported domain is incompatible with the
    /// requested domain after a reuse attempt was made.
    #[error("domain mismatch after reuse: handle bound to {actual:?}, requested {requested:?}")]
    DomainMismatch { actual: String, requested: String },

    #[error("no reachable replica")]
    NoReachableReplica,
}
