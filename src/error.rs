//! Error types.

use thiserror::Error;

use crate::{pool, reader, round};

/// Top-level error produced by the balancer.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Pool(#[from] pool::Error),

    #[error("{0}")]
    Reader(#[from] reader::Error),

    #[error("{0}")]
    Round(#[from] round::Error),

    /// `disable()` was called; all subsequent opens fail unconditionally.
    #[error("load balancer has been disabled")]
    AccessDenied,
}

/// Invalid configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("server list must not be empty")]
    EmptyServers,

    #[error("a server index or sentinel was given alongside a non-default query group")]
    ExplicitServerWithGroup,

    #[error("invalid canonical domain string: \"{0}\"")]
    InvalidDomainString(String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}
