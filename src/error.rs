//! Closed error taxonomy for the core (see SPEC_FULL.md §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("no space in job queue")]
    QueueFull,

    #[error("the request message was invalid")]
    InvalidRequest,

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("peer unreachable: {0}")]
    PeerUnreachable(#[source] std::io::Error),

    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Errors surfaced by the `RuntimeAdapter` (§4.2). `NotFound` is tolerated by
/// the monitor's termination drain; every other variant drives the
/// rebuild-and-retry-once ladder.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container not found")]
    NotFound,

    #[error("container runtime API error: {0}")]
    Api(String),

    #[error("container runtime transport error: {0}")]
    Transport(#[from] bollard::errors::Error),
}

pub type Result<T> = std::result::Result<T, EdgeError>;
