//! Error types for leaseq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A second active subscription to the same topic on one communicator.
    #[error("already subscribed to topic {0}")]
    AlreadySubscribed(String),

    /// Payload lookup key is empty or has an empty path segment.
    #[error("invalid payload key {0:?}")]
    InvalidKey(String),

    /// Connectivity or query failure against the backing store. Not retried.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
