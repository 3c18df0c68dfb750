//! User-visible and internal error kinds for the shard data plane.

use strata_engine::EngineError;
use strata_raft::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid arguments")]
    InvalidArgs,
    #[error("invalid expire seconds")]
    InvalidTtl,
    #[error("key namespace does not match this shard")]
    WrongNamespace,
    #[error("invalid key")]
    InvalidKey,
    #[error("value is not an integer")]
    NotInteger,
    #[error("integer overflow")]
    Overflow,
    #[error("bit offset out of range")]
    BitOverflow,
    #[error("proposal timed out")]
    Timeout,
    #[error("not the shard leader")]
    NotLeader,
    #[error("proposal cancelled")]
    Cancelled,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Log(#[from] StorageError),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
