//! The read contract the consensus layer consumes from log storage.

use strata_engine::EngineError;

use crate::types::{ConfState, Entry, HardState, Snapshot};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested range starts below the first live index.
    #[error("log compacted")]
    Compacted,
    /// The requested range reaches past the last appended index.
    #[error("requested entry unavailable")]
    Unavailable,
    /// A snapshot at or below the current snapshot index was offered.
    #[error("snapshot out of date")]
    SnapOutOfDate,
    /// No entry exists at the requested index.
    #[error("entry not found")]
    NotFound,
    /// A stored record failed to decode.
    #[error("log entry codec: {0}")]
    Codec(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage as seen by the consensus layer. Mutations (`append`, `compact`,
/// snapshot install) are inherent to the concrete store; only reads cross
/// this seam.
pub trait Storage: Send + Sync {
    /// Hard state and membership recovered at boot.
    fn initial_state(&self) -> Result<(HardState, ConfState)>;

    /// Entries in `[lo, hi)`, stopping once the accumulated encoded size
    /// exceeds `max_bytes` with at least one entry collected.
    fn entries(&self, lo: u64, hi: u64, max_bytes: u64) -> Result<Vec<Entry>>;

    /// Term of the entry at `idx`.
    fn term(&self, idx: u64) -> Result<u64>;

    fn first_index(&self) -> Result<u64>;

    fn last_index(&self) -> Result<u64>;

    /// The current snapshot (empty at cold start).
    fn snapshot(&self) -> Result<Snapshot>;
}
