//! Abstract LSM engine facade for the strata node.
//!
//! This crate provides the `KvEngine` contract consumed by the replicated log
//! store and the data-store layer, plus the rocksdb-backed implementation.
//! The contract is deliberately small: point reads, streaming range scans
//! with explicit bound modes, atomic write batches, checkpoints, size
//! estimates, and manual compaction.

mod rocks;

use std::path::Path;

pub use rocks::{EngineConfig, RocksEngine};

/// Stable name for the associative u64-add merge operator.
///
/// Registered on every engine instance so on-disk state stays readable across
/// reopens regardless of which column used merges.
pub const U64_ADD_MERGER: &str = "strata.u64add";

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine has been shut down; all further access is rejected.
    #[error("engine is closed")]
    Closed,
    /// Underlying storage failure. Fatal to the shard when raised on a log
    /// append.
    #[error("engine io: {0}")]
    Io(String),
}

impl From<rocksdb::Error> for EngineError {
    fn from(err: rocksdb::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

/// Inclusion of the range endpoints for a scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanBounds {
    /// `[start, end]`
    Closed,
    /// `[start, end)`
    RightOpen,
    /// `(start, end)`
    BothOpen,
}

/// A single mutation inside an atomic batch.
#[derive(Clone, Debug)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    /// Removes every key in `[start, end)`.
    DeleteRange { start: Vec<u8>, end: Vec<u8> },
    /// Associative u64-add merge (see `U64_ADD_MERGER`).
    Merge { key: Vec<u8>, value: Vec<u8> },
}

/// Reusable ordered batch of mutations committed atomically by `apply`.
#[derive(Default, Debug)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(WriteOp::Put { key, value });
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(WriteOp::Delete { key });
    }

    pub fn delete_range(&mut self, start: Vec<u8>, end: Vec<u8>) {
        self.ops.push(WriteOp::DeleteRange { start, end });
    }

    pub fn merge_u64_add(&mut self, key: Vec<u8>, delta: u64) {
        self.ops.push(WriteOp::Merge {
            key,
            value: delta.to_le_bytes().to_vec(),
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }

    pub fn ops(&self) -> &[WriteOp] {
        self.ops.as_slice()
    }
}

/// Storage engine contract shared by the log store and the data store.
///
/// Reads fail with `EngineError::Closed` once the engine is shut down.
/// Durability of individual writes is not guaranteed by the contract; the log
/// store runs its engine without a write-ahead log and relies on flush plus
/// snapshot-driven recovery.
pub trait KvEngine: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError>;

    /// Batch point lookup preserving input order.
    fn multi_get(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>, EngineError>;

    fn exists(&self, key: &[u8]) -> Result<bool, EngineError>;

    /// Stream `(key, value)` pairs in `[start, end]` modulated by `bounds`,
    /// ascending or descending. The visitor returns `false` to stop early.
    /// The underlying iterator is released on every exit path.
    fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        bounds: ScanBounds,
        reverse: bool,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), EngineError>;

    /// Commit `batch` atomically.
    fn apply(&self, batch: &WriteBatch) -> Result<(), EngineError>;

    /// Hard-link consistent snapshot of the on-disk state into `dir`.
    /// `dir` must not already exist.
    fn checkpoint(&self, dir: &Path) -> Result<(), EngineError>;

    /// Engine-level live-data size estimate in bytes.
    fn estimate_size(&self) -> Result<u64, EngineError>;

    /// Engine-level key-count estimate.
    fn estimate_num_keys(&self) -> Result<u64, EngineError>;

    /// Trigger a manual compaction of `[start, end]`.
    fn compact(&self, start: &[u8], end: &[u8]) -> Result<(), EngineError>;

    /// Shut the engine down. Idempotent; concurrent readers observe `Closed`.
    fn close(&self);

    fn is_closed(&self) -> bool;
}
