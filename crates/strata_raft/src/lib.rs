//! Consensus substrate for the strata node: log entry and snapshot types,
//! the `Storage` read contract consumed by the consensus layer, and the
//! engine-backed replicated log store.

mod log_store;
mod storage;
mod types;

pub use log_store::RaftLogStore;
pub use storage::{Result, Storage, StorageError};
pub use types::{ConfState, Entry, EntryType, HardState, Snapshot, SnapshotMeta};
