//! Shard data plane for the strata replicated KV store: the typed data
//! store and deterministic command applier, the leader lease, the proposer
//! bridge with its commit pipeline, and the RESP front-end.

pub mod errors;
pub mod hll;
pub mod master;
pub mod node;
pub mod redis_server;
pub mod state_machine;
pub mod store;

pub use errors::StoreError;
pub use master::{CoordClient, MasterEvent, MasterLock, MemCoordService};
pub use node::{KvNode, ShardConfig, ShardStats};
pub use state_machine::Value;
