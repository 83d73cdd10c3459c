//! # kestrel-chain
//! Indexed chain storage and the consensus engine: header index, UTXO set,
//! undo data, reorganization, difficulty retargeting, and deployment state.

pub mod cache;
pub mod difficulty;
pub mod engine;
pub mod entry;
pub mod error;
pub mod keys;
pub mod kv;
pub mod store;
pub mod versionbits;

pub use engine::{AddOutcome, Chain, ChainEvent};
pub use entry::ChainEntry;
pub use error::{ChainError, StoreError};
pub use kv::{KvStore, MemoryKv, WriteBatch};
pub use store::{ChainDB, StoreOptions};
