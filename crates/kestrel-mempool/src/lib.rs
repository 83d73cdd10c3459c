//! # kestrel-mempool
//! Bounded pool of unconfirmed transactions: admission policy, orphan
//! tracking, fee-floor dynamics, and eviction.

pub mod error;
pub mod fees;
pub mod mempool;
pub mod orphans;
pub mod policy;

pub use error::MempoolError;
pub use fees::{fee_for, rate_for, DynamicMinFee};
pub use mempool::{AddTxOutcome, ChainView, Mempool, MempoolEntry, MempoolOptions};
pub use orphans::OrphanPool;
