//! # kestrel-net
//! The Bitcoin wire protocol and the peer pool: message framing and codecs,
//! BIP37 bloom filters, per-peer state machines, in-flight request
//! bookkeeping, and the sync driver.

pub mod addrman;
pub mod bloom;
pub mod error;
pub mod framing;
pub mod inv;
pub mod message;
pub mod peer;
pub mod pool;
pub mod transport;

pub use error::NetError;
pub use inv::{InvItem, InvType, WITNESS_MASK};
pub use message::Message;
pub use peer::{Peer, PeerId};
pub use pool::{Pool, PoolAction, PoolBackend, PoolEvent, PoolOptions};
