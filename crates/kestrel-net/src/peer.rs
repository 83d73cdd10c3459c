//! Per-peer connection state.
//!
//! A [`Peer`] tracks one logical connection through the version handshake
//! and steady-state message flow: negotiated services, ban score, fee
//! filter, loaded bloom filter, known-inventory tracking, and the in-flight
//! getdata queues with their deadlines.

use std::collections::HashMap;
use std::net::SocketAddr;

use kestrel_core::hash::Hash256;

use crate::bloom::{BloomFilter, RollingBloomFilter};
use crate::message::{VersionPayload, SERVICE_WITNESS};

pub type PeerId = u64;

/// Seconds before an outstanding block request expires.
pub const BLOCK_REQUEST_TIMEOUT: u64 = 20 * 60;

/// Seconds before an outstanding tx request expires.
pub const TX_REQUEST_TIMEOUT: u64 = 2 * 60;

/// Orphan-flood window and threshold: more than this many orphan blocks in
/// the window is misbehavior.
pub const ORPHAN_FLOOD_WINDOW: u64 = 3 * 60;
pub const ORPHAN_FLOOD_LIMIT: usize = 200;

/// Recently announced inventory remembered per peer.
const KNOWN_INV_CAPACITY: usize = 50_000;

/// Handshake progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Waiting for the remote `version`.
    AwaitVersion,
    /// Version exchanged; waiting for `verack`.
    AwaitVerack,
    /// Fully negotiated.
    Ready,
}

/// State for one connection.
pub struct Peer {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub outbound: bool,
    pub state: HandshakeState,

    // Negotiated on handshake.
    pub version: i32,
    pub services: u64,
    pub start_height: i32,
    pub user_agent: String,
    pub relay: bool,

    /// Remote fee filter in sat/kvB; zero relays everything.
    pub fee_rate: i64,
    /// BIP37 filter loaded by the peer.
    pub bloom: Option<BloomFilter>,
    /// Peer asked for headers announcements instead of invs.
    pub prefers_headers: bool,

    /// Cumulative misbehavior.
    pub ban_score: i32,

    /// Outstanding block requests with deadlines.
    pub blocks_in_flight: HashMap<Hash256, u64>,
    /// Outstanding tx requests with deadlines.
    pub txs_in_flight: HashMap<Hash256, u64>,

    /// Inventory this peer already knows; suppresses re-announcement.
    pub known_inv: RollingBloomFilter,

    /// Recent orphan block arrival times for flood detection.
    orphan_times: Vec<u64>,

    /// Nonce of the outstanding ping.
    pub ping_nonce: Option<u64>,
    pub last_recv: u64,
}

impl Peer {
    pub fn new(id: PeerId, addr: SocketAddr, outbound: bool, now: u64) -> Self {
        Self {
            id,
            addr,
            outbound,
            state: HandshakeState::AwaitVersion,
            version: 0,
            services: 0,
            start_height: 0,
            user_agent: String::new(),
            relay: true,
            fee_rate: 0,
            bloom: None,
            prefers_headers: false,
            ban_score: 0,
            blocks_in_flight: HashMap::new(),
            txs_in_flight: HashMap::new(),
            known_inv: RollingBloomFilter::new(KNOWN_INV_CAPACITY, 0.000_001),
            orphan_times: Vec::new(),
            ping_nonce: None,
            last_recv: now,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == HandshakeState::Ready
    }

    /// Record the remote version payload.
    pub fn apply_version(&mut self, payload: &VersionPayload) {
        self.version = payload.version;
        self.services = payload.services;
        self.start_height = payload.start_height;
        self.user_agent = payload.user_agent.clone();
        self.relay = payload.relay;
    }

    /// Whether the peer negotiated witness service.
    pub fn has_witness(&self) -> bool {
        self.services & SERVICE_WITNESS != 0
    }

    /// Whether a tx at `fee_rate` sat/kvB passes the peer's fee filter.
    pub fn passes_fee_filter(&self, fee_rate: u64) -> bool {
        self.fee_rate <= 0 || fee_rate >= self.fee_rate as u64
    }

    /// Remember announced inventory.
    pub fn mark_known(&mut self, hash: &Hash256) {
        self.known_inv.insert(hash.as_bytes());
    }

    pub fn knows(&self, hash: &Hash256) -> bool {
        self.known_inv.contains(hash.as_bytes())
    }

    /// Track an orphan block arrival; true when the peer crossed the flood
    /// threshold.
    pub fn track_orphan(&mut self, now: u64) -> bool {
        let cutoff = now.saturating_sub(ORPHAN_FLOOD_WINDOW);
        self.orphan_times.retain(|time| *time >= cutoff);
        self.orphan_times.push(now);
        self.orphan_times.len() > ORPHAN_FLOOD_LIMIT
    }

    /// Hashes whose requests have passed their deadline.
    pub fn expired_requests(&self, now: u64) -> Vec<Hash256> {
        self.blocks_in_flight
            .iter()
            .chain(self.txs_in_flight.iter())
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(hash, _)| *hash)
            .collect()
    }
}
