//! The peer pool and sync driver.
//!
//! Owns per-peer state, designates a loader for chain download, keeps the
//! global in-flight request map (one active request per hash), serializes
//! broadcasts with ack/reject/timeout, and applies the ban policy. The pool
//! is a deterministic state machine: network and clock inputs come in
//! through method calls and side effects come out as [`PoolAction`]s, which
//! the node's transport layer executes.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};

use rand::random;
use tracing::{debug, info, warn};

use kestrel_core::block::{Block, BlockHeader};
use kestrel_core::hash::Hash256;
use kestrel_core::merkle::PartialMerkleTree;
use kestrel_core::tx::Transaction;

use crate::addrman::AddrMan;
use crate::bloom::BloomFilter;
use crate::error::NetError;
use crate::inv::{InvItem, InvType};
use crate::message::{
    Message, NetAddress, VersionPayload, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION, SERVICE_BLOOM,
    SERVICE_NETWORK, SERVICE_WITNESS,
};
use crate::peer::{
    HandshakeState, Peer, PeerId, BLOCK_REQUEST_TIMEOUT, TX_REQUEST_TIMEOUT,
};

/// Ban threshold and duration.
pub const BAN_SCORE_THRESHOLD: i32 = 100;
pub const BAN_TIME: u64 = 24 * 60 * 60;

/// Broadcast item lifetime.
pub const BROADCAST_TIMEOUT: u64 = 60;

/// Maximum block hashes answered per getblocks.
const MAX_GETBLOCKS_RESULTS: usize = 500;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_peers: usize,
    /// Download via getheaders + getdata instead of getblocks + inv.
    pub headers_first: bool,
    pub user_agent: String,
    pub services: u64,
    pub relay: bool,
    pub ban_threshold: i32,
    pub ban_time: u64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_peers: 8,
            headers_first: true,
            user_agent: "/kestrel:0.1.0/".into(),
            services: SERVICE_NETWORK | SERVICE_BLOOM | SERVICE_WITNESS,
            relay: true,
            ban_threshold: BAN_SCORE_THRESHOLD,
            ban_time: BAN_TIME,
        }
    }
}

/// Chain/mempool interface the pool drives.
pub trait PoolBackend {
    fn best_height(&mut self) -> u32;
    fn get_locator(&mut self) -> Vec<Hash256>;
    fn add_block(&mut self, block: Block) -> BlockDisposition;
    fn add_tx(&mut self, tx: Transaction) -> TxDisposition;
    fn has_block(&mut self, hash: &Hash256) -> bool;
    fn get_block(&mut self, hash: &Hash256) -> Option<Block>;
    fn get_headers(&mut self, locator: &[Hash256], stop: &Hash256) -> Vec<BlockHeader>;
    fn get_block_hashes(&mut self, locator: &[Hash256], stop: &Hash256) -> Vec<Hash256>;
    fn get_mempool_tx(&mut self, txid: &Hash256) -> Option<Transaction>;
    fn mempool_txids(&mut self) -> Vec<Hash256>;
    /// Fee rate of a resident mempool tx in sat/kvB, zero if unknown.
    fn mempool_fee_rate(&mut self, txid: &Hash256) -> u64;
    /// Deepest missing ancestor of an orphan block.
    fn orphan_root(&mut self, hash: &Hash256) -> Hash256;
}

/// Outcome of handing a block to the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockDisposition {
    Connected,
    Orphaned,
    AlreadyKnown,
    SideBranch,
    Invalid { code: u8, reason: String, score: i32 },
}

/// Outcome of handing a tx to the mempool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxDisposition {
    Added,
    Orphaned,
    AlreadyKnown,
    Invalid { code: u8, reason: String, score: i32 },
}

/// Side effects for the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolAction {
    Send { peer: PeerId, message: Message },
    Disconnect { peer: PeerId, reason: String },
    Event(PoolEvent),
}

/// Notifications surfaced to the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    PeerReady { peer: PeerId, height: i32 },
    PeerBanned { peer: PeerId, host: IpAddr },
    BroadcastAck { hash: Hash256, peer: PeerId },
    BroadcastReject { hash: Hash256, peer: PeerId, reason: String },
    BroadcastTimeout { hash: Hash256 },
    SyncProgress { height: u32 },
}

/// One outstanding getdata request.
#[derive(Debug, Clone)]
struct LoadRequest {
    peer: PeerId,
    inv_type: InvType,
}

/// An item being pushed to the network until peers pull it.
#[derive(Debug, Clone)]
struct BroadcastItem {
    payload: BroadcastPayload,
    deadline: u64,
    acked: bool,
}

#[derive(Debug, Clone)]
enum BroadcastPayload {
    Tx { tx: Transaction, fee_rate: u64 },
    Block(Block),
}

/// The pool.
pub struct Pool {
    options: PoolOptions,
    peers: HashMap<PeerId, Peer>,
    next_id: PeerId,
    loader: Option<PeerId>,
    /// Global request map: at most one active request per hash.
    requests: HashMap<Hash256, LoadRequest>,
    /// Blocks learned (headers-first or inv) awaiting download.
    pending_blocks: VecDeque<Hash256>,
    broadcasts: HashMap<Hash256, BroadcastItem>,
    banned: HashMap<IpAddr, u64>,
    addrman: AddrMan,
    syncing: bool,
}

impl Pool {
    pub fn new(options: PoolOptions) -> Self {
        Self {
            options,
            peers: HashMap::new(),
            next_id: 1,
            loader: None,
            requests: HashMap::new(),
            pending_blocks: VecDeque::new(),
            broadcasts: HashMap::new(),
            banned: HashMap::new(),
            addrman: AddrMan::new(),
            syncing: false,
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn loader(&self) -> Option<PeerId> {
        self.loader
    }

    pub fn is_banned(&mut self, host: &IpAddr, now: u64) -> bool {
        self.sweep_bans(now);
        self.banned.contains_key(host)
    }

    fn sweep_bans(&mut self, now: u64) {
        let ban_time = self.options.ban_time;
        self.banned.retain(|_, banned_at| now.saturating_sub(*banned_at) < ban_time);
    }

    // ------------------------------------------------------------------
    // connection lifecycle
    // ------------------------------------------------------------------

    /// Admit a new connection.
    pub fn on_connect(
        &mut self,
        addr: SocketAddr,
        outbound: bool,
        best_height: u32,
        now: u64,
    ) -> Result<(PeerId, Vec<PoolAction>), NetError> {
        if self.is_banned(&addr.ip(), now) {
            return Err(NetError::BanListed);
        }
        if self.peers.len() >= self.options.max_peers {
            return Err(NetError::TooManyPeers);
        }
        let id = self.next_id;
        self.next_id += 1;
        let peer = Peer::new(id, addr, outbound, now);
        self.peers.insert(id, peer);
        debug!(peer = id, %addr, outbound, "peer attached");

        let mut actions = Vec::new();
        if outbound {
            actions.push(PoolAction::Send {
                peer: id,
                message: self.version_message(addr, best_height, now),
            });
        }
        Ok((id, actions))
    }

    fn version_message(&self, addr: SocketAddr, best_height: u32, now: u64) -> Message {
        Message::Version(VersionPayload {
            version: PROTOCOL_VERSION,
            services: self.options.services,
            timestamp: now as i64,
            recv: NetAddress::from_socket(addr, 0),
            from: NetAddress::unspecified(),
            nonce: random(),
            user_agent: self.options.user_agent.clone(),
            start_height: best_height as i32,
            relay: self.options.relay,
        })
    }

    /// A connection died; finish its requests so the hashes can be fetched
    /// elsewhere.
    pub fn on_disconnect(&mut self, peer_id: PeerId) {
        let Some(peer) = self.peers.remove(&peer_id) else {
            return;
        };
        info!(peer = peer_id, addr = %peer.addr, "peer detached");
        for (hash, _) in peer.blocks_in_flight {
            self.requests.remove(&hash);
            self.pending_blocks.push_front(hash);
        }
        for (hash, _) in peer.txs_in_flight {
            self.requests.remove(&hash);
        }
        if self.loader == Some(peer_id) {
            self.loader = None;
            self.syncing = false;
        }
    }

    // ------------------------------------------------------------------
    // message dispatch
    // ------------------------------------------------------------------

    /// Feed one parsed message from a peer through the pool.
    pub fn on_message<B: PoolBackend>(
        &mut self,
        backend: &mut B,
        peer_id: PeerId,
        message: Message,
        now: u64,
    ) -> Vec<PoolAction> {
        if !self.peers.contains_key(&peer_id) {
            return Vec::new();
        }
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.last_recv = now;
        }

        match message {
            Message::Version(payload) => self.handle_version(backend, peer_id, payload, now),
            Message::Verack => self.handle_verack(backend, peer_id, now),
            Message::Ping(nonce) => {
                vec![PoolAction::Send { peer: peer_id, message: Message::Pong(nonce) }]
            }
            Message::Pong(nonce) => {
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    if peer.ping_nonce == Some(nonce) {
                        peer.ping_nonce = None;
                    }
                }
                Vec::new()
            }
            Message::GetAddr => {
                let sample = self.addrman.sample();
                vec![PoolAction::Send { peer: peer_id, message: Message::Addr(sample) }]
            }
            Message::Addr(entries) => {
                for (time, addr) in entries {
                    self.addrman.insert(time, addr);
                }
                Vec::new()
            }
            Message::Inv(items) => self.handle_inv(backend, peer_id, items, now),
            Message::GetData(items) => self.handle_getdata(backend, peer_id, items, now),
            Message::NotFound(items) => self.handle_notfound(peer_id, items),
            Message::GetHeaders { locator, stop } => {
                let headers = backend.get_headers(&locator, &stop);
                vec![PoolAction::Send { peer: peer_id, message: Message::Headers(headers) }]
            }
            Message::GetBlocks { locator, stop } => {
                let hashes = backend.get_block_hashes(&locator, &stop);
                let items: Vec<InvItem> = hashes
                    .into_iter()
                    .take(MAX_GETBLOCKS_RESULTS)
                    .map(InvItem::block)
                    .collect();
                if items.is_empty() {
                    Vec::new()
                } else {
                    vec![PoolAction::Send { peer: peer_id, message: Message::Inv(items) }]
                }
            }
            Message::Headers(headers) => self.handle_headers(backend, peer_id, headers, now),
            Message::Block(block) => self.handle_block(backend, peer_id, block, now),
            Message::Tx(tx) => self.handle_tx(backend, peer_id, tx, now),
            Message::Mempool => {
                let items: Vec<InvItem> =
                    backend.mempool_txids().into_iter().map(InvItem::tx).collect();
                items
                    .chunks(kestrel_core::constants::MAX_INV_ITEMS)
                    .map(|chunk| PoolAction::Send {
                        peer: peer_id,
                        message: Message::Inv(chunk.to_vec()),
                    })
                    .collect()
            }
            Message::FilterLoad { filter, hash_funcs, tweak, flags } => {
                match BloomFilter::from_parts(filter, hash_funcs, tweak, flags) {
                    Some(bloom) => {
                        if let Some(peer) = self.peers.get_mut(&peer_id) {
                            peer.bloom = Some(bloom);
                        }
                        Vec::new()
                    }
                    None => self.set_misbehavior(peer_id, 100, now),
                }
            }
            Message::FilterAdd(data) => {
                if data.len() > kestrel_core::constants::MAX_SCRIPT_PUSH {
                    return self.set_misbehavior(peer_id, 100, now);
                }
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    if let Some(bloom) = peer.bloom.as_mut() {
                        bloom.insert(&data);
                    }
                }
                Vec::new()
            }
            Message::FilterClear => {
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.bloom = None;
                }
                Vec::new()
            }
            Message::Reject { reason, hash, .. } => {
                if let Some(hash) = hash {
                    if self.broadcasts.contains_key(&hash) {
                        return vec![PoolAction::Event(PoolEvent::BroadcastReject {
                            hash,
                            peer: peer_id,
                            reason,
                        })];
                    }
                }
                Vec::new()
            }
            Message::SendHeaders => {
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.prefers_headers = true;
                }
                Vec::new()
            }
            Message::FeeFilter(rate) => {
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.fee_rate = rate;
                }
                Vec::new()
            }
            // Compact blocks are stubbed: acknowledge low-bandwidth mode
            // once and ignore the rest of the flow.
            Message::SendCmpct { .. } => Vec::new(),
            Message::Unknown { command, .. } => {
                debug!(peer = peer_id, %command, "ignoring unknown command");
                Vec::new()
            }
            Message::MerkleBlock { .. } => Vec::new(),
        }
    }

    fn handle_version(
        &mut self,
        backend: &mut impl PoolBackend,
        peer_id: PeerId,
        payload: VersionPayload,
        now: u64,
    ) -> Vec<PoolAction> {
        let best_height = backend.best_height();
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return Vec::new();
        };
        if peer.state != HandshakeState::AwaitVersion {
            return self.misbehave_with_reason(peer_id, 10, "duplicate version", now);
        }
        if payload.version < MIN_PROTOCOL_VERSION {
            return vec![
                PoolAction::Send {
                    peer: peer_id,
                    message: Message::Reject {
                        message: "version".into(),
                        code: 0x11,
                        reason: "obsolete".into(),
                        hash: None,
                    },
                },
                PoolAction::Disconnect { peer: peer_id, reason: "obsolete version".into() },
            ];
        }
        peer.apply_version(&payload);
        peer.state = HandshakeState::AwaitVerack;
        let outbound = peer.outbound;
        let addr = peer.addr;

        let mut actions = Vec::new();
        if !outbound {
            actions.push(PoolAction::Send {
                peer: peer_id,
                message: self.version_message(addr, best_height, now),
            });
        }
        actions.push(PoolAction::Send { peer: peer_id, message: Message::Verack });
        actions
    }

    fn handle_verack(
        &mut self,
        backend: &mut impl PoolBackend,
        peer_id: PeerId,
        now: u64,
    ) -> Vec<PoolAction> {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return Vec::new();
        };
        if peer.state != HandshakeState::AwaitVerack {
            return self.misbehave_with_reason(peer_id, 10, "stray verack", now);
        }
        peer.state = HandshakeState::Ready;
        let height = peer.start_height;
        info!(peer = peer_id, height, agent = %peer.user_agent, "handshake complete");

        let mut actions = vec![
            PoolAction::Send { peer: peer_id, message: Message::SendHeaders },
            // Compact-block stub: announce support for version 1, never
            // request compact relay.
            PoolAction::Send {
                peer: peer_id,
                message: Message::SendCmpct { announce: false, version: 1 },
            },
            PoolAction::Send { peer: peer_id, message: Message::GetAddr },
            PoolAction::Event(PoolEvent::PeerReady { peer: peer_id, height }),
        ];
        actions.extend(self.maybe_start_sync(backend));
        actions
    }

    // ------------------------------------------------------------------
    // sync driver
    // ------------------------------------------------------------------

    /// Choose a loader and kick off header or block download.
    fn maybe_start_sync(&mut self, backend: &mut impl PoolBackend) -> Vec<PoolAction> {
        if self.loader.is_some() {
            return Vec::new();
        }
        let our_height = backend.best_height() as i32;
        let candidate = self
            .peers
            .values()
            .filter(|peer| peer.is_ready() && peer.start_height > our_height)
            .max_by_key(|peer| (peer.outbound, peer.start_height))
            .map(|peer| peer.id);
        let Some(loader) = candidate else {
            return Vec::new();
        };
        self.loader = Some(loader);
        self.syncing = true;
        info!(peer = loader, "designated loader peer");

        let locator = backend.get_locator();
        let message = if self.options.headers_first {
            Message::GetHeaders { locator, stop: Hash256::ZERO }
        } else {
            Message::GetBlocks { locator, stop: Hash256::ZERO }
        };
        vec![PoolAction::Send { peer: loader, message }]
    }

    /// Batch size for block getdata, wide when far behind and narrow near
    /// the tip to amortize disk I/O.
    fn batch_size(our_height: u32, peer_height: i32) -> usize {
        let behind = (peer_height as i64 - our_height as i64).max(0);
        if behind > 1000 {
            128
        } else if behind > 100 {
            32
        } else {
            10
        }
    }

    /// Issue getdata for pending blocks up to the peer's batch budget.
    fn schedule_blocks(
        &mut self,
        backend: &mut impl PoolBackend,
        peer_id: PeerId,
        now: u64,
    ) -> Vec<PoolAction> {
        let our_height = backend.best_height();
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return Vec::new();
        };
        let budget = Self::batch_size(our_height, peer.start_height)
            .saturating_sub(peer.blocks_in_flight.len());
        if budget == 0 {
            return Vec::new();
        }

        let witness = peer.has_witness();
        let mut items = Vec::new();
        while items.len() < budget {
            let Some(hash) = self.pending_blocks.pop_front() else {
                break;
            };
            if self.requests.contains_key(&hash) {
                continue;
            }
            self.requests
                .insert(hash, LoadRequest { peer: peer_id, inv_type: InvType::Block });
            peer.blocks_in_flight.insert(hash, now + BLOCK_REQUEST_TIMEOUT);
            let mut item = InvItem::block(hash);
            if witness {
                item = item.with_witness();
            }
            items.push(item);
        }
        if items.is_empty() {
            return Vec::new();
        }
        debug!(peer = peer_id, count = items.len(), "requesting block batch");
        vec![PoolAction::Send { peer: peer_id, message: Message::GetData(items) }]
    }

    fn handle_headers(
        &mut self,
        backend: &mut impl PoolBackend,
        peer_id: PeerId,
        headers: Vec<BlockHeader>,
        now: u64,
    ) -> Vec<PoolAction> {
        if headers.is_empty() {
            // Caught up with this peer's header chain.
            if self.loader == Some(peer_id) && self.pending_blocks.is_empty() {
                self.syncing = false;
            }
            return Vec::new();
        }
        // Headers must chain.
        for pair in headers.windows(2) {
            if pair[1].prev != pair[0].hash() {
                return self.misbehave_with_reason(peer_id, 20, "disconnected headers", now);
            }
        }
        let full_batch = headers.len() == kestrel_core::constants::MAX_HEADERS_RESULTS;
        let last_hash = headers.last().expect("nonempty").hash();
        for header in &headers {
            let hash = header.hash();
            if !backend.has_block(&hash) && !self.requests.contains_key(&hash) {
                self.pending_blocks.push_back(hash);
            }
        }

        let mut actions = self.schedule_blocks(backend, peer_id, now);
        if full_batch && self.loader == Some(peer_id) {
            actions.push(PoolAction::Send {
                peer: peer_id,
                message: Message::GetHeaders { locator: vec![last_hash], stop: Hash256::ZERO },
            });
        }
        actions
    }

    fn handle_inv(
        &mut self,
        backend: &mut impl PoolBackend,
        peer_id: PeerId,
        items: Vec<InvItem>,
        now: u64,
    ) -> Vec<PoolAction> {
        // The witness mask is only meaningful on getdata; a masked inv is
        // protocol abuse.
        if items.iter().any(|item| item.witness) {
            return self.misbehave_with_reason(peer_id, 100, "witness-masked inv", now);
        }

        let mut tx_items = Vec::new();
        for item in &items {
            if let Some(peer) = self.peers.get_mut(&peer_id) {
                peer.mark_known(&item.hash);
            }
            match item.inv_type {
                InvType::Tx => {
                    if !self.requests.contains_key(&item.hash)
                        && backend.get_mempool_tx(&item.hash).is_none()
                    {
                        self.requests.insert(
                            item.hash,
                            LoadRequest { peer: peer_id, inv_type: InvType::Tx },
                        );
                        if let Some(peer) = self.peers.get_mut(&peer_id) {
                            peer.txs_in_flight.insert(item.hash, now + TX_REQUEST_TIMEOUT);
                        }
                        tx_items.push(InvItem::tx(item.hash));
                    }
                }
                InvType::Block => {
                    if !backend.has_block(&item.hash)
                        && !self.requests.contains_key(&item.hash)
                        && !self.pending_blocks.contains(&item.hash)
                    {
                        self.pending_blocks.push_back(item.hash);
                    }
                }
                InvType::FilteredBlock | InvType::Error => {}
            }
        }

        let mut actions = Vec::new();
        if !tx_items.is_empty() {
            actions.push(PoolAction::Send {
                peer: peer_id,
                message: Message::GetData(tx_items),
            });
        }
        actions.extend(self.schedule_blocks(backend, peer_id, now));
        actions
    }

    fn handle_getdata(
        &mut self,
        backend: &mut impl PoolBackend,
        peer_id: PeerId,
        items: Vec<InvItem>,
        _now: u64,
    ) -> Vec<PoolAction> {
        let mut actions = Vec::new();
        let mut not_found = Vec::new();
        for item in items {
            match item.inv_type {
                InvType::Tx => {
                    if let Some(payload) = self.serve_broadcast(&item.hash, peer_id, &mut actions)
                    {
                        let tx = match payload {
                            BroadcastPayload::Tx { tx, .. } => tx,
                            BroadcastPayload::Block(_) => continue,
                        };
                        actions.push(self.send_tx(peer_id, tx, item.witness));
                    } else if let Some(tx) = backend.get_mempool_tx(&item.hash) {
                        actions.push(self.send_tx(peer_id, tx, item.witness));
                    } else {
                        not_found.push(item);
                    }
                }
                InvType::Block => {
                    if let Some(payload) = self.serve_broadcast(&item.hash, peer_id, &mut actions)
                    {
                        if let BroadcastPayload::Block(block) = payload {
                            actions.push(self.send_block(peer_id, block, item.witness));
                            continue;
                        }
                    }
                    match backend.get_block(&item.hash) {
                        Some(block) => {
                            actions.push(self.send_block(peer_id, block, item.witness));
                        }
                        None => not_found.push(item),
                    }
                }
                InvType::FilteredBlock => match backend.get_block(&item.hash) {
                    Some(block) => actions.extend(self.send_filtered_block(peer_id, block)),
                    None => not_found.push(item),
                },
                InvType::Error => {}
            }
        }
        if !not_found.is_empty() {
            actions.push(PoolAction::Send {
                peer: peer_id,
                message: Message::NotFound(not_found),
            });
        }
        actions
    }

    fn serve_broadcast(
        &mut self,
        hash: &Hash256,
        peer_id: PeerId,
        actions: &mut Vec<PoolAction>,
    ) -> Option<BroadcastPayload> {
        let item = self.broadcasts.get_mut(hash)?;
        if !item.acked {
            item.acked = true;
            actions.push(PoolAction::Event(PoolEvent::BroadcastAck { hash: *hash, peer: peer_id }));
        }
        Some(item.payload.clone())
    }

    fn send_tx(&self, peer_id: PeerId, tx: Transaction, witness: bool) -> PoolAction {
        let tx = if witness { tx } else { strip_tx(&tx) };
        PoolAction::Send { peer: peer_id, message: Message::Tx(tx) }
    }

    fn send_block(&self, peer_id: PeerId, block: Block, witness: bool) -> PoolAction {
        let block = if witness { block } else { strip_block(&block) };
        PoolAction::Send { peer: peer_id, message: Message::Block(block) }
    }

    /// Serve a filtered block: the partial merkle tree over the peer's
    /// bloom matches followed by the matched transactions.
    fn send_filtered_block(&mut self, peer_id: PeerId, block: Block) -> Vec<PoolAction> {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return Vec::new();
        };
        let Some(bloom) = peer.bloom.as_mut() else {
            // No filter loaded: serve the full block.
            return vec![PoolAction::Send { peer: peer_id, message: Message::Block(block) }];
        };
        let txids: Vec<Hash256> = block.txs.iter().map(|tx| tx.txid()).collect();
        let matches: Vec<bool> = block.txs.iter().map(|tx| bloom.matches_tx(tx)).collect();
        let tree = PartialMerkleTree::from_txids(&txids, &matches);
        let mut actions = vec![PoolAction::Send {
            peer: peer_id,
            message: Message::MerkleBlock { header: block.header, tree },
        }];
        for (tx, matched) in block.txs.into_iter().zip(matches) {
            if matched {
                actions.push(PoolAction::Send { peer: peer_id, message: Message::Tx(tx) });
            }
        }
        actions
    }

    fn handle_notfound(&mut self, peer_id: PeerId, items: Vec<InvItem>) -> Vec<PoolAction> {
        for item in items {
            if let Some(request) = self.requests.get(&item.hash) {
                if request.peer == peer_id {
                    self.requests.remove(&item.hash);
                    if let Some(peer) = self.peers.get_mut(&peer_id) {
                        peer.blocks_in_flight.remove(&item.hash);
                        peer.txs_in_flight.remove(&item.hash);
                    }
                    if item.inv_type == InvType::Block {
                        // Someone else may have it.
                        self.pending_blocks.push_back(item.hash);
                    }
                }
            }
        }
        Vec::new()
    }

    fn handle_block(
        &mut self,
        backend: &mut impl PoolBackend,
        peer_id: PeerId,
        block: Block,
        now: u64,
    ) -> Vec<PoolAction> {
        let hash = block.hash();
        self.requests.remove(&hash);
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.blocks_in_flight.remove(&hash);
            peer.mark_known(&hash);
        }

        let mut actions = Vec::new();
        match backend.add_block(block) {
            BlockDisposition::Connected => {
                let height = backend.best_height();
                actions.push(PoolAction::Event(PoolEvent::SyncProgress { height }));
                actions.extend(self.announce_block(backend, hash, peer_id));
                actions.extend(self.schedule_blocks(backend, peer_id, now));
                // Drained the queue: ask the loader for what comes next.
                if self.syncing
                    && self.pending_blocks.is_empty()
                    && self.requests.values().all(|r| r.inv_type != InvType::Block)
                {
                    if let Some(loader) = self.loader {
                        let locator = backend.get_locator();
                        let message = if self.options.headers_first {
                            Message::GetHeaders { locator, stop: Hash256::ZERO }
                        } else {
                            Message::GetBlocks { locator, stop: Hash256::ZERO }
                        };
                        actions.push(PoolAction::Send { peer: loader, message });
                    }
                }
            }
            BlockDisposition::Orphaned => {
                let flooded = self
                    .peers
                    .get_mut(&peer_id)
                    .map(|peer| peer.track_orphan(now))
                    .unwrap_or(false);
                if flooded {
                    actions.extend(self.misbehave_with_reason(peer_id, 100, "orphan flood", now));
                    return actions;
                }
                // Chase the orphan's missing ancestry at the loader.
                let root = backend.orphan_root(&hash);
                let locator = backend.get_locator();
                let target = self.loader.unwrap_or(peer_id);
                actions.push(PoolAction::Send {
                    peer: target,
                    message: Message::GetBlocks { locator, stop: root },
                });
            }
            BlockDisposition::AlreadyKnown | BlockDisposition::SideBranch => {
                actions.extend(self.schedule_blocks(backend, peer_id, now));
            }
            BlockDisposition::Invalid { code, reason, score } => {
                warn!(peer = peer_id, %hash, reason, "invalid block from peer");
                if score >= 0 {
                    actions.push(PoolAction::Send {
                        peer: peer_id,
                        message: Message::Reject {
                            message: "block".into(),
                            code,
                            reason,
                            hash: Some(hash),
                        },
                    });
                }
                if score > 0 {
                    actions.extend(self.set_misbehavior(peer_id, score, now));
                }
            }
        }
        actions
    }

    fn handle_tx(
        &mut self,
        backend: &mut impl PoolBackend,
        peer_id: PeerId,
        tx: Transaction,
        now: u64,
    ) -> Vec<PoolAction> {
        let txid = tx.txid();
        self.requests.remove(&txid);
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.txs_in_flight.remove(&txid);
            peer.mark_known(&txid);
        }

        match backend.add_tx(tx) {
            TxDisposition::Added => self.announce_tx(backend, txid, peer_id),
            TxDisposition::Orphaned | TxDisposition::AlreadyKnown => Vec::new(),
            TxDisposition::Invalid { code, reason, score } => {
                let mut actions = Vec::new();
                if score >= 0 {
                    actions.push(PoolAction::Send {
                        peer: peer_id,
                        message: Message::Reject {
                            message: "tx".into(),
                            code,
                            reason,
                            hash: Some(txid),
                        },
                    });
                }
                if score > 0 {
                    actions.extend(self.set_misbehavior(peer_id, score, now));
                }
                actions
            }
        }
    }

    // ------------------------------------------------------------------
    // announcement / broadcast
    // ------------------------------------------------------------------

    /// Announce a newly connected block to every other ready peer.
    fn announce_block(
        &mut self,
        backend: &mut impl PoolBackend,
        hash: Hash256,
        from: PeerId,
    ) -> Vec<PoolAction> {
        let mut actions = Vec::new();
        let header = backend.get_block(&hash).map(|block| block.header);
        for peer in self.peers.values_mut() {
            if peer.id == from || !peer.is_ready() || peer.knows(&hash) {
                continue;
            }
            peer.mark_known(&hash);
            let message = match (peer.prefers_headers, header) {
                (true, Some(header)) => Message::Headers(vec![header]),
                _ => Message::Inv(vec![InvItem::block(hash)]),
            };
            actions.push(PoolAction::Send { peer: peer.id, message });
        }
        actions
    }

    /// Announce an admitted tx, honoring relay flags, fee filters, and
    /// loaded bloom filters.
    fn announce_tx(
        &mut self,
        backend: &mut impl PoolBackend,
        txid: Hash256,
        from: PeerId,
    ) -> Vec<PoolAction> {
        let tx = backend.get_mempool_tx(&txid);
        let fee_rate = backend.mempool_fee_rate(&txid);
        let mut actions = Vec::new();
        for peer in self.peers.values_mut() {
            if peer.id == from || !peer.is_ready() || peer.knows(&txid) || !peer.relay {
                continue;
            }
            if !peer.passes_fee_filter(fee_rate) {
                continue;
            }
            if let (Some(bloom), Some(tx)) = (peer.bloom.as_mut(), tx.as_ref()) {
                if !bloom.matches_tx(tx) {
                    continue;
                }
            }
            peer.mark_known(&txid);
            actions.push(PoolAction::Send {
                peer: peer.id,
                message: Message::Inv(vec![InvItem::tx(txid)]),
            });
        }
        actions
    }

    /// Push a transaction until some peer requests it.
    pub fn broadcast_tx(&mut self, tx: Transaction, fee_rate: u64, now: u64) -> Vec<PoolAction> {
        let txid = tx.txid();
        self.broadcasts.insert(
            txid,
            BroadcastItem {
                payload: BroadcastPayload::Tx { tx, fee_rate },
                deadline: now + BROADCAST_TIMEOUT,
                acked: false,
            },
        );
        let mut actions = Vec::new();
        for peer in self.peers.values_mut() {
            if !peer.is_ready() || !peer.relay || !peer.passes_fee_filter(fee_rate) {
                continue;
            }
            peer.mark_known(&txid);
            actions.push(PoolAction::Send {
                peer: peer.id,
                message: Message::Inv(vec![InvItem::tx(txid)]),
            });
        }
        actions
    }

    /// Push a freshly mined or relayed block.
    pub fn broadcast_block(&mut self, block: Block, now: u64) -> Vec<PoolAction> {
        let hash = block.hash();
        let header = block.header;
        self.broadcasts.insert(
            hash,
            BroadcastItem {
                payload: BroadcastPayload::Block(block),
                deadline: now + BROADCAST_TIMEOUT,
                acked: false,
            },
        );
        let mut actions = Vec::new();
        for peer in self.peers.values_mut() {
            if !peer.is_ready() {
                continue;
            }
            peer.mark_known(&hash);
            let message = if peer.prefers_headers {
                Message::Headers(vec![header])
            } else {
                Message::Inv(vec![InvItem::block(hash)])
            };
            actions.push(PoolAction::Send { peer: peer.id, message });
        }
        actions
    }

    // ------------------------------------------------------------------
    // timers / misbehavior
    // ------------------------------------------------------------------

    /// Periodic maintenance: request timeouts, broadcast expiry, pings, ban
    /// sweeps.
    pub fn on_tick(&mut self, backend: &mut impl PoolBackend, now: u64) -> Vec<PoolAction> {
        self.sweep_bans(now);
        let mut actions = Vec::new();

        // Expired requests: free the hash and drop stalling peers.
        let mut stalled: Vec<PeerId> = Vec::new();
        for peer in self.peers.values_mut() {
            for hash in peer.expired_requests(now) {
                let was_block = peer.blocks_in_flight.remove(&hash).is_some();
                peer.txs_in_flight.remove(&hash);
                self.requests.remove(&hash);
                if was_block {
                    self.pending_blocks.push_front(hash);
                    stalled.push(peer.id);
                }
            }
        }
        for peer_id in stalled {
            warn!(peer = peer_id, "dropping stalling peer");
            actions.push(PoolAction::Disconnect {
                peer: peer_id,
                reason: NetError::Timeout.to_string(),
            });
        }

        // Broadcast expiry.
        let expired: Vec<Hash256> = self
            .broadcasts
            .iter()
            .filter(|(_, item)| item.deadline <= now)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in expired {
            self.broadcasts.remove(&hash);
            actions.push(PoolAction::Event(PoolEvent::BroadcastTimeout { hash }));
        }

        // Keepalive pings.
        for peer in self.peers.values_mut() {
            if peer.is_ready() && peer.ping_nonce.is_none() && now.saturating_sub(peer.last_recv) > 120
            {
                let nonce = random();
                peer.ping_nonce = Some(nonce);
                actions.push(PoolAction::Send { peer: peer.id, message: Message::Ping(nonce) });
            }
        }

        // A lost loader is replaced when possible.
        if self.loader.is_none() {
            actions.extend(self.maybe_start_sync(backend));
        }
        actions
    }

    /// Bump a peer's misbehavior score; at the threshold the host is banned
    /// and the connection dropped.
    pub fn set_misbehavior(&mut self, peer_id: PeerId, score: i32, now: u64) -> Vec<PoolAction> {
        self.misbehave_with_reason(peer_id, score, "misbehavior", now)
    }

    fn misbehave_with_reason(
        &mut self,
        peer_id: PeerId,
        score: i32,
        reason: &str,
        now: u64,
    ) -> Vec<PoolAction> {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return Vec::new();
        };
        peer.ban_score = peer.ban_score.saturating_add(score.max(0));
        debug!(peer = peer_id, score = peer.ban_score, reason, "misbehavior");
        if peer.ban_score >= self.options.ban_threshold {
            let host = peer.addr.ip();
            self.banned.insert(host, now);
            warn!(peer = peer_id, %host, "peer banned");
            return vec![
                PoolAction::Event(PoolEvent::PeerBanned { peer: peer_id, host }),
                PoolAction::Disconnect { peer: peer_id, reason: reason.to_string() },
            ];
        }
        Vec::new()
    }

    /// Ban score of a peer, for diagnostics.
    pub fn ban_score(&self, peer_id: PeerId) -> i32 {
        self.peers.get(&peer_id).map(|peer| peer.ban_score).unwrap_or(0)
    }
}

/// Witness-stripped copy of a transaction.
fn strip_tx(tx: &Transaction) -> Transaction {
    use kestrel_core::codec::Decodable;
    Transaction::decode(&tx.encode_base()).expect("base encoding is valid")
}

/// Witness-stripped copy of a block.
fn strip_block(block: &Block) -> Block {
    Block { header: block.header, txs: block.txs.iter().map(strip_tx).collect() }
}
