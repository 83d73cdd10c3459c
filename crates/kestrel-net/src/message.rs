//! Typed wire messages and their payload codecs.
//!
//! Payload formats follow the reference protocol definitions. Unknown
//! commands decode into [`Message::Unknown`] and are ignored by the pool.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use kestrel_core::block::{Block, BlockHeader};
use kestrel_core::codec::{self, Decodable, Encodable, Reader};
use kestrel_core::constants::{MAX_HEADERS_RESULTS, MAX_INV_ITEMS, MAX_LOCATOR_HASHES};
use kestrel_core::hash::Hash256;
use kestrel_core::merkle::PartialMerkleTree;
use kestrel_core::tx::Transaction;

use crate::error::NetError;
use crate::inv::InvItem;

/// Service bit: full chain data.
pub const SERVICE_NETWORK: u64 = 1;
/// Service bit: BIP37 bloom filtering.
pub const SERVICE_BLOOM: u64 = 1 << 2;
/// Service bit: segregated witness (BIP144).
pub const SERVICE_WITNESS: u64 = 1 << 3;

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: i32 = 70015;

/// Minimum peer version tolerated.
pub const MIN_PROTOCOL_VERSION: i32 = 70001;

/// A network endpoint with its advertised services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAddress {
    pub services: u64,
    /// IPv6, with IPv4 mapped into `::ffff:a.b.c.d`.
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetAddress {
    pub fn from_socket(addr: SocketAddr, services: u64) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        Self { services, ip, port: addr.port() }
    }

    pub fn socket(&self) -> SocketAddr {
        let v6 = Ipv6Addr::from(self.ip);
        match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), self.port),
            None => SocketAddr::new(IpAddr::V6(v6), self.port),
        }
    }

    pub fn unspecified() -> Self {
        Self { services: 0, ip: Ipv6Addr::UNSPECIFIED.octets(), port: 0 }
    }
}

impl Encodable for NetAddress {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.services.to_le_bytes());
        buf.extend_from_slice(&self.ip);
        buf.extend_from_slice(&self.port.to_be_bytes());
    }
}

impl Decodable for NetAddress {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, kestrel_core::error::CodecError> {
        let services = r.read_u64()?;
        let mut ip = [0u8; 16];
        ip.copy_from_slice(r.read_bytes(16)?);
        let port_bytes = r.read_bytes(2)?;
        let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);
        Ok(Self { services, ip, port })
    }
}

/// The `version` handshake payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPayload {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub recv: NetAddress,
    pub from: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

/// One wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionPayload),
    Verack,
    Ping(u64),
    Pong(u64),
    GetAddr,
    Addr(Vec<(u32, NetAddress)>),
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    NotFound(Vec<InvItem>),
    GetBlocks { locator: Vec<Hash256>, stop: Hash256 },
    GetHeaders { locator: Vec<Hash256>, stop: Hash256 },
    Headers(Vec<BlockHeader>),
    Tx(Transaction),
    Block(Block),
    MerkleBlock { header: BlockHeader, tree: PartialMerkleTree },
    Mempool,
    FilterLoad { filter: Vec<u8>, hash_funcs: u32, tweak: u32, flags: u8 },
    FilterAdd(Vec<u8>),
    FilterClear,
    Reject { message: String, code: u8, reason: String, hash: Option<Hash256> },
    SendHeaders,
    FeeFilter(i64),
    SendCmpct { announce: bool, version: u64 },
    Unknown { command: String, payload: Vec<u8> },
}

impl Message {
    /// The 12-byte command this message frames as.
    pub fn command(&self) -> &str {
        match self {
            Self::Version(_) => "version",
            Self::Verack => "verack",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::GetAddr => "getaddr",
            Self::Addr(_) => "addr",
            Self::Inv(_) => "inv",
            Self::GetData(_) => "getdata",
            Self::NotFound(_) => "notfound",
            Self::GetBlocks { .. } => "getblocks",
            Self::GetHeaders { .. } => "getheaders",
            Self::Headers(_) => "headers",
            Self::Tx(_) => "tx",
            Self::Block(_) => "block",
            Self::MerkleBlock { .. } => "merkleblock",
            Self::Mempool => "mempool",
            Self::FilterLoad { .. } => "filterload",
            Self::FilterAdd(_) => "filteradd",
            Self::FilterClear => "filterclear",
            Self::Reject { .. } => "reject",
            Self::SendHeaders => "sendheaders",
            Self::FeeFilter(_) => "feefilter",
            Self::SendCmpct { .. } => "sendcmpct",
            Self::Unknown { command, .. } => command,
        }
    }

    /// Serialize the payload (frame header excluded).
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Version(v) => {
                buf.extend_from_slice(&v.version.to_le_bytes());
                buf.extend_from_slice(&v.services.to_le_bytes());
                buf.extend_from_slice(&v.timestamp.to_le_bytes());
                v.recv.encode_to(&mut buf);
                v.from.encode_to(&mut buf);
                buf.extend_from_slice(&v.nonce.to_le_bytes());
                codec::write_var_bytes(&mut buf, v.user_agent.as_bytes());
                buf.extend_from_slice(&v.start_height.to_le_bytes());
                buf.push(v.relay as u8);
            }
            Self::Verack | Self::GetAddr | Self::Mempool | Self::FilterClear
            | Self::SendHeaders => {}
            Self::Ping(nonce) | Self::Pong(nonce) => {
                buf.extend_from_slice(&nonce.to_le_bytes());
            }
            Self::Addr(entries) => {
                codec::write_varint(&mut buf, entries.len() as u64);
                for (time, addr) in entries {
                    buf.extend_from_slice(&time.to_le_bytes());
                    addr.encode_to(&mut buf);
                }
            }
            Self::Inv(items) | Self::GetData(items) | Self::NotFound(items) => {
                codec::write_varint(&mut buf, items.len() as u64);
                for item in items {
                    item.encode_to(&mut buf);
                }
            }
            Self::GetBlocks { locator, stop } | Self::GetHeaders { locator, stop } => {
                buf.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
                codec::write_varint(&mut buf, locator.len() as u64);
                for hash in locator {
                    hash.encode_to(&mut buf);
                }
                stop.encode_to(&mut buf);
            }
            Self::Headers(headers) => {
                codec::write_varint(&mut buf, headers.len() as u64);
                for header in headers {
                    header.encode_to(&mut buf);
                    // Each header carries a zero tx count on the wire.
                    codec::write_varint(&mut buf, 0);
                }
            }
            Self::Tx(tx) => tx.encode_to(&mut buf),
            Self::Block(block) => block.encode_to(&mut buf),
            Self::MerkleBlock { header, tree } => {
                header.encode_to(&mut buf);
                tree.encode_to(&mut buf);
            }
            Self::FilterLoad { filter, hash_funcs, tweak, flags } => {
                codec::write_var_bytes(&mut buf, filter);
                buf.extend_from_slice(&hash_funcs.to_le_bytes());
                buf.extend_from_slice(&tweak.to_le_bytes());
                buf.push(*flags);
            }
            Self::FilterAdd(data) => codec::write_var_bytes(&mut buf, data),
            Self::Reject { message, code, reason, hash } => {
                codec::write_var_bytes(&mut buf, message.as_bytes());
                buf.push(*code);
                codec::write_var_bytes(&mut buf, reason.as_bytes());
                if let Some(hash) = hash {
                    hash.encode_to(&mut buf);
                }
            }
            Self::FeeFilter(rate) => buf.extend_from_slice(&rate.to_le_bytes()),
            Self::SendCmpct { announce, version } => {
                buf.push(*announce as u8);
                buf.extend_from_slice(&version.to_le_bytes());
            }
            Self::Unknown { payload, .. } => buf.extend_from_slice(payload),
        }
        buf
    }

    /// Decode a payload for a framed command.
    pub fn decode_payload(command: &str, payload: &[u8]) -> Result<Self, NetError> {
        let bad = |reason: &str| NetError::BadPayload {
            command: command.to_string(),
            reason: reason.to_string(),
        };
        let mut r = Reader::new(payload);
        let message = match command {
            "version" => {
                let version = r.read_i32().map_err(|e| bad(&e.to_string()))?;
                let services = r.read_u64().map_err(|e| bad(&e.to_string()))?;
                let timestamp = r.read_i64().map_err(|e| bad(&e.to_string()))?;
                let recv = NetAddress::decode_from(&mut r).map_err(|e| bad(&e.to_string()))?;
                let from = NetAddress::decode_from(&mut r).map_err(|e| bad(&e.to_string()))?;
                let nonce = r.read_u64().map_err(|e| bad(&e.to_string()))?;
                let agent = r.read_var_bytes().map_err(|e| bad(&e.to_string()))?;
                let start_height = r.read_i32().map_err(|e| bad(&e.to_string()))?;
                // Absent relay flag defaults on (pre-BIP37 peers).
                let relay = r.read_u8().map(|b| b != 0).unwrap_or(true);
                Self::Version(VersionPayload {
                    version,
                    services,
                    timestamp,
                    recv,
                    from,
                    nonce,
                    user_agent: String::from_utf8_lossy(&agent).into_owned(),
                    start_height,
                    relay,
                })
            }
            "verack" => Self::Verack,
            "ping" => Self::Ping(r.read_u64().map_err(|e| bad(&e.to_string()))?),
            "pong" => Self::Pong(r.read_u64().map_err(|e| bad(&e.to_string()))?),
            "getaddr" => Self::GetAddr,
            "addr" => {
                let count = r.read_count(30).map_err(|e| bad(&e.to_string()))?;
                if count > 1000 {
                    return Err(bad("too many addresses"));
                }
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let time = r.read_u32().map_err(|e| bad(&e.to_string()))?;
                    let addr =
                        NetAddress::decode_from(&mut r).map_err(|e| bad(&e.to_string()))?;
                    entries.push((time, addr));
                }
                Self::Addr(entries)
            }
            "inv" | "getdata" | "notfound" => {
                let count = r.read_count(36).map_err(|e| bad(&e.to_string()))?;
                if count > MAX_INV_ITEMS {
                    return Err(bad("too many inventory items"));
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(InvItem::decode_from(&mut r).map_err(|e| bad(&e.to_string()))?);
                }
                match command {
                    "inv" => Self::Inv(items),
                    "getdata" => Self::GetData(items),
                    _ => Self::NotFound(items),
                }
            }
            "getblocks" | "getheaders" => {
                let _version = r.read_u32().map_err(|e| bad(&e.to_string()))?;
                let count = r.read_count(32).map_err(|e| bad(&e.to_string()))?;
                if count > MAX_LOCATOR_HASHES {
                    return Err(bad("locator too long"));
                }
                let mut locator = Vec::with_capacity(count);
                for _ in 0..count {
                    locator.push(r.read_hash().map_err(|e| bad(&e.to_string()))?);
                }
                let stop = r.read_hash().map_err(|e| bad(&e.to_string()))?;
                if command == "getblocks" {
                    Self::GetBlocks { locator, stop }
                } else {
                    Self::GetHeaders { locator, stop }
                }
            }
            "headers" => {
                let count = r.read_count(81).map_err(|e| bad(&e.to_string()))?;
                if count > MAX_HEADERS_RESULTS {
                    return Err(bad("too many headers"));
                }
                let mut headers = Vec::with_capacity(count);
                for _ in 0..count {
                    headers
                        .push(BlockHeader::decode_from(&mut r).map_err(|e| bad(&e.to_string()))?);
                    let tx_count = r.read_varint().map_err(|e| bad(&e.to_string()))?;
                    if tx_count != 0 {
                        return Err(bad("nonzero header tx count"));
                    }
                }
                Self::Headers(headers)
            }
            "tx" => Self::Tx(Transaction::decode(payload).map_err(|e| bad(&e.to_string()))?),
            "block" => Self::Block(Block::decode(payload).map_err(|e| bad(&e.to_string()))?),
            "merkleblock" => {
                let header =
                    BlockHeader::decode_from(&mut r).map_err(|e| bad(&e.to_string()))?;
                let tree =
                    PartialMerkleTree::decode_from(&mut r).map_err(|e| bad(&e.to_string()))?;
                Self::MerkleBlock { header, tree }
            }
            "mempool" => Self::Mempool,
            "filterload" => {
                let filter = r.read_var_bytes().map_err(|e| bad(&e.to_string()))?;
                let hash_funcs = r.read_u32().map_err(|e| bad(&e.to_string()))?;
                let tweak = r.read_u32().map_err(|e| bad(&e.to_string()))?;
                let flags = r.read_u8().map_err(|e| bad(&e.to_string()))?;
                Self::FilterLoad { filter, hash_funcs, tweak, flags }
            }
            "filteradd" => {
                Self::FilterAdd(r.read_var_bytes().map_err(|e| bad(&e.to_string()))?)
            }
            "filterclear" => Self::FilterClear,
            "reject" => {
                let message = r.read_var_bytes().map_err(|e| bad(&e.to_string()))?;
                let code = r.read_u8().map_err(|e| bad(&e.to_string()))?;
                let reason = r.read_var_bytes().map_err(|e| bad(&e.to_string()))?;
                let hash = if r.remaining() >= 32 {
                    Some(r.read_hash().map_err(|e| bad(&e.to_string()))?)
                } else {
                    None
                };
                Self::Reject {
                    message: String::from_utf8_lossy(&message).into_owned(),
                    code,
                    reason: String::from_utf8_lossy(&reason).into_owned(),
                    hash,
                }
            }
            "sendheaders" => Self::SendHeaders,
            "feefilter" => Self::FeeFilter(r.read_i64().map_err(|e| bad(&e.to_string()))?),
            "sendcmpct" => {
                let announce = r.read_u8().map_err(|e| bad(&e.to_string()))? != 0;
                let version = r.read_u64().map_err(|e| bad(&e.to_string()))?;
                Self::SendCmpct { announce, version }
            }
            _ => Self::Unknown { command: command.to_string(), payload: payload.to_vec() },
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inv::InvType;

    fn round_trip(message: Message) -> Message {
        let payload = message.encode_payload();
        Message::decode_payload(message.command(), &payload).unwrap()
    }

    fn sample_version() -> Message {
        Message::Version(VersionPayload {
            version: PROTOCOL_VERSION,
            services: SERVICE_NETWORK | SERVICE_WITNESS,
            timestamp: 1_600_000_000,
            recv: NetAddress::from_socket("10.0.0.1:8333".parse().unwrap(), SERVICE_NETWORK),
            from: NetAddress::unspecified(),
            nonce: 0xdead_beef,
            user_agent: "/kestrel:0.1.0/".into(),
            start_height: 700_000,
            relay: true,
        })
    }

    #[test]
    fn version_round_trip() {
        let message = sample_version();
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn version_address_mapping() {
        let addr = NetAddress::from_socket("10.0.0.1:8333".parse().unwrap(), 0);
        assert_eq!(addr.socket(), "10.0.0.1:8333".parse().unwrap());
        let v6 = NetAddress::from_socket("[2001:db8::1]:18333".parse().unwrap(), 0);
        assert_eq!(v6.socket(), "[2001:db8::1]:18333".parse().unwrap());
    }

    #[test]
    fn empty_payload_commands() {
        for message in [Message::Verack, Message::GetAddr, Message::Mempool,
                        Message::FilterClear, Message::SendHeaders] {
            assert!(message.encode_payload().is_empty());
            assert_eq!(round_trip(message.clone()), message);
        }
    }

    #[test]
    fn ping_pong_round_trip() {
        assert_eq!(round_trip(Message::Ping(42)), Message::Ping(42));
        assert_eq!(round_trip(Message::Pong(7)), Message::Pong(7));
    }

    #[test]
    fn inv_round_trip() {
        let message = Message::Inv(vec![
            InvItem::tx(Hash256([1; 32])),
            InvItem::block(Hash256([2; 32])),
        ]);
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn getdata_preserves_witness_mask() {
        let message = Message::GetData(vec![InvItem::block(Hash256([3; 32])).with_witness()]);
        match round_trip(message) {
            Message::GetData(items) => {
                assert!(items[0].witness);
                assert_eq!(items[0].inv_type, InvType::Block);
            }
            other => panic!("wrong variant {other:?}"),
        }
    }

    #[test]
    fn getheaders_round_trip() {
        let message = Message::GetHeaders {
            locator: vec![Hash256([1; 32]), Hash256([2; 32])],
            stop: Hash256::ZERO,
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn headers_round_trip() {
        let header = BlockHeader {
            version: 4,
            prev: Hash256([1; 32]),
            merkle_root: Hash256([2; 32]),
            time: 1_600_000_000,
            bits: 0x1d00ffff,
            nonce: 99,
        };
        let message = Message::Headers(vec![header, header]);
        let payload = message.encode_payload();
        // 80-byte header plus one zero varint each.
        assert_eq!(payload.len(), 1 + 2 * 81);
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn headers_reject_nonzero_tx_count() {
        let header = BlockHeader {
            version: 4,
            prev: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            time: 0,
            bits: 0,
            nonce: 0,
        };
        let mut payload = Vec::new();
        codec::write_varint(&mut payload, 1);
        header.encode_to(&mut payload);
        codec::write_varint(&mut payload, 1);
        assert!(Message::decode_payload("headers", &payload).is_err());
    }

    #[test]
    fn reject_round_trip() {
        let message = Message::Reject {
            message: "tx".into(),
            code: 0x42,
            reason: "insufficient-fee".into(),
            hash: Some(Hash256([5; 32])),
        };
        assert_eq!(round_trip(message.clone()), message);
        let no_hash = Message::Reject {
            message: "version".into(),
            code: 0x01,
            reason: "malformed".into(),
            hash: None,
        };
        assert_eq!(round_trip(no_hash.clone()), no_hash);
    }

    #[test]
    fn feefilter_round_trip() {
        assert_eq!(round_trip(Message::FeeFilter(1000)), Message::FeeFilter(1000));
    }

    #[test]
    fn sendcmpct_round_trip() {
        let message = Message::SendCmpct { announce: false, version: 1 };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn filterload_round_trip() {
        let message = Message::FilterLoad {
            filter: vec![0xaa, 0xbb],
            hash_funcs: 11,
            tweak: 0xdeadbeef,
            flags: 1,
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn unknown_command_passthrough() {
        let decoded = Message::decode_payload("cmpctblock", &[1, 2, 3]).unwrap();
        match decoded {
            Message::Unknown { command, payload } => {
                assert_eq!(command, "cmpctblock");
                assert_eq!(payload, vec![1, 2, 3]);
            }
            other => panic!("wrong variant {other:?}"),
        }
    }

    #[test]
    fn oversized_inv_rejected() {
        let mut payload = Vec::new();
        codec::write_varint(&mut payload, (MAX_INV_ITEMS + 1) as u64);
        // Provide enough bytes for the count sanity bound.
        payload.extend_from_slice(&vec![0u8; 36 * (MAX_INV_ITEMS + 1)]);
        assert!(Message::decode_payload("inv", &payload).is_err());
    }
}
