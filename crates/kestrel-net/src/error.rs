//! Network error types.
//!
//! Net errors are per-peer: the offending connection is dropped and the pool
//! replaces it. They never bubble into the chain.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    #[error("bad magic bytes")] BadMagic,
    #[error("malformed command field")] BadCommand,
    #[error("payload length {0} exceeds limit")] OversizedPayload(u64),
    #[error("checksum mismatch")] BadChecksum,
    #[error("malformed payload for {command}: {reason}")] BadPayload { command: String, reason: String },
    #[error("peer timed out")] Timeout,
    #[error("peer closed")] PeerClosed,
    #[error("handshake violation: {0}")] Handshake(&'static str),
    #[error("too many peers")] TooManyPeers,
    #[error("host is ban listed")] BanListed,
    #[error("io: {0}")] Io(String),
}

impl From<std::io::Error> for NetError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::PeerClosed,
            std::io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Io(err.to_string()),
        }
    }
}
