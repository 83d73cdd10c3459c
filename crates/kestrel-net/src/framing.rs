//! Wire message framing.
//!
//! Every message is `magic(4) ∥ command(12, NUL-padded ASCII) ∥ length(4 LE)
//! ∥ checksum(4) ∥ payload`. The receiver validates magic first (a mismatch
//! drops the connection), then bounds the length, and only then verifies the
//! checksum and allocates the payload buffer.

use kestrel_core::constants::MAX_MESSAGE_SIZE;
use kestrel_core::hash::checksum;

use crate::error::NetError;

/// Frame header size on the wire.
pub const HEADER_SIZE: usize = 24;

/// A parsed frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub command: String,
    pub length: u32,
    pub checksum: [u8; 4],
}

/// Serialize one framed message.
pub fn frame(magic: [u8; 4], command: &str, payload: &[u8]) -> Vec<u8> {
    debug_assert!(command.len() <= 12);
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&magic);
    let mut cmd = [0u8; 12];
    cmd[..command.len()].copy_from_slice(command.as_bytes());
    out.extend_from_slice(&cmd);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&checksum(payload));
    out.extend_from_slice(payload);
    out
}

/// Parse and validate a frame header.
///
/// Checks run in order: magic, command field shape, then length bound. The
/// checksum is deferred to [`check_payload`] once the payload has arrived.
pub fn parse_header(bytes: &[u8; HEADER_SIZE], magic: [u8; 4]) -> Result<FrameHeader, NetError> {
    if bytes[0..4] != magic {
        return Err(NetError::BadMagic);
    }
    let cmd = &bytes[4..16];
    let end = cmd.iter().position(|b| *b == 0).unwrap_or(12);
    // NUL padding must be contiguous and the name printable ASCII.
    if cmd[end..].iter().any(|b| *b != 0) || !cmd[..end].iter().all(|b| b.is_ascii_graphic()) {
        return Err(NetError::BadCommand);
    }
    let command = String::from_utf8_lossy(&cmd[..end]).into_owned();
    let length = u32::from_le_bytes(bytes[16..20].try_into().expect("sized"));
    if length as usize > MAX_MESSAGE_SIZE {
        return Err(NetError::OversizedPayload(length as u64));
    }
    let mut sum = [0u8; 4];
    sum.copy_from_slice(&bytes[20..24]);
    Ok(FrameHeader { command, length, checksum: sum })
}

/// Verify the payload against the header checksum.
pub fn check_payload(header: &FrameHeader, payload: &[u8]) -> Result<(), NetError> {
    if payload.len() != header.length as usize {
        return Err(NetError::BadPayload {
            command: header.command.clone(),
            reason: "length mismatch".into(),
        });
    }
    if checksum(payload) != header.checksum {
        return Err(NetError::BadChecksum);
    }
    Ok(())
}
