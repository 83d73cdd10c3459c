//! Tokio transport: framed message IO over a TCP stream.
//!
//! The pool itself is a synchronous state machine; this layer moves bytes.
//! Reads validate the frame header (magic, command, length) before the
//! payload buffer is allocated and the checksum before the payload is
//! parsed.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::NetError;
use crate::framing::{self, HEADER_SIZE};
use crate::message::Message;

/// Reading half of a peer connection.
pub struct MessageReader {
    stream: OwnedReadHalf,
    magic: [u8; 4],
}

/// Writing half of a peer connection.
pub struct MessageWriter {
    stream: OwnedWriteHalf,
    magic: [u8; 4],
}

/// Split a connected stream into framed halves.
pub fn split(stream: TcpStream, magic: [u8; 4]) -> (MessageReader, MessageWriter) {
    let (read, write) = stream.into_split();
    (
        MessageReader { stream: read, magic },
        MessageWriter { stream: write, magic },
    )
}

impl MessageReader {
    /// Read one framed message.
    pub async fn read_message(&mut self) -> Result<Message, NetError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        self.stream.read_exact(&mut header_bytes).await?;
        let header = framing::parse_header(&header_bytes, self.magic)?;

        let mut payload = vec![0u8; header.length as usize];
        if header.length > 0 {
            self.stream.read_exact(&mut payload).await?;
        }
        framing::check_payload(&header, &payload)?;
        Message::decode_payload(&header.command, &payload)
    }
}

impl MessageWriter {
    /// Write one framed message and flush.
    pub async fn write_message(&mut self, message: &Message) -> Result<(), NetError> {
        let payload = message.encode_payload();
        let framed = framing::frame(self.magic, message.command(), &payload);
        self.stream.write_all(&framed).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

    #[tokio::test]
    async fn round_trip_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (_, mut writer) = split(stream, MAGIC);
            writer.write_message(&Message::Ping(77)).await.unwrap();
            writer.write_message(&Message::Verack).await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (mut reader, _) = split(stream, MAGIC);
        assert_eq!(reader.read_message().await.unwrap(), Message::Ping(77));
        assert_eq!(reader.read_message().await.unwrap(), Message::Verack);
        client.await.unwrap();
    }

    #[tokio::test]
    async fn bad_magic_surfaces_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (_, mut writer) = split(stream, [0, 1, 2, 3]);
            writer.write_message(&Message::Ping(1)).await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (mut reader, _) = split(stream, MAGIC);
        assert_eq!(reader.read_message().await.unwrap_err(), NetError::BadMagic);
        client.await.unwrap();
    }

    #[tokio::test]
    async fn closed_connection_reports_peer_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            drop(stream);
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (mut reader, _) = split(stream, MAGIC);
        assert_eq!(reader.read_message().await.unwrap_err(), NetError::PeerClosed);
        client.await.unwrap();
    }
}
