use super::error::WireError;
use super::message::{Handshake, Message, HANDSHAKE_LEN};
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// A TCP stream speaking the length-prefixed wire framing.
///
/// Carries the handshake exchange, then splits into independent read and
/// write halves so a session can run full duplex.
pub struct WireTransport {
    stream: TcpStream,
    read_buf: BytesMut,
}

impl WireTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(32 * 1024),
        }
    }

    pub fn peer_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.stream.peer_addr()
    }

    pub async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), WireError> {
        let data = handshake.encode();
        timeout(HANDSHAKE_TIMEOUT, self.stream.write_all(&data))
            .await
            .map_err(|_| WireError::Timeout)??;
        Ok(())
    }

    pub async fn receive_handshake(&mut self) -> Result<Handshake, WireError> {
        while self.read_buf.len() < HANDSHAKE_LEN {
            let n = timeout(HANDSHAKE_TIMEOUT, self.stream.read_buf(&mut self.read_buf))
                .await
                .map_err(|_| WireError::Timeout)??;
            if n == 0 {
                return Err(WireError::Handshake("connection closed".into()));
            }
        }

        let data = self.read_buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&data)
    }

    /// Splits into framed halves. Any bytes already buffered past the
    /// handshake carry over to the reader.
    pub fn split(self) -> (FrameReader, FrameWriter) {
        let (read_half, write_half) = self.stream.into_split();
        (
            FrameReader {
                read_half,
                buf: self.read_buf,
            },
            FrameWriter { write_half },
        )
    }
}

/// Reads complete frames from the inbound half of a session.
pub struct FrameReader {
    read_half: OwnedReadHalf,
    buf: BytesMut,
}

impl FrameReader {
    /// Reads one complete frame and decodes it. The caller wraps this in its
    /// own idle deadline.
    pub async fn read_message(&mut self) -> Result<Message, WireError> {
        while self.buf.len() < 4 {
            self.fill().await?;
        }

        let length =
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(WireError::Framing(format!("frame too large: {}", length)));
        }

        let total = 4 + length;
        while self.buf.len() < total {
            self.fill().await?;
        }

        let frame = self.buf.split_to(total);
        Message::decode(frame.freeze())
    }

    async fn fill(&mut self) -> Result<(), WireError> {
        let n = self.read_half.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(WireError::SessionClosed);
        }
        Ok(())
    }
}

/// Writes frames to the outbound half of a session.
pub struct FrameWriter {
    write_half: OwnedWriteHalf,
}

impl FrameWriter {
    pub async fn send(&mut self, message: &Message) -> Result<(), WireError> {
        let data = message.encode();
        timeout(WRITE_TIMEOUT, self.write_half.write_all(&data))
            .await
            .map_err(|_| WireError::Timeout)??;
        Ok(())
    }
}
