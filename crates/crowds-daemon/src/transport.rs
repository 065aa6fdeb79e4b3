//! Line-delimited JSON over TCP.
//!
//! Each exchange uses a fresh connection: the opener writes one message,
//! optionally reads one reply, and closes. Reads are bounded by
//! `MAX_MESSAGE_SIZE`; there are no read or write timeouts.

use crowds_core::{CodecError, MAX_MESSAGE_SIZE, Message};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid message: {0}")]
    Codec(#[from] CodecError),
    #[error("Message exceeds max size ({0} > {max} bytes)", max = MAX_MESSAGE_SIZE)]
    TooLarge(usize),
}

/// One TCP connection carrying newline-terminated messages.
pub struct LineConnection {
    peer: Option<SocketAddr>,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl LineConnection {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        let (read, write) = stream.into_split();
        Self {
            peer,
            reader: BufReader::new(read),
            writer: write,
        }
    }

    /// Open a connection to `address:port`.
    pub async fn connect(address: &str, port: u16) -> Result<Self, TransportError> {
        let stream = TcpStream::connect((address, port)).await?;
        Ok(Self::new(stream))
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Read the next message. `None` means the peer closed before sending one.
    pub async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        let mut line = Vec::new();
        let limit = (MAX_MESSAGE_SIZE + 1) as u64;
        let read = (&mut self.reader)
            .take(limit)
            .read_until(b'\n', &mut line)
            .await?;

        if read == 0 {
            return Ok(None);
        }
        if line.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::TooLarge(line.len()));
        }
        Ok(Some(Message::decode(&line)?))
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        self.writer.write_all(&message.encode()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Half-close the write side so the peer sees end of stream.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!("Shutdown of connection to {:?} failed: {}", self.peer, e);
        }
    }
}

/// Open a connection, send one message and close.
pub async fn send_once(address: &str, port: u16, message: &Message) -> Result<(), TransportError> {
    let mut conn = LineConnection::connect(address, port).await?;
    conn.send(message).await?;
    conn.shutdown().await;
    Ok(())
}

/// Open a connection, send one message and wait for one reply on it.
pub async fn request(
    address: &str,
    port: u16,
    message: &Message,
) -> Result<Option<Message>, TransportError> {
    let mut conn = LineConnection::connect(address, port).await?;
    conn.send(message).await?;
    let reply = conn.recv().await?;
    conn.shutdown().await;
    Ok(reply)
}
