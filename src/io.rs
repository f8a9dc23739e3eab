use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::wire::{FrameDecoder, FrameEncoder, WireMessage};

/// Write half of a peer transport. Behind a trait so tests can swap the
/// framed TCP half for a channel-backed fake.
#[async_trait]
pub trait MessageWriter: Send + Sync + std::fmt::Debug {
    async fn write_message(&mut self, msg: &WireMessage) -> Result<()>;

    /// Flush and shut down the transport; best effort.
    async fn close(&mut self) -> Result<()>;
}

/// Read half of a peer transport. `Ok(None)` means the remote closed
/// the stream cleanly.
#[async_trait]
pub trait MessageReader: Send + std::fmt::Debug {
    async fn read_message(&mut self) -> Result<Option<WireMessage>>;
}

pub struct TcpMessageWriter {
    inner: FramedWrite<OwnedWriteHalf, FrameEncoder>,
}

pub struct TcpMessageReader {
    inner: FramedRead<OwnedReadHalf, FrameDecoder>,
}

/// Splits a connected stream into framed reader and writer halves.
pub fn split_stream(stream: TcpStream) -> (TcpMessageReader, TcpMessageWriter) {
    let (read_half, write_half) = stream.into_split();
    (
        TcpMessageReader {
            inner: FramedRead::new(read_half, FrameDecoder),
        },
        TcpMessageWriter {
            inner: FramedWrite::new(write_half, FrameEncoder),
        },
    )
}

#[async_trait]
impl MessageWriter for TcpMessageWriter {
    async fn write_message(&mut self, msg: &WireMessage) -> Result<()> {
        self.inner.send(msg.clone()).await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

#[async_trait]
impl MessageReader for TcpMessageReader {
    async fn read_message(&mut self) -> Result<Option<WireMessage>> {
        self.inner.next().await.transpose()
    }
}

impl std::fmt::Debug for TcpMessageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpMessageWriter").finish()
    }
}

impl std::fmt::Debug for TcpMessageReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpMessageReader").finish()
    }
}
