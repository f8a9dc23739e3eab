use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::bitfield::Bitfield;
use crate::error::{Result, TorrentError};
use crate::io::{MessageReader, MessageWriter, split_stream};
use crate::request_map::RequestMap;
use crate::tracker::PeerInfo;
use crate::wire::WireMessage;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const PROTOCOL: &[u8] = b"BitTorrent protocol";

/// One authenticated duplex stream to a remote peer. Created by a
/// successful handshake and bitfield exchange; torn down by `close` or
/// a fatal I/O error, never reconnected.
#[derive(Debug)]
pub struct PeerSession {
    peer: PeerInfo,
    remote_bitfield: Bitfield,
    writer: tokio::sync::Mutex<Box<dyn MessageWriter>>,
    reader: std::sync::Mutex<Option<Box<dyn MessageReader>>>,
    /// Requests sent to this peer that have seen neither a PIECE nor a
    /// CANCEL yet.
    outstanding: Arc<RequestMap>,
}

impl PeerSession {
    /// Dials the peer and runs the session bring-up: 68-byte handshake
    /// both ways, BITFIELD exchange, INTERESTED, then the peer's
    /// UNCHOKE. Any mismatch or I/O error aborts without retry.
    pub async fn connect(
        peer: PeerInfo,
        info_hash: [u8; 20],
        local_id: [u8; 20],
        local_bitfield: &Bitfield,
    ) -> Result<Self> {
        let addr = peer.addr();
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| TorrentError::handshake(&addr, "connect timed out"))?
            .map_err(|e| TorrentError::handshake(&addr, e.to_string()))?;

        exchange_handshake(&mut stream, info_hash, local_id, peer.id, &addr).await?;

        let (mut reader, mut writer) = split_stream(stream);

        writer
            .write_message(&WireMessage::Bitfield(local_bitfield.as_bytes().to_vec()))
            .await?;
        let remote_bitfield = match reader.read_message().await? {
            Some(WireMessage::Bitfield(bytes)) => {
                if bytes.len() != local_bitfield.byte_len() {
                    return Err(TorrentError::handshake(
                        &addr,
                        format!(
                            "remote bitfield has {} bytes, local has {}",
                            bytes.len(),
                            local_bitfield.byte_len()
                        ),
                    )
                    .into());
                }
                Bitfield::from_bytes(bytes, local_bitfield.len())?
            }
            other => {
                return Err(TorrentError::handshake(
                    &addr,
                    format!("expected a bitfield message, got {:?}", other),
                )
                .into());
            }
        };

        writer.write_message(&WireMessage::Interested).await?;
        match reader.read_message().await? {
            Some(WireMessage::Unchoke) => {}
            other => {
                return Err(TorrentError::handshake(
                    &addr,
                    format!("expected an unchoke message, got {:?}", other),
                )
                .into());
            }
        }

        debug!("session with {} established", addr);
        Ok(Self::from_parts(
            peer,
            remote_bitfield,
            Box::new(writer),
            Box::new(reader),
        ))
    }

    /// Assembles a session from an already negotiated transport; the
    /// seam the tests drive with channel-backed halves.
    pub fn from_parts(
        peer: PeerInfo,
        remote_bitfield: Bitfield,
        writer: Box<dyn MessageWriter>,
        reader: Box<dyn MessageReader>,
    ) -> Self {
        Self {
            peer,
            remote_bitfield,
            writer: tokio::sync::Mutex::new(writer),
            reader: std::sync::Mutex::new(Some(reader)),
            outstanding: Arc::new(RequestMap::default()),
        }
    }

    pub fn addr(&self) -> String {
        self.peer.addr()
    }

    pub fn has_piece(&self, piece: u32) -> bool {
        self.remote_bitfield.get(piece as usize)
    }

    pub fn has_outstanding(&self, piece: u32, begin: u32) -> bool {
        self.outstanding.has(piece, begin)
    }

    /// Transmits REQUEST for one block and records it as outstanding.
    pub async fn request_block(&self, piece: u32, begin: u32, length: u32) -> Result<()> {
        if !self.has_piece(piece) {
            return Err(anyhow!(
                "peer {} does not have piece {}",
                self.addr(),
                piece
            ));
        }
        self.outstanding.set(piece, begin);
        self.writer
            .lock()
            .await
            .write_message(&WireMessage::Request {
                piece,
                begin,
                length,
            })
            .await
    }

    /// Transmits CANCEL if the block is outstanding at this peer;
    /// otherwise a no-op.
    pub async fn cancel_block(&self, piece: u32, begin: u32, length: u32) -> Result<()> {
        if !self.outstanding.delete(piece, begin) {
            return Ok(());
        }
        self.writer
            .lock()
            .await
            .write_message(&WireMessage::Cancel {
                piece,
                begin,
                length,
            })
            .await
    }

    pub async fn send_have(&self, piece: u32) -> Result<()> {
        self.writer
            .lock()
            .await
            .write_message(&WireMessage::Have { piece })
            .await
    }

    pub async fn send_keep_alive(&self) -> Result<()> {
        self.writer
            .lock()
            .await
            .write_message(&WireMessage::KeepAlive)
            .await
    }

    /// Spawns the receiver task. Every decoded message is forwarded on
    /// `events`; for a PIECE the per-peer outstanding entry is removed
    /// first, so a forwarded block never has a live record here. Read
    /// failures and EOF go to `errors` and end the task; cancellation
    /// ends it quietly.
    pub fn start_receiving(
        &self,
        events: mpsc::UnboundedSender<WireMessage>,
        errors: mpsc::UnboundedSender<anyhow::Error>,
        cancel: CancellationToken,
    ) {
        let Some(mut reader) = self.reader.lock().expect("session lock poisoned").take() else {
            debug!("receiver for {} already started", self.addr());
            return;
        };
        let outstanding = Arc::clone(&self.outstanding);
        let addr = self.addr();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = reader.read_message() => match result {
                        Ok(Some(msg)) => {
                            if let WireMessage::Piece { piece, begin, .. } = &msg {
                                outstanding.delete(*piece, *begin);
                            }
                            if events.send(msg).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            let _ = errors.send(TorrentError::PeerClosed.into());
                            break;
                        }
                        Err(e) => {
                            let _ = errors.send(e.context(format!("reading from peer {}", addr)));
                            break;
                        }
                    }
                }
            }
            debug!("receiver for {} exiting", addr);
        });
    }

    pub async fn close(&self) {
        if let Err(e) = self.writer.lock().await.close().await {
            debug!("closing session with {}: {:#}", self.addr(), e);
        }
    }
}

async fn exchange_handshake(
    stream: &mut TcpStream,
    info_hash: [u8; 20],
    local_id: [u8; 20],
    expected_id: Option<[u8; 20]>,
    addr: &str,
) -> Result<()> {
    // fixed header, reserved bytes, info hash, peer id
    let mut to_send = [0u8; 68];
    to_send[0] = 19;
    to_send[1..20].copy_from_slice(PROTOCOL);
    to_send[28..48].copy_from_slice(&info_hash);
    to_send[48..68].copy_from_slice(&local_id);
    stream
        .write_all(&to_send)
        .await
        .map_err(|e| TorrentError::handshake(addr, format!("handshake send: {}", e)))?;

    let mut received = [0u8; 68];
    stream
        .read_exact(&mut received)
        .await
        .map_err(|e| TorrentError::handshake(addr, format!("handshake receive: {}", e)))?;

    if received[0] != 19 || &received[1..20] != PROTOCOL {
        return Err(TorrentError::handshake(addr, "invalid fixed header in response").into());
    }
    if received[28..48] != info_hash {
        return Err(TorrentError::handshake(addr, "invalid info hash in response").into());
    }
    // the compact tracker response carries no peer id to check against
    if let Some(expected) = expected_id
        && received[48..68] != expected
    {
        return Err(TorrentError::handshake(addr, "invalid peer id in response").into());
    }

    Ok(())
}
