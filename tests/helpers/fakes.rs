use anyhow::Result;
use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;

use gorrent::bitfield::Bitfield;
use gorrent::io::{MessageReader, MessageWriter};
use gorrent::metainfo::TorrentMetadata;
use gorrent::partial_piece::BLOCK_SIZE;
use gorrent::peer::PeerSession;
use gorrent::tracker::PeerInfo;
use gorrent::wire::WireMessage;

/// Channel-backed write half: messages "sent to the network" show up on
/// the paired receiver.
#[derive(Debug)]
pub struct FakeMessageWriter {
    tx: mpsc::UnboundedSender<WireMessage>,
}

/// Channel-backed read half: whatever the test pushes into the paired
/// sender is "read from the network".
#[derive(Debug)]
pub struct FakeMessageReader {
    rx: mpsc::UnboundedReceiver<WireMessage>,
}

#[async_trait]
impl MessageWriter for FakeMessageWriter {
    async fn write_message(&mut self, msg: &WireMessage) -> Result<()> {
        self.tx
            .send(msg.clone())
            .map_err(|_| anyhow::anyhow!("fake wire closed"))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl MessageReader for FakeMessageReader {
    async fn read_message(&mut self) -> Result<Option<WireMessage>> {
        Ok(self.rx.recv().await)
    }
}

/// The remote end of a fake wire: what the session writes arrives on
/// `from_session`, and whatever goes into `to_session` is read by the
/// session.
pub struct RemoteEnd {
    pub from_session: mpsc::UnboundedReceiver<WireMessage>,
    pub to_session: mpsc::UnboundedSender<WireMessage>,
}

/// Creates a connected fake transport: the session-side halves plus the
/// remote end the test drives.
pub fn fake_wire() -> (Box<dyn MessageWriter>, Box<dyn MessageReader>, RemoteEnd) {
    let (session_tx, remote_rx) = mpsc::unbounded_channel();
    let (remote_tx, session_rx) = mpsc::unbounded_channel();
    (
        Box::new(FakeMessageWriter { tx: session_tx }),
        Box::new(FakeMessageReader { rx: session_rx }),
        RemoteEnd {
            from_session: remote_rx,
            to_session: remote_tx,
        },
    )
}

pub fn test_peer(port: u16) -> PeerInfo {
    PeerInfo {
        id: None,
        ip: "127.0.0.1".parse().unwrap(),
        port,
    }
}

/// Builds a session wired to an in-memory mock peer that answers every
/// REQUEST with the matching PIECE from `torrent_data`. Each requested
/// piece index is echoed on the returned channel, and `duplicates`
/// controls how many times each block is delivered.
pub fn mock_seeding_peer(
    metadata: &TorrentMetadata,
    torrent_data: &[u8],
    bitfield: Bitfield,
    port: u16,
    duplicates: usize,
) -> (PeerSession, mpsc::UnboundedReceiver<u32>) {
    let (writer, reader, mut remote) = fake_wire();
    let (requested_tx, requested_rx) = mpsc::unbounded_channel();

    let piece_length = metadata.piece_length;
    let data = torrent_data.to_vec();
    tokio::spawn(async move {
        while let Some(msg) = remote.from_session.recv().await {
            if let WireMessage::Request {
                piece,
                begin,
                length,
            } = msg
            {
                let _ = requested_tx.send(piece);
                let start = piece as usize * piece_length + begin as usize;
                let block = data[start..start + length as usize].to_vec();
                for _ in 0..duplicates {
                    if remote
                        .to_session
                        .send(WireMessage::Piece {
                            piece,
                            begin,
                            block: block.clone(),
                        })
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
    });

    (
        PeerSession::from_parts(test_peer(port), bitfield, writer, reader),
        requested_rx,
    )
}

/// Deterministic torrent fixture: `total_length` bytes of repeating
/// payload split into pieces of `piece_length`, hashes computed from
/// the data.
pub fn test_torrent(piece_length: usize, total_length: usize) -> (TorrentMetadata, Vec<u8>) {
    let data: Vec<u8> = (0..total_length).map(|i| (i % 251) as u8).collect();
    let pieces: Vec<[u8; 20]> = data
        .chunks(piece_length)
        .map(|chunk| Sha1::digest(chunk).into())
        .collect();

    let metadata = TorrentMetadata {
        announcers: vec!["http://tracker.invalid/announce".to_string()],
        info_hash: [0x42; 20],
        name: "fixture.bin".to_string(),
        piece_length,
        pieces,
        total_length,
        files: vec![],
    };
    (metadata, data)
}

/// A bitfield with exactly the listed pieces set.
pub fn bitfield_with(pieces: &[usize], len: usize) -> Bitfield {
    let mut bf = Bitfield::blank(len);
    for &piece in pieces {
        bf.set(piece).unwrap();
    }
    bf
}

/// Convenience: every piece set.
pub fn full_bitfield(len: usize) -> Bitfield {
    let bits: Vec<usize> = (0..len).collect();
    bitfield_with(&bits, len)
}

#[allow(dead_code)]
pub fn block_count(piece_len: usize) -> usize {
    piece_len.div_ceil(BLOCK_SIZE)
}
