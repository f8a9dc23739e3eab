use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use log::debug;
use rand::Rng;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{interval, sleep};
use tokio_util::sync::CancellationToken;

use crate::bitfield::Bitfield;
use crate::error::{Result, TorrentError};
use crate::metainfo::TorrentMetadata;
use crate::partial_piece::{BLOCK_SIZE, PartialPiece, build_partial_pieces};
use crate::peer::PeerSession;
use crate::request_map::RequestMap;
use crate::storage::FileStore;
use crate::wire::WireMessage;

/// Cadence of the piece selection loop. Back-pressure comes from the
/// pace of receipt events, not from a pipeline depth limit.
pub const PAUSE_BETWEEN_REQUESTS: Duration = Duration::from_millis(1);

pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Progress numbers for the terminal display.
#[derive(Debug, Clone, Copy)]
pub struct DownloadSnapshot {
    pub completed: usize,
    pub total: usize,
    pub live_requests: usize,
    pub peers: usize,
}

/// Per-torrent state machine: selects blocks to request, consumes
/// received blocks, validates and commits pieces, and detects
/// completion. One coarse lock serializes request dispatch against
/// piece receipt, so a piece is never selected and concluded in
/// overlapping critical sections.
pub struct DownloadManager {
    partials: Arc<Vec<PartialPiece>>,
    peers: Arc<Vec<Arc<PeerSession>>>,
    requests: Arc<RequestMap>,
    store: Arc<FileStore>,
    progress: Arc<Mutex<Progress>>,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct Progress {
    completed: usize,
}

impl DownloadManager {
    /// `have` is the resume bitfield: pieces already verified on disk
    /// start out done and count toward completion.
    pub fn new(
        metadata: &TorrentMetadata,
        peers: Vec<Arc<PeerSession>>,
        store: Arc<FileStore>,
        have: &Bitfield,
    ) -> Self {
        let partials = build_partial_pieces(metadata);
        let mut completed = 0;
        for (i, partial) in partials.iter().enumerate() {
            if have.get(i) {
                partial.mark_done();
                completed += 1;
            }
        }

        Self {
            partials: Arc::new(partials),
            peers: Arc::new(peers),
            requests: Arc::new(RequestMap::default()),
            store,
            progress: Arc::new(Mutex::new(Progress { completed })),
            cancel: CancellationToken::new(),
        }
    }

    /// Token cancelling the selector and every receiver; also handed to
    /// auxiliary tasks like the progress renderer.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn snapshot(&self) -> DownloadSnapshot {
        let progress = self.progress.lock().await;
        DownloadSnapshot {
            completed: progress.completed,
            total: self.partials.len(),
            live_requests: self.requests.len(),
            peers: self.peers.len(),
        }
    }

    /// Drives the download to completion: spawns the per-peer receivers
    /// and the selector, then loops over receipt events, fatal errors,
    /// and the keep-alive timer. Sessions are closed on the way out.
    pub async fn run(&self) -> Result<()> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (error_tx, mut error_rx) = mpsc::unbounded_channel();

        for peer in self.peers.iter() {
            peer.start_receiving(event_tx.clone(), error_tx.clone(), self.cancel.child_token());
        }
        self.spawn_selector(error_tx.clone());
        // receivers hold the only remaining event senders
        drop(event_tx);

        let mut keep_alive = interval(KEEP_ALIVE_INTERVAL);
        keep_alive.tick().await; // the first tick fires immediately

        let result = if self.progress.lock().await.completed == self.partials.len() {
            Ok(())
        } else {
            loop {
                tokio::select! {
                    _ = keep_alive.tick() => {
                        for peer in self.peers.iter() {
                            if let Err(e) = peer.send_keep_alive().await {
                                debug!("keep-alive to {} failed: {:#}", peer.addr(), e);
                            }
                        }
                    }
                    Some(err) = error_rx.recv() => break Err(err),
                    event = event_rx.recv() => match event {
                        Some(WireMessage::Piece { piece, begin, block }) => {
                            match self.receive_block(piece, begin, block).await {
                                Ok(true) => break Ok(()),
                                Ok(false) => {}
                                Err(e) => break Err(e),
                            }
                        }
                        Some(other) => {
                            debug!("ignoring a {} message", kind_name(&other));
                        }
                        None => break Err(anyhow!("all peer receivers stopped")),
                    }
                }
            }
        };

        self.cancel.cancel();
        for peer in self.peers.iter() {
            peer.close().await;
        }
        result
    }

    /// Consumes one received block under the coordinator lock. CANCEL
    /// goes out to every peer before the block is stored; HAVE goes out
    /// only after the piece is committed. Returns true when the last
    /// piece completes.
    async fn receive_block(&self, piece: u32, begin: u32, block: Vec<u8>) -> Result<bool> {
        let mut progress = self.progress.lock().await;

        self.requests.delete(piece, begin);
        for peer in self.peers.iter() {
            // best effort: the block is already here
            if let Err(e) = peer.cancel_block(piece, begin, block.len() as u32).await {
                debug!("cancel to {} failed: {:#}", peer.addr(), e);
            }
        }

        let partial = self
            .partials
            .get(piece as usize)
            .ok_or_else(|| anyhow!("received block for unknown piece {}", piece))?;
        if partial.is_done() {
            debug!("piece {} block offset {} arrived after completion", piece, begin);
            return Ok(false);
        }

        partial.set(begin as usize, &block)?;
        debug!("piece {} block offset {} received", piece, begin);

        if !partial.valid() {
            return Ok(false);
        }

        partial.conclude(&self.store).await?;
        debug!("piece {} finished", piece);

        let mut broadcast_err = None;
        for peer in self.peers.iter() {
            if let Err(e) = peer.send_have(piece).await {
                broadcast_err.get_or_insert(e);
            }
        }
        if let Some(e) = broadcast_err {
            return Err(e);
        }

        progress.completed += 1;
        Ok(progress.completed == self.partials.len())
    }

    /// The selection loop: every tick, pick an incomplete piece
    /// uniformly at random, pick a random peer that has it, and request
    /// that piece's first missing block. Uniform-random selection is
    /// the intended strategy, not rarest-first.
    fn spawn_selector(&self, errors: mpsc::UnboundedSender<anyhow::Error>) {
        let partials = Arc::clone(&self.partials);
        let peers = Arc::clone(&self.peers);
        let requests = Arc::clone(&self.requests);
        let progress = Arc::clone(&self.progress);
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(PAUSE_BETWEEN_REQUESTS) => {
                        if let Err(e) =
                            dispatch_one(&partials, &peers, &requests, &progress).await
                        {
                            let _ = errors.send(e);
                        }
                    }
                }
            }
            debug!("selector exiting");
        });
    }
}

async fn dispatch_one(
    partials: &[PartialPiece],
    peers: &[Arc<PeerSession>],
    requests: &RequestMap,
    progress: &Mutex<Progress>,
) -> Result<()> {
    let _guard = progress.lock().await;

    let incomplete: Vec<usize> = partials
        .iter()
        .enumerate()
        .filter(|(_, partial)| !partial.is_done())
        .map(|(i, _)| i)
        .collect();
    let Some(piece) = pick(&incomplete).copied() else {
        return Ok(());
    };

    let owners: Vec<&Arc<PeerSession>> = peers
        .iter()
        .filter(|peer| peer.has_piece(piece as u32))
        .collect();
    let Some(peer) = pick(&owners) else {
        return Err(TorrentError::PieceUnavailable(piece as u32).into());
    };

    let partial = &partials[piece];
    let Some(block_index) = partial.missing().first().copied() else {
        return Ok(());
    };
    let begin = (block_index * BLOCK_SIZE) as u32;
    let length = partial.block_size(block_index) as u32;

    peer.request_block(piece as u32, begin, length).await?;
    requests.set(piece as u32, begin);
    debug!(
        "requested block {}/{} (offset {}) of piece {} from {}",
        block_index + 1,
        partial.block_count(),
        begin,
        piece,
        peer.addr()
    );
    Ok(())
}

/// Uniform-random element; the rng handle never lives across an await.
fn pick<T>(items: &[T]) -> Option<&T> {
    if items.is_empty() {
        return None;
    }
    let index = rand::thread_rng().gen_range(0..items.len());
    Some(&items[index])
}

fn kind_name(msg: &WireMessage) -> &'static str {
    match msg {
        WireMessage::KeepAlive => "keep-alive",
        WireMessage::Choke => "choke",
        WireMessage::Unchoke => "unchoke",
        WireMessage::Interested => "interested",
        WireMessage::NotInterested => "not-interested",
        WireMessage::Have { .. } => "have",
        WireMessage::Bitfield(_) => "bitfield",
        WireMessage::Request { .. } => "request",
        WireMessage::Piece { .. } => "piece",
        WireMessage::Cancel { .. } => "cancel",
    }
}
