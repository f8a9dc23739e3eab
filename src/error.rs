use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("incomplete frame: need {needed} bytes, got {available}")]
    IncompleteFrame { needed: usize, available: usize },

    #[error("invalid message kind: {0}")]
    InvalidKind(u8),

    #[error("{kind} payload too short: {len} bytes")]
    PayloadTooShort { kind: &'static str, len: usize },
}

#[derive(Error, Debug)]
pub enum TorrentError {
    #[error("invalid metainfo: {0}")]
    Metainfo(String),

    #[error("tracker rejected request: {0}")]
    Tracker(String),

    #[error("handshake with {addr} failed: {reason}")]
    Handshake { addr: String, reason: String },

    #[error("no peer has piece {0}")]
    PieceUnavailable(u32),

    #[error("no peer connections could be established")]
    NoPeers,

    #[error("peer closed connection")]
    PeerClosed,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TorrentError {
    pub fn metainfo(msg: impl Into<String>) -> Self {
        TorrentError::Metainfo(msg.into())
    }

    pub fn tracker(msg: impl Into<String>) -> Self {
        TorrentError::Tracker(msg.into())
    }

    pub fn handshake(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        TorrentError::Handshake {
            addr: addr.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = anyhow::Result<T>;
