use std::fs;
use std::path::Path;

use anyhow::{Context, anyhow};
use sha1::{Digest, Sha1};

use crate::bencode::{self, Bencode};
use crate::error::{Result, TorrentError};

pub const PIECE_HASH_LEN: usize = 20;

/// One output file of a multi-file torrent: path segments below the
/// download directory plus the declared byte length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: Vec<String>,
    pub length: usize,
}

/// Everything the downloader needs from a .torrent file. `files` is
/// empty in single-file mode; `file_entries` collapses that case to a
/// single entry named after the torrent.
#[derive(Debug, Clone)]
pub struct TorrentMetadata {
    pub announcers: Vec<String>,
    pub info_hash: [u8; 20],
    pub name: String,
    pub piece_length: usize,
    pub pieces: Vec<[u8; 20]>,
    pub total_length: usize,
    pub files: Vec<FileEntry>,
}

impl TorrentMetadata {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)
            .with_context(|| format!("unable to read torrent file {}", path.display()))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (span_start, span_end) = bencode::info_span(bytes)?;
        let info_hash: [u8; 20] = Sha1::digest(&bytes[span_start..span_end]).into();

        let (_, root) = bencode::decode(bytes)?;
        let root = root
            .as_dict()
            .ok_or_else(|| TorrentError::metainfo("torrent root is not a dictionary"))?;

        let mut announcers = Vec::new();
        if let Some(announce) = root.get("announce").and_then(Bencode::as_str) {
            announcers.push(announce);
        }
        if let Some(tiers) = root.get("announce-list").and_then(Bencode::as_list) {
            for tier in tiers {
                let tier = tier
                    .as_list()
                    .ok_or_else(|| anyhow!("announce-list entry is not a list"))?;
                for url in tier {
                    let url = url
                        .as_str()
                        .ok_or_else(|| anyhow!("announce-list entry is not a string"))?;
                    if !announcers.contains(&url) {
                        announcers.push(url);
                    }
                }
            }
        }
        if announcers.is_empty() {
            return Err(TorrentError::metainfo("torrent has no announce URL").into());
        }

        let info = root
            .get("info")
            .and_then(Bencode::as_dict)
            .ok_or_else(|| anyhow!("info is not a dictionary"))?;

        let name = info
            .get("name")
            .and_then(Bencode::as_str)
            .ok_or_else(|| anyhow!("info.name is missing or not a string"))?;

        let piece_length = info
            .get("piece length")
            .and_then(Bencode::as_int)
            .filter(|l| *l > 0)
            .ok_or_else(|| anyhow!("info.piece length is missing or invalid"))?
            as usize;

        let pieces_raw = info
            .get("pieces")
            .and_then(Bencode::as_bytes)
            .ok_or_else(|| anyhow!("info.pieces is missing or not a string"))?;
        if pieces_raw.len() % PIECE_HASH_LEN != 0 {
            return Err(anyhow!(
                "info.pieces length {} is not a multiple of {}",
                pieces_raw.len(),
                PIECE_HASH_LEN
            ));
        }
        let pieces: Vec<[u8; 20]> = pieces_raw
            .chunks_exact(PIECE_HASH_LEN)
            .map(|chunk| chunk.try_into().expect("chunk is 20 bytes"))
            .collect();

        let length = info.get("length").and_then(Bencode::as_int);
        let mut files = Vec::new();
        if let Some(entries) = info.get("files").and_then(Bencode::as_list) {
            for entry in entries {
                let entry = entry
                    .as_dict()
                    .ok_or_else(|| anyhow!("file entry is not a dictionary"))?;
                let file_length = entry
                    .get("length")
                    .and_then(Bencode::as_int)
                    .filter(|l| *l >= 0)
                    .ok_or_else(|| anyhow!("file entry is missing its length"))?;
                let path = entry
                    .get("path")
                    .and_then(Bencode::as_list)
                    .ok_or_else(|| anyhow!("file entry is missing its path"))?
                    .iter()
                    .map(|segment| {
                        segment
                            .as_str()
                            .ok_or_else(|| anyhow!("file path segment is not a string"))
                    })
                    .collect::<Result<Vec<String>>>()?;
                if path.is_empty() {
                    return Err(anyhow!("file entry has an empty path"));
                }
                files.push(FileEntry {
                    path,
                    length: file_length as usize,
                });
            }
        }

        let total_length = match length {
            Some(l) if l >= 0 => l as usize,
            _ if !files.is_empty() => files.iter().map(|f| f.length).sum(),
            _ => return Err(anyhow!("torrent has neither a length nor a file list")),
        };

        let expected_pieces = total_length.div_ceil(piece_length);
        if pieces.len() != expected_pieces {
            return Err(anyhow!(
                "torrent declares {} piece hashes but {} bytes need {}",
                pieces.len(),
                total_length,
                expected_pieces
            ));
        }

        Ok(Self {
            announcers,
            info_hash,
            name,
            piece_length,
            pieces,
            total_length,
            files,
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Length of piece `index`: the configured piece length for all but
    /// possibly the final piece.
    pub fn piece_len(&self, index: usize) -> usize {
        let start = index * self.piece_length;
        self.piece_length.min(self.total_length - start)
    }

    /// The output file layout, collapsing single-file mode to one entry
    /// named after the torrent.
    pub fn file_entries(&self) -> Vec<FileEntry> {
        if self.files.is_empty() {
            vec![FileEntry {
                path: vec![self.name.clone()],
                length: self.total_length,
            }]
        } else {
            self.files.clone()
        }
    }
}
