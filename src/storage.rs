use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use log::debug;
use sha1::{Digest, Sha1};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::bitfield::Bitfield;
use crate::error::Result;
use crate::metainfo::TorrentMetadata;

/// Maps the logical torrent byte stream onto the output file set.
/// Files are opened read/write and sized to their declared length up
/// front so any intra-file seek is valid; existing content survives,
/// which is what makes hash-based resume work.
pub struct FileStore {
    spans: Vec<FileSpan>,
    piece_hashes: Vec<[u8; 20]>,
    piece_length: usize,
    total_length: usize,
}

struct FileSpan {
    /// Absolute offset of the file's first byte in the torrent stream.
    start: u64,
    /// Absolute offset one past the file's last byte.
    end: u64,
    path: PathBuf,
    file: Mutex<File>,
}

impl FileStore {
    pub async fn create(metadata: &TorrentMetadata, base_dir: &Path) -> Result<Self> {
        let mut spans = Vec::new();
        let mut offset = 0u64;

        for entry in metadata.file_entries() {
            let mut path = base_dir.to_path_buf();
            for segment in &entry.path {
                path.push(segment);
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("unable to create {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .await
                .with_context(|| format!("unable to open {}", path.display()))?;
            file.set_len(entry.length as u64)
                .await
                .with_context(|| format!("unable to size {}", path.display()))?;

            spans.push(FileSpan {
                start: offset,
                end: offset + entry.length as u64,
                path,
                file: Mutex::new(file),
            });
            offset += entry.length as u64;
        }

        if offset != metadata.total_length as u64 {
            return Err(anyhow!(
                "file lengths sum to {} but the torrent declares {}",
                offset,
                metadata.total_length
            ));
        }

        Ok(Self {
            spans,
            piece_hashes: metadata.pieces.clone(),
            piece_length: metadata.piece_length,
            total_length: metadata.total_length,
        })
    }

    pub fn total_length(&self) -> usize {
        self.total_length
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Writes `data` at the absolute offset, splitting it across every
    /// file span it overlaps.
    pub async fn write_range(&self, offset: u64, data: &[u8]) -> Result<()> {
        let data_start = offset;
        let data_end = offset + data.len() as u64;
        if data_end > self.total_length as u64 {
            return Err(anyhow!(
                "write of {} bytes at offset {} overruns the torrent length {}",
                data.len(),
                offset,
                self.total_length
            ));
        }

        for span in &self.spans {
            let overlap_start = data_start.max(span.start);
            let overlap_end = data_end.min(span.end);
            if overlap_start >= overlap_end {
                continue;
            }
            let from = (overlap_start - data_start) as usize;
            let len = (overlap_end - overlap_start) as usize;

            let mut file = span.file.lock().await;
            file.seek(SeekFrom::Start(overlap_start - span.start))
                .await
                .with_context(|| format!("seek in {}", span.path.display()))?;
            file.write_all(&data[from..from + len])
                .await
                .with_context(|| format!("write to {}", span.path.display()))?;
            file.flush()
                .await
                .with_context(|| format!("flush of {}", span.path.display()))?;
        }

        Ok(())
    }

    /// Writes a whole piece at its logical offset.
    pub async fn write_piece(&self, piece: u32, data: &[u8]) -> Result<()> {
        self.write_range(piece as u64 * self.piece_length as u64, data)
            .await
    }

    /// Reads `len` bytes starting at the absolute offset, assembled
    /// across file boundaries. Any failing span fails the whole range.
    pub async fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let data_start = offset;
        let data_end = offset + len as u64;
        if data_end > self.total_length as u64 {
            return Err(anyhow!(
                "read of {} bytes at offset {} overruns the torrent length {}",
                len,
                offset,
                self.total_length
            ));
        }

        let mut data = vec![0u8; len];
        for span in &self.spans {
            let overlap_start = data_start.max(span.start);
            let overlap_end = data_end.min(span.end);
            if overlap_start >= overlap_end {
                continue;
            }
            let into = (overlap_start - data_start) as usize;
            let segment_len = (overlap_end - overlap_start) as usize;

            let mut file = span.file.lock().await;
            file.seek(SeekFrom::Start(overlap_start - span.start))
                .await
                .with_context(|| format!("seek in {}", span.path.display()))?;
            file.read_exact(&mut data[into..into + segment_len])
                .await
                .with_context(|| format!("read from {}", span.path.display()))?;
        }

        Ok(data)
    }

    /// Hashes every piece-sized span already on disk and reports which
    /// pieces verify. A span that cannot be read just leaves its bit
    /// clear; the piece will be fetched again.
    pub async fn initial_bitfield(&self) -> Bitfield {
        let mut bitfield = Bitfield::blank(self.piece_hashes.len());

        for (i, expected) in self.piece_hashes.iter().enumerate() {
            let start = i as u64 * self.piece_length as u64;
            let end = (start + self.piece_length as u64).min(self.total_length as u64);
            if start == end {
                continue;
            }

            let data = match self.read_range(start, (end - start) as usize).await {
                Ok(data) => data,
                Err(e) => {
                    debug!("piece {} not readable during resume scan: {:#}", i, e);
                    continue;
                }
            };
            let hash: [u8; 20] = Sha1::digest(&data).into();
            if hash == *expected {
                // in range by construction
                let _ = bitfield.set(i);
            }
        }

        bitfield
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("files", &self.spans.len())
            .field("pieces", &self.piece_hashes.len())
            .field("total_length", &self.total_length)
            .finish()
    }
}
