use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::anyhow;
use sha1::{Digest, Sha1};

use crate::error::Result;
use crate::metainfo::TorrentMetadata;
use crate::storage::FileStore;

/// Transfer granularity: 16 KiB blocks, the conventional request size.
pub const BLOCK_SIZE: usize = 1 << 14;

/// In-memory reassembly buffer for one piece. Blocks land in any order;
/// once every block is present and the SHA-1 matches, the piece is
/// committed to storage and the buffer is released.
#[derive(Debug)]
pub struct PartialPiece {
    expected_hash: [u8; 20],
    /// Absolute byte offset of this piece in the logical torrent stream.
    offset: u64,
    block_sizes: Vec<usize>,
    inner: Mutex<Blocks>,
    done: AtomicBool,
}

#[derive(Debug)]
struct Blocks {
    filled: Vec<bool>,
    data: Vec<u8>,
}

impl PartialPiece {
    pub fn new(expected_hash: [u8; 20], offset: u64, length: usize) -> Self {
        let block_count = length.div_ceil(BLOCK_SIZE);
        let last_size = length % BLOCK_SIZE;
        let mut block_sizes = vec![BLOCK_SIZE; block_count];
        if last_size != 0
            && let Some(last) = block_sizes.last_mut()
        {
            *last = last_size;
        }
        Self {
            expected_hash,
            offset,
            block_sizes,
            inner: Mutex::new(Blocks {
                filled: vec![false; block_count],
                data: vec![0u8; length],
            }),
            done: AtomicBool::new(false),
        }
    }

    /// Number of blocks in this piece, filled or otherwise.
    pub fn block_count(&self) -> usize {
        self.block_sizes.len()
    }

    pub fn block_size(&self, index: usize) -> usize {
        self.block_sizes[index]
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Marks the piece complete without going through `conclude`; used
    /// when a resume scan finds the piece already verified on disk.
    pub fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    /// Copies one block into the buffer. The offset must be a multiple
    /// of the block size even for a short final block. Re-delivering a
    /// block is accepted on the precondition that the bytes are the same
    /// as the first delivery.
    pub fn set(&self, offset: usize, data: &[u8]) -> Result<()> {
        if offset % BLOCK_SIZE != 0 {
            return Err(anyhow!(
                "block offset {} is not aligned to {} bytes",
                offset,
                BLOCK_SIZE
            ));
        }
        let block_index = offset / BLOCK_SIZE;
        if block_index >= self.block_sizes.len() {
            return Err(anyhow!("block index {} out of range", block_index));
        }
        if data.len() > BLOCK_SIZE {
            return Err(anyhow!("block of {} bytes exceeds the block size", data.len()));
        }

        let mut inner = self.inner.lock().expect("piece lock poisoned");
        if offset + data.len() > inner.data.len() {
            return Err(anyhow!(
                "block of {} bytes overruns the piece at offset {}",
                data.len(),
                offset
            ));
        }
        inner.filled[block_index] = true;
        inner.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// True once every block is filled and the buffer hashes to the
    /// expected value. Safe to call concurrently with `set`.
    pub fn valid(&self) -> bool {
        let inner = self.inner.lock().expect("piece lock poisoned");
        if !inner.filled.iter().all(|filled| *filled) {
            return false;
        }
        let hash: [u8; 20] = Sha1::digest(&inner.data).into();
        hash == self.expected_hash
    }

    /// Indices of unfilled blocks, ascending.
    pub fn missing(&self) -> Vec<usize> {
        let inner = self.inner.lock().expect("piece lock poisoned");
        inner
            .filled
            .iter()
            .enumerate()
            .filter(|(_, filled)| !**filled)
            .map(|(i, _)| i)
            .collect()
    }

    /// Commits the verified piece to storage at its logical offset,
    /// marks it done, and releases the buffer.
    pub async fn conclude(&self, store: &FileStore) -> Result<()> {
        if !self.valid() {
            return Err(anyhow!("piece is not valid"));
        }
        let data = {
            let mut inner = self.inner.lock().expect("piece lock poisoned");
            std::mem::take(&mut inner.data)
        };
        store.write_range(self.offset, &data).await?;
        self.done.store(true, Ordering::Release);
        Ok(())
    }
}

/// One reassembly buffer per piece, offsets laid out back to back; the
/// final piece is trimmed to the remaining length.
pub fn build_partial_pieces(metadata: &TorrentMetadata) -> Vec<PartialPiece> {
    (0..metadata.num_pieces())
        .map(|i| {
            PartialPiece::new(
                metadata.pieces[i],
                (i * metadata.piece_length) as u64,
                metadata.piece_len(i),
            )
        })
        .collect()
}
