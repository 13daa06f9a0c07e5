//! Chunk layout: split a file into fixed-size, sequence-numbered slices.

use crate::integrity;
use crate::protocol::{Frame, TransferId};

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: u64 = 256 * 1024; // 256 KiB

/// One chunk: sequence number and byte range within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRange {
    pub sequence: u64,
    pub offset: u64,
    pub len: u64,
}

/// Fixed-size chunking of `total_bytes`. The last chunk may be short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    total_bytes: u64,
    chunk_size: u64,
}

impl ChunkLayout {
    /// A chunk size of zero falls back to [`DEFAULT_CHUNK_SIZE`].
    pub fn new(total_bytes: u64, chunk_size: u64) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Self {
            total_bytes,
            chunk_size,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// ceil(total / chunk_size).
    pub fn chunk_count(&self) -> u64 {
        self.total_bytes.div_ceil(self.chunk_size)
    }

    /// Range of chunk `sequence`, or None past the end.
    pub fn range(&self, sequence: u64) -> Option<ChunkRange> {
        if sequence >= self.chunk_count() {
            return None;
        }
        let offset = sequence * self.chunk_size;
        let len = self.chunk_size.min(self.total_bytes - offset);
        Some(ChunkRange {
            sequence,
            offset,
            len,
        })
    }

    /// Bytes covered by chunks `0..next_sequence`.
    pub fn bytes_before(&self, next_sequence: u64) -> u64 {
        next_sequence
            .saturating_mul(self.chunk_size)
            .min(self.total_bytes)
    }

    pub fn chunks(&self) -> impl Iterator<Item = ChunkRange> + '_ {
        (0..self.chunk_count()).filter_map(|seq| self.range(seq))
    }
}

/// Build the ChunkData frame for a payload read from disk.
pub fn chunk_data_frame(transfer_id: TransferId, sequence: u64, payload: Vec<u8>) -> Frame {
    Frame::ChunkData {
        transfer_id,
        sequence,
        checksum: integrity::checksum(&payload),
        payload,
    }
}
