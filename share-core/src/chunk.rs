//! Chunk layout: fixed maximum chunk size, range arithmetic, chunk payloads.

use serde::{Deserialize, Serialize};

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024; // 1 MiB

/// Smallest chunk size a peer may negotiate.
pub const MIN_CHUNK_SIZE: u64 = 4 * 1024;

/// Largest chunk size a peer may negotiate. Keeps a chunk well under the wire frame cap.
pub const MAX_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Byte range of a file: [offset, offset + length).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    pub offset: u64,
    pub length: u64,
}

impl ChunkRange {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// A chunk of file content in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub payload: Vec<u8>,
}

impl Chunk {
    pub fn new(offset: u64, payload: Vec<u8>) -> Self {
        Self { offset, payload }
    }

    pub fn len(&self) -> u64 {
        self.payload.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn end(&self) -> u64 {
        self.offset + self.len()
    }

    pub fn range(&self) -> ChunkRange {
        ChunkRange {
            offset: self.offset,
            length: self.len(),
        }
    }
}

/// Clamp a requested chunk size into the supported bounds. Zero selects the default.
pub fn clamp_chunk_size(requested: u64) -> u64 {
    if requested == 0 {
        return DEFAULT_CHUNK_SIZE;
    }
    requested.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

/// Next range to transfer from `offset`, or None at end of file.
pub fn next_range(offset: u64, total_len: u64, chunk_size: u64) -> Option<ChunkRange> {
    if offset >= total_len {
        return None;
    }
    let length = chunk_size.max(1).min(total_len - offset);
    Some(ChunkRange { offset, length })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk(from: u64, total_len: u64, chunk_size: u64) -> Vec<ChunkRange> {
        let mut out = Vec::new();
        let mut offset = from;
        while let Some(range) = next_range(offset, total_len, chunk_size) {
            offset = range.end();
            out.push(range);
        }
        out
    }

    #[test]
    fn last_range_is_short() {
        let ranges = walk(0, 100, 30);
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges[0], ChunkRange { offset: 0, length: 30 });
        assert_eq!(ranges[3], ChunkRange { offset: 90, length: 10 });
    }

    #[test]
    fn exact_multiple_has_no_tail() {
        let ranges = walk(0, 90, 30);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[2].end(), 90);
    }

    #[test]
    fn ranges_start_at_resume_offset() {
        assert_eq!(
            next_range(40, 100, 30),
            Some(ChunkRange { offset: 40, length: 30 })
        );
        assert_eq!(walk(40, 100, 30).last().unwrap().end(), 100);
    }

    #[test]
    fn zero_length_file_has_no_ranges() {
        assert_eq!(next_range(0, 0, 30), None);
        assert_eq!(next_range(100, 100, 30), None);
    }

    #[test]
    fn chunk_size_is_clamped() {
        assert_eq!(clamp_chunk_size(0), DEFAULT_CHUNK_SIZE);
        assert_eq!(clamp_chunk_size(1), MIN_CHUNK_SIZE);
        assert_eq!(clamp_chunk_size(u64::MAX), MAX_CHUNK_SIZE);
        assert_eq!(clamp_chunk_size(64 * 1024), 64 * 1024);
    }

    #[test]
    fn chunk_range_matches_payload() {
        let chunk = Chunk::new(10, vec![0u8; 5]);
        assert_eq!(chunk.range(), ChunkRange { offset: 10, length: 5 });
        assert_eq!(chunk.end(), 15);
    }
}
