//! Splits a payload into bounded CHUNK messages.

use bytes::Bytes;
use tracing::trace;

use super::protocol::ChunkPayload;

pub fn chunk_count(len: usize, chunk_size: usize) -> u64 {
    len.div_ceil(chunk_size.max(1)) as u64
}

/// Zero-copy iterator over the chunks of a payload.
///
/// Chunk ids start at 0 and increase by one; the final chunk carries
/// `is_last = true`. An empty payload yields no chunks.
#[derive(Debug, Clone)]
pub struct Chunker {
    data: Bytes,
    chunk_size: usize,
    next_chunk: u64,
    chunk_count: u64,
}

impl Chunker {
    pub fn new(data: Bytes, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let chunk_count = chunk_count(data.len(), chunk_size);
        Self {
            data,
            chunk_size,
            next_chunk: 0,
            chunk_count,
        }
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    pub fn is_complete(&self) -> bool {
        self.next_chunk >= self.chunk_count
    }

    pub fn progress(&self) -> f64 {
        if self.chunk_count == 0 {
            return 1.0;
        }
        self.next_chunk as f64 / self.chunk_count as f64
    }
}

impl Iterator for Chunker {
    type Item = ChunkPayload;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_complete() {
            return None;
        }

        let start = self.next_chunk as usize * self.chunk_size;
        let end = (start + self.chunk_size).min(self.data.len());
        let chunk_id = self.next_chunk;
        self.next_chunk += 1;

        trace!(chunk_id, start, end, total = self.chunk_count, "slicing chunk");

        Some(ChunkPayload {
            chunk_id,
            data: self.data.slice(start..end),
            is_last: self.next_chunk == self.chunk_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::protocol::CHUNK_SIZE;

    #[test]
    fn test_one_mib_yields_64_chunks() {
        let data = Bytes::from(vec![7u8; 1024 * 1024]);
        let chunks: Vec<_> = Chunker::new(data, CHUNK_SIZE).collect();

        assert_eq!(chunks.len(), 64);
        assert!(chunks.iter().all(|c| c.data.len() == CHUNK_SIZE));
        assert!(chunks.last().unwrap().is_last);
        assert_eq!(chunks.iter().filter(|c| c.is_last).count(), 1);
    }

    #[test]
    fn test_tail_chunk_is_short() {
        let data = Bytes::from(vec![1u8; 10]);
        let chunks: Vec<_> = Chunker::new(data, 4).collect();

        let ids: Vec<_> = chunks.iter().map(|c| c.chunk_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(chunks[2].data.len(), 2);
    }

    #[test]
    fn test_empty_payload_has_no_chunks() {
        let mut chunker = Chunker::new(Bytes::new(), CHUNK_SIZE);
        assert_eq!(chunker.chunk_count(), 0);
        assert!(chunker.next().is_none());
        assert_eq!(chunker.progress(), 1.0);
    }
}
