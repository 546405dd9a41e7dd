//! Frame-to-chunk index
//!
//! Every file is addressed in chunks of consecutive frames. Compressed files
//! use their compression blocks; uncompressed files are split into fixed-size
//! pseudo-chunks so the frame cache treats both the same way.

use serde::Serialize;

use super::header::{Compression, SequenceHeader};
use crate::error::{Result, SequenceError};

/// Target decompressed size of a pseudo-chunk for uncompressed files
pub const DEFAULT_PSEUDO_CHUNK_BYTES: usize = 1024 * 1024;

/// One chunk of frames and where its bytes live in the file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkEntry {
    pub index: usize,
    pub start_frame: u32,
    /// Exclusive
    pub end_frame: u32,
    pub file_offset: u64,
    pub file_length: u64,
    pub compression: Compression,
    pub decompressed_length: usize,
}

impl ChunkEntry {
    pub fn frame_count(&self) -> u32 {
        self.end_frame - self.start_frame
    }

    pub fn contains(&self, frame: u32) -> bool {
        frame >= self.start_frame && frame < self.end_frame
    }
}

/// Chunks of a sequence, sorted by frame and searchable by frame number.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BlockIndex {
    chunks: Vec<ChunkEntry>,
    frame_size: usize,
}

impl BlockIndex {
    /// Build the index for `header`, splitting uncompressed data into chunks of
    /// roughly `pseudo_chunk_bytes`.
    pub fn from_header(header: &SequenceHeader, pseudo_chunk_bytes: usize) -> Result<Self> {
        let frame_size = header.frame_size();
        let chunks = match header.compression {
            Compression::None => Self::pseudo_chunks(header, pseudo_chunk_bytes),
            _ => Self::compressed_chunks(header)?,
        };

        if let Some(last) = chunks.last() {
            let end = last.file_offset + last.file_length;
            if end > header.file_length {
                return Err(SequenceError::truncated(format!(
                    "frame data ends at {} but file is {} bytes",
                    end, header.file_length
                )));
            }
        }
        Ok(Self { chunks, frame_size })
    }

    fn pseudo_chunks(header: &SequenceHeader, pseudo_chunk_bytes: usize) -> Vec<ChunkEntry> {
        let frame_size = header.frame_size();
        if frame_size == 0 || header.frame_count == 0 {
            return Vec::new();
        }
        let per_chunk = (pseudo_chunk_bytes / frame_size).clamp(1, u32::MAX as usize) as u32;

        let mut chunks = Vec::new();
        let mut start = 0u32;
        while start < header.frame_count {
            let end = start.saturating_add(per_chunk).min(header.frame_count);
            let len = (end - start) as usize * frame_size;
            chunks.push(ChunkEntry {
                index: chunks.len(),
                start_frame: start,
                end_frame: end,
                file_offset: header.data_offset as u64 + start as u64 * frame_size as u64,
                file_length: len as u64,
                compression: Compression::None,
                decompressed_length: len,
            });
            start = end;
        }
        chunks
    }

    fn compressed_chunks(header: &SequenceHeader) -> Result<Vec<ChunkEntry>> {
        let blocks = &header.blocks;
        if header.frame_count == 0 {
            return Ok(Vec::new());
        }
        if blocks.is_empty() {
            return Err(SequenceError::InconsistentBlocks(format!(
                "{} compressed frames but no blocks",
                header.frame_count
            )));
        }
        if blocks[0].start_frame != 0 {
            return Err(SequenceError::InconsistentBlocks(format!(
                "first block starts at frame {}",
                blocks[0].start_frame
            )));
        }

        let frame_size = header.frame_size();
        let mut offset = header.data_offset as u64;
        let mut chunks = Vec::with_capacity(blocks.len());
        for (i, block) in blocks.iter().enumerate() {
            let end_frame = match blocks.get(i + 1) {
                Some(next) => next.start_frame,
                None => header.frame_count,
            };
            if end_frame <= block.start_frame || end_frame > header.frame_count {
                return Err(SequenceError::InconsistentBlocks(format!(
                    "block {} covers frames {}..{} of {}",
                    i, block.start_frame, end_frame, header.frame_count
                )));
            }
            chunks.push(ChunkEntry {
                index: i,
                start_frame: block.start_frame,
                end_frame,
                file_offset: offset,
                file_length: block.byte_length as u64,
                compression: header.compression,
                decompressed_length: (end_frame - block.start_frame) as usize * frame_size,
            });
            offset += block.byte_length as u64;
        }
        Ok(chunks)
    }

    /// Chunk containing `frame`
    pub fn find_chunk(&self, frame: u32) -> Option<&ChunkEntry> {
        let idx = self.chunks.partition_point(|c| c.end_frame <= frame);
        self.chunks.get(idx).filter(|c| c.contains(frame))
    }

    /// Chunks overlapping `start..end`, in frame order
    pub fn chunks_for_frames(&self, start: u32, end: u32) -> &[ChunkEntry] {
        if start >= end {
            return &[];
        }
        let first = self.chunks.partition_point(|c| c.end_frame <= start);
        let last = self.chunks.partition_point(|c| c.start_frame < end);
        &self.chunks[first..last.max(first)]
    }

    pub fn chunks(&self) -> &[ChunkEntry] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn index_from_ends(ends: &[u32]) -> BlockIndex {
        let mut start = 0;
        let chunks = ends
            .iter()
            .enumerate()
            .map(|(index, &end)| {
                let entry = ChunkEntry {
                    index,
                    start_frame: start,
                    end_frame: end,
                    file_offset: 0,
                    file_length: 0,
                    compression: Compression::Zstd,
                    decompressed_length: 0,
                };
                start = end;
                entry
            })
            .collect();
        BlockIndex { chunks, frame_size: 1 }
    }

    #[test]
    fn test_find_chunk_edges() {
        let index = index_from_ends(&[4, 10, 11]);
        assert_eq!(index.find_chunk(0).map(|c| c.index), Some(0));
        assert_eq!(index.find_chunk(3).map(|c| c.index), Some(0));
        assert_eq!(index.find_chunk(4).map(|c| c.index), Some(1));
        assert_eq!(index.find_chunk(10).map(|c| c.index), Some(2));
        assert!(index.find_chunk(11).is_none());
    }

    #[test]
    fn test_chunks_for_frames() {
        let index = index_from_ends(&[4, 10, 11]);
        let hit: Vec<usize> = index.chunks_for_frames(3, 5).iter().map(|c| c.index).collect();
        assert_eq!(hit, vec![0, 1]);
        assert!(index.chunks_for_frames(11, 20).is_empty());
        assert!(index.chunks_for_frames(5, 5).is_empty());
    }

    proptest! {
        #[test]
        fn prop_find_chunk_is_unique_container(
            lengths in proptest::collection::vec(1u32..20, 1..30),
            probe in 0u32..700,
        ) {
            let mut ends = Vec::with_capacity(lengths.len());
            let mut total = 0;
            for len in &lengths {
                total += len;
                ends.push(total);
            }
            let index = index_from_ends(&ends);
            let containing: Vec<usize> = index
                .chunks()
                .iter()
                .filter(|c| c.contains(probe))
                .map(|c| c.index)
                .collect();
            prop_assert!(containing.len() <= 1);
            prop_assert_eq!(index.find_chunk(probe).map(|c| c.index), containing.first().copied());
        }
    }
}
