//! Version 2 sequence writer
//!
//! Produces files the decoder reads back: uncompressed or zstd, any number of
//! frames per compression block, optional sparse ranges and variable headers.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

use super::header::{
    Compression, SparseChannelRange, BLOCK_ENTRY_LEN, SPARSE_ENTRY_LEN, V2_FIXED_HEADER_LEN,
};
use crate::error::{Result, SequenceError};

/// Largest block count the v2 header can encode (12 bits)
const MAX_BLOCKS: usize = 0x0FFF;

/// Builder for v2 sequence files
#[derive(Debug, Clone)]
pub struct SequenceWriter {
    channel_count: u32,
    step_ms: u8,
    compression: Compression,
    frames_per_block: u32,
    zstd_level: i32,
    sparse_ranges: Vec<SparseChannelRange>,
    variable_headers: Vec<(String, String)>,
    id: u64,
}

impl SequenceWriter {
    /// Uncompressed writer for frames of `channel_count` bytes
    pub fn new(channel_count: u32, step_ms: u8) -> Self {
        Self {
            channel_count,
            step_ms,
            compression: Compression::None,
            frames_per_block: 10,
            zstd_level: 1,
            sparse_ranges: Vec::new(),
            variable_headers: Vec::new(),
            id: 0,
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_frames_per_block(mut self, frames: u32) -> Self {
        self.frames_per_block = frames.max(1);
        self
    }

    pub fn with_zstd_level(mut self, level: i32) -> Self {
        self.zstd_level = level;
        self
    }

    /// Store only the given absolute channel ranges; their counts must add up
    /// to the channel count.
    pub fn with_sparse_range(mut self, start_channel: u32, count: u32) -> Self {
        self.sparse_ranges.push(SparseChannelRange {
            start_channel,
            count,
        });
        self
    }

    pub fn with_variable_header(mut self, tag: &str, value: &str) -> Self {
        self.variable_headers.push((tag.to_string(), value.to_string()));
        self
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    fn validate(&self, frames: &[Vec<u8>]) -> Result<()> {
        if let Some((i, frame)) = frames
            .iter()
            .enumerate()
            .find(|(_, f)| f.len() != self.channel_count as usize)
        {
            return Err(SequenceError::InvalidFrame(format!(
                "frame {} has {} bytes, expected {}",
                i,
                frame.len(),
                self.channel_count
            )));
        }
        if !self.sparse_ranges.is_empty() {
            let sparse_total: u64 = self.sparse_ranges.iter().map(|r| r.count as u64).sum();
            if sparse_total != self.channel_count as u64 {
                return Err(SequenceError::InvalidHeader(format!(
                    "sparse ranges cover {} channels, frames carry {}",
                    sparse_total, self.channel_count
                )));
            }
        }
        if self.sparse_ranges.len() > u8::MAX as usize {
            return Err(SequenceError::InvalidHeader("too many sparse ranges".into()));
        }
        for (tag, value) in &self.variable_headers {
            if tag.len() != 2 || value.len() + 5 > u16::MAX as usize {
                return Err(SequenceError::InvalidHeader(format!(
                    "unencodable variable header '{}'",
                    tag
                )));
            }
        }
        Ok(())
    }

    /// Encoded data blocks and their starting frames
    fn encode_blocks(&self, frames: &[Vec<u8>]) -> Result<Vec<(u32, Vec<u8>)>> {
        match self.compression {
            Compression::None => Ok(vec![(0, frames.concat())]),
            Compression::Zstd => frames
                .chunks(self.frames_per_block as usize)
                .enumerate()
                .map(|(i, group)| -> Result<(u32, Vec<u8>)> {
                    let compressed = zstd::bulk::compress(&group.concat(), self.zstd_level)?;
                    Ok(((i as u32) * self.frames_per_block, compressed))
                })
                .collect(),
            other => Err(SequenceError::NotImplemented(format!(
                "writing {} sequences",
                other.name()
            ))),
        }
    }

    /// Encode a complete file holding `frames`.
    pub fn to_bytes(&self, frames: &[Vec<u8>]) -> Result<Vec<u8>> {
        self.validate(frames)?;
        let blocks = self.encode_blocks(frames)?;
        let block_entries = match self.compression {
            Compression::None => 0,
            _ => blocks.len(),
        };
        if block_entries > MAX_BLOCKS {
            return Err(SequenceError::InvalidHeader(format!(
                "{} compression blocks exceed the header limit",
                block_entries
            )));
        }

        let var_offset =
            V2_FIXED_HEADER_LEN + block_entries * BLOCK_ENTRY_LEN + self.sparse_ranges.len() * SPARSE_ENTRY_LEN;
        let var_len: usize = self
            .variable_headers
            .iter()
            .map(|(_, value)| 4 + value.len() + 1)
            .sum();
        let data_offset = var_offset + var_len;
        if data_offset > u16::MAX as usize {
            return Err(SequenceError::InvalidHeader(format!(
                "header of {} bytes does not fit",
                data_offset
            )));
        }

        let data_len: usize = blocks.iter().map(|(_, b)| b.len()).sum();
        let mut buf = Vec::with_capacity(data_offset + data_len);
        buf.extend_from_slice(b"PSEQ");
        buf.extend_from_slice(&(data_offset as u16).to_le_bytes());
        buf.push(1); // minor
        buf.push(2); // major
        buf.extend_from_slice(&(var_offset as u16).to_le_bytes());
        buf.extend_from_slice(&self.channel_count.to_le_bytes());
        buf.extend_from_slice(&(frames.len() as u32).to_le_bytes());
        buf.push(self.step_ms);
        buf.push(0);
        buf.push(self.compression.code() | (((block_entries >> 8) as u8 & 0x0F) << 4));
        buf.push((block_entries & 0xFF) as u8);
        buf.push(self.sparse_ranges.len() as u8);
        buf.push(0);
        buf.extend_from_slice(&self.id.to_le_bytes());

        if block_entries > 0 {
            for (start_frame, data) in &blocks {
                buf.extend_from_slice(&start_frame.to_le_bytes());
                buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
            }
        }
        for range in &self.sparse_ranges {
            buf.extend_from_slice(&range.start_channel.to_le_bytes()[..3]);
            buf.extend_from_slice(&range.count.to_le_bytes()[..3]);
        }
        for (tag, value) in &self.variable_headers {
            buf.extend_from_slice(&((4 + value.len() + 1) as u16).to_le_bytes());
            buf.extend_from_slice(tag.as_bytes());
            buf.extend_from_slice(value.as_bytes());
            buf.push(0);
        }
        for (_, data) in &blocks {
            buf.extend_from_slice(data);
        }
        Ok(buf)
    }

    /// Write a complete file holding `frames` to `path`.
    pub fn write(&self, path: impl AsRef<Path>, frames: &[Vec<u8>]) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.to_bytes(frames)?;
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(&bytes)?;
        out.flush()?;
        info!(
            "Wrote sequence {} ({} frames, {} bytes, {})",
            path.display(),
            frames.len(),
            bytes.len(),
            self.compression.name()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fseq::header::SequenceHeader;

    fn frames(count: usize, size: usize) -> Vec<Vec<u8>> {
        (0..count)
            .map(|f| (0..size).map(|c| (f * 7 + c) as u8).collect())
            .collect()
    }

    #[test]
    fn test_uncompressed_layout() {
        let writer = SequenceWriter::new(4, 50).with_variable_header("sp", "unit");
        let bytes = writer.to_bytes(&frames(3, 4)).unwrap();
        let header = SequenceHeader::parse(&bytes, bytes.len() as u64).unwrap();
        assert_eq!(header.compression, Compression::None);
        assert!(header.blocks.is_empty());
        assert_eq!(header.frame_count, 3);
        assert_eq!(bytes.len(), header.data_offset as usize + 12);
        assert_eq!(header.producer(), Some("unit"));
    }

    #[test]
    fn test_zstd_blocks() {
        let writer = SequenceWriter::new(8, 25)
            .with_compression(Compression::Zstd)
            .with_frames_per_block(4);
        let bytes = writer.to_bytes(&frames(10, 8)).unwrap();
        let header = SequenceHeader::parse(&bytes, bytes.len() as u64).unwrap();
        let starts: Vec<u32> = header.blocks.iter().map(|b| b.start_frame).collect();
        assert_eq!(starts, vec![0, 4, 8]);
        let data_len: u64 = header.blocks.iter().map(|b| b.byte_length as u64).sum();
        assert_eq!(header.data_offset as u64 + data_len, bytes.len() as u64);
    }

    #[test]
    fn test_rejects_wrong_frame_size() {
        let writer = SequenceWriter::new(8, 25);
        let mut data = frames(2, 8);
        data[1].pop();
        assert!(matches!(
            writer.to_bytes(&data),
            Err(SequenceError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_rejects_sparse_mismatch() {
        let writer = SequenceWriter::new(8, 25).with_sparse_range(0, 4);
        assert!(matches!(
            writer.to_bytes(&frames(1, 8)),
            Err(SequenceError::InvalidHeader(_))
        ));
    }
}
