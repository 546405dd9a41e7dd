//! Synchronous sequence reader
//!
//! Walks a file chunk by chunk, decompressing each in turn, and hands frames to
//! a visitor. Used for offline processing; playback goes through the frame
//! cache instead.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::block_index::{BlockIndex, ChunkEntry, DEFAULT_PSEUDO_CHUNK_BYTES};
use super::header::{ChannelSpan, Compression, SequenceHeader};
use crate::error::{Result, SequenceError};
use showplay_core::Millis;

/// A named absolute channel range to slice out of every frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRange {
    pub name: String,
    /// First absolute channel (0-based)
    pub start_channel: u32,
    pub channel_count: u32,
}

/// Read the raw bytes of `chunk` from `file`.
pub(crate) fn read_chunk_raw(file: &mut File, chunk: &ChunkEntry, out: &mut Vec<u8>) -> Result<()> {
    let len = usize::try_from(chunk.file_length)
        .map_err(|_| SequenceError::InvalidHeader(format!("chunk {} too large", chunk.index)))?;
    out.clear();
    out.resize(len, 0);
    file.seek(SeekFrom::Start(chunk.file_offset))?;
    file.read_exact(out).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => SequenceError::truncated(format!(
            "chunk {} at offset {} ({} bytes)",
            chunk.index, chunk.file_offset, chunk.file_length
        )),
        _ => SequenceError::Io(e),
    })?;
    Ok(())
}

/// Decode `raw` chunk bytes into `out` (cleared first).
pub(crate) fn decompress_chunk(chunk: &ChunkEntry, raw: &[u8], out: &mut Vec<u8>) -> Result<()> {
    out.clear();
    match chunk.compression {
        Compression::None => out.extend_from_slice(raw),
        Compression::Zstd => {
            zstd::stream::copy_decode(raw, &mut *out)?;
        }
        other => {
            return Err(SequenceError::NotImplemented(format!(
                "{} compressed chunk {}",
                other.name(),
                chunk.index
            )))
        }
    }
    if out.len() < chunk.decompressed_length {
        return Err(SequenceError::truncated(format!(
            "chunk {} decoded to {} bytes, expected {}",
            chunk.index,
            out.len(),
            chunk.decompressed_length
        )));
    }
    out.truncate(chunk.decompressed_length);
    Ok(())
}

/// Open sequence file with its parsed header and chunk index
pub struct SequenceReader {
    path: PathBuf,
    file: File,
    header: SequenceHeader,
    index: BlockIndex,
}

impl SequenceReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let header = SequenceHeader::read_from(&path)?;
        let index = BlockIndex::from_header(&header, DEFAULT_PSEUDO_CHUNK_BYTES)?;
        let file = File::open(&path)?;
        debug!(
            "Opened sequence {}: {} channels, {} frames @ {}ms, {} chunks ({})",
            path.display(),
            header.channel_count,
            header.frame_count,
            header.step_ms,
            index.len(),
            header.compression.name()
        );
        Ok(Self {
            path,
            file,
            header,
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &SequenceHeader {
        &self.header
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    /// Decompressed bytes of `chunk`
    pub fn read_chunk(&mut self, chunk: &ChunkEntry) -> Result<Vec<u8>> {
        let mut raw = Vec::new();
        read_chunk_raw(&mut self.file, chunk, &mut raw)?;
        let mut out = Vec::with_capacity(chunk.decompressed_length);
        decompress_chunk(chunk, &raw, &mut out)?;
        Ok(out)
    }

    /// Copy of one frame
    pub fn read_frame(&mut self, frame: u32) -> Result<Vec<u8>> {
        let chunk = *self
            .index
            .find_chunk(frame)
            .ok_or(SequenceError::FrameOutOfRange {
                frame: frame as u64,
                frame_count: self.header.frame_count,
            })?;
        let data = self.read_chunk(&chunk)?;
        let size = self.header.frame_size();
        let at = (frame - chunk.start_frame) as usize * size;
        Ok(data[at..at + size].to_vec())
    }

    /// Call `visitor(frame bytes, frame number, frame time, header)` for every
    /// frame in order.
    pub fn for_each_frame<F>(&mut self, mut visitor: F) -> Result<()>
    where
        F: FnMut(&[u8], u32, Millis, &SequenceHeader),
    {
        let size = self.header.frame_size();
        let chunks = self.index.chunks().to_vec();
        let mut raw = Vec::new();
        let mut data = Vec::new();
        for chunk in &chunks {
            read_chunk_raw(&mut self.file, chunk, &mut raw)?;
            decompress_chunk(chunk, &raw, &mut data)?;
            for frame in chunk.start_frame..chunk.end_frame {
                let at = (frame - chunk.start_frame) as usize * size;
                visitor(
                    &data[at..at + size],
                    frame,
                    self.header.frame_time(frame),
                    &self.header,
                );
            }
        }
        Ok(())
    }

    /// Like [`for_each_frame`](Self::for_each_frame) but hands each model its
    /// own slice: `visitor(model, model bytes, frame number, frame time)`.
    /// Channels the file does not carry read as zero.
    pub fn for_each_model_frame<F>(&mut self, models: &[ModelRange], mut visitor: F) -> Result<()>
    where
        F: FnMut(&ModelRange, &[u8], u32, Millis),
    {
        let layouts: Vec<Vec<ChannelSpan>> = models
            .iter()
            .map(|m| self.header.resolve_channels(m.start_channel, m.channel_count))
            .collect();
        let mut scratch = Vec::new();
        self.for_each_frame(|frame, number, time, _| {
            for (model, spans) in models.iter().zip(&layouts) {
                scratch.clear();
                for span in spans {
                    match span {
                        ChannelSpan::Stored(range) => scratch.extend_from_slice(&frame[range.clone()]),
                        ChannelSpan::Missing(len) => scratch.resize(scratch.len() + len, 0),
                    }
                }
                visitor(model, &scratch, number, time);
            }
        })
    }
}
