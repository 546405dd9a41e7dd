//! Sequence file header parsing
//!
//! Three layouts are understood, all little-endian:
//!
//! - **v2** (`PSEQ`/`FSEQ`, major 2): 32-byte fixed header, compression block
//!   list, sparse channel ranges, then variable headers up to the data offset.
//! - **v1** (`PSEQ`/`FSEQ`, major 1): 28-byte fixed header with universe
//!   metadata and uncompressed frame data.
//! - **ESEQ**: 20-byte effect sequence header for a single model; the frame
//!   count follows from the file length.

use serde::Serialize;
use std::fs::File;
use std::io::Read;
use std::ops::Range;
use std::path::Path;

use crate::error::{Result, SequenceError};
use showplay_core::Millis;

/// Fixed header length of a v2 file
pub const V2_FIXED_HEADER_LEN: usize = 32;
/// Fixed header length of a v1 file
pub const V1_FIXED_HEADER_LEN: usize = 28;
/// Header length of an ESEQ file
pub const ESEQ_HEADER_LEN: usize = 20;
/// Frame duration assumed for ESEQ files, which carry no timing
pub const ESEQ_DEFAULT_STEP_MS: u8 = 50;

/// Bytes per entry in the v2 compression block list
pub(crate) const BLOCK_ENTRY_LEN: usize = 8;
/// Bytes per entry in the v2 sparse range list
pub(crate) const SPARSE_ENTRY_LEN: usize = 6;

/// Media file variable header tag
pub const TAG_MEDIA_FILE: &str = "mf";
/// Sequence producer variable header tag
pub const TAG_PRODUCER: &str = "sp";

/// File magic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SequenceFormat {
    Pseq,
    /// Older spelling of `PSEQ`, same layout
    Fseq,
    Eseq,
}

impl SequenceFormat {
    pub fn from_magic(magic: [u8; 4]) -> Result<Self> {
        match &magic {
            b"PSEQ" => Ok(SequenceFormat::Pseq),
            b"FSEQ" => Ok(SequenceFormat::Fseq),
            b"ESEQ" => Ok(SequenceFormat::Eseq),
            _ => Err(SequenceError::BadMagic(magic)),
        }
    }

    pub fn magic(&self) -> &'static [u8; 4] {
        match self {
            SequenceFormat::Pseq => b"PSEQ",
            SequenceFormat::Fseq => b"FSEQ",
            SequenceFormat::Eseq => b"ESEQ",
        }
    }
}

/// Per-block compression of frame data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Compression {
    None,
    Zstd,
    Zlib,
    Other(u8),
}

impl Compression {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Compression::None,
            1 => Compression::Zstd,
            2 => Compression::Zlib,
            other => Compression::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Zstd => 1,
            Compression::Zlib => 2,
            Compression::Other(code) => *code,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Compression::None => "none".to_string(),
            Compression::Zstd => "zstd".to_string(),
            Compression::Zlib => "zlib".to_string(),
            Compression::Other(code) => format!("unknown ({})", code),
        }
    }
}

/// One entry of the v2 compression block list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompressionBlock {
    pub start_frame: u32,
    pub byte_length: u32,
}

/// Absolute channels stored in a sparse file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SparseChannelRange {
    /// First absolute channel (0-based)
    pub start_channel: u32,
    pub count: u32,
}

/// Universe metadata only present in v1 files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct V1Info {
    pub universe_count: u16,
    pub universe_size: u16,
    pub gamma: u8,
    pub color_encoding: u8,
}

/// Where an absolute channel range lives in a stored frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSpan {
    /// Byte range within the stored frame
    Stored(Range<usize>),
    /// Channels the file does not carry
    Missing(usize),
}

impl ChannelSpan {
    pub fn len(&self) -> usize {
        match self {
            ChannelSpan::Stored(range) => range.len(),
            ChannelSpan::Missing(len) => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parsed sequence header
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequenceHeader {
    pub format: SequenceFormat,
    pub major_version: u8,
    pub minor_version: u8,
    /// Offset of the first frame data byte
    pub data_offset: u32,
    /// v2: offset of the variable headers; v1: fixed header length
    pub header_length: u16,
    /// Channels stored per frame (bytes per frame)
    pub channel_count: u32,
    pub frame_count: u32,
    pub step_ms: u8,
    pub compression: Compression,
    pub blocks: Vec<CompressionBlock>,
    pub sparse_ranges: Vec<SparseChannelRange>,
    /// Variable headers in file order
    pub variable_headers: Vec<(String, String)>,
    pub id: u64,
    pub v1: Option<V1Info>,
    /// First absolute channel of an ESEQ model (0-based)
    pub model_start_channel: Option<u32>,
    pub file_length: u64,
}

fn read_u16(buf: &[u8], at: usize) -> Result<u16> {
    buf.get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| SequenceError::truncated(format!("u16 at offset {}", at)))
}

fn read_u24(buf: &[u8], at: usize) -> Result<u32> {
    buf.get(at..at + 3)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], 0]))
        .ok_or_else(|| SequenceError::truncated(format!("u24 at offset {}", at)))
}

fn read_u32(buf: &[u8], at: usize) -> Result<u32> {
    buf.get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| SequenceError::truncated(format!("u32 at offset {}", at)))
}

fn read_u64(buf: &[u8], at: usize) -> Result<u64> {
    let b = buf
        .get(at..at + 8)
        .ok_or_else(|| SequenceError::truncated(format!("u64 at offset {}", at)))?;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(b);
    Ok(u64::from_le_bytes(bytes))
}

fn read_u8(buf: &[u8], at: usize) -> Result<u8> {
    buf.get(at)
        .copied()
        .ok_or_else(|| SequenceError::truncated(format!("byte at offset {}", at)))
}

/// `(length, tag, value)` records from `start` until `end`.
///
/// The length includes the 4-byte prefix. A length that cannot hold the prefix
/// marks padding before the frame data.
fn parse_variable_headers(buf: &[u8], start: usize, end: usize) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    let mut pos = start;
    while pos + 4 <= end {
        let len = u16::from_le_bytes([buf[pos], buf[pos + 1]]) as usize;
        if len < 4 || pos + len > end {
            break;
        }
        let tag = String::from_utf8_lossy(&buf[pos + 2..pos + 4]).into_owned();
        let raw = &buf[pos + 4..pos + len];
        let trimmed = match raw.iter().rposition(|&b| b != 0) {
            Some(last) => &raw[..=last],
            None => &raw[..0],
        };
        headers.push((tag, String::from_utf8_lossy(trimmed).into_owned()));
        pos += len;
    }
    headers
}

fn push_span(spans: &mut Vec<ChannelSpan>, span: ChannelSpan) {
    if let (Some(ChannelSpan::Missing(prev)), ChannelSpan::Missing(len)) = (spans.last_mut(), &span) {
        *prev += *len;
        return;
    }
    spans.push(span);
}

impl SequenceHeader {
    /// Read and parse the header of the file at `path`.
    pub fn read_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let file_length = file.metadata()?.len();

        let mut fixed = vec![0u8; V2_FIXED_HEADER_LEN.min(file_length as usize)];
        file.read_exact(&mut fixed)?;
        if fixed.len() < 8 {
            return Err(SequenceError::truncated("fixed header"));
        }

        let magic = [fixed[0], fixed[1], fixed[2], fixed[3]];
        let prefix_len = match SequenceFormat::from_magic(magic)? {
            SequenceFormat::Eseq => ESEQ_HEADER_LEN,
            _ => read_u16(&fixed, 4)? as usize,
        };

        let mut buf = fixed;
        if prefix_len > buf.len() {
            let already = buf.len();
            let wanted = prefix_len.min(file_length as usize);
            buf.resize(wanted, 0);
            file.read_exact(&mut buf[already..])?;
        }
        Self::parse(&buf, file_length)
    }

    /// Parse a header from the leading bytes of a file of `file_length` bytes.
    ///
    /// `buf` must cover everything up to the data offset.
    pub fn parse(buf: &[u8], file_length: u64) -> Result<Self> {
        if buf.len() < 8 {
            return Err(SequenceError::truncated("fixed header"));
        }
        let magic = [buf[0], buf[1], buf[2], buf[3]];
        let format = SequenceFormat::from_magic(magic)?;
        if format == SequenceFormat::Eseq {
            return Self::parse_eseq(buf, file_length);
        }

        let major = buf[7];
        let minor = buf[6];
        match major {
            1 => Self::parse_v1(format, buf, file_length),
            2 => Self::parse_v2(format, buf, file_length),
            _ => Err(SequenceError::UnsupportedVersion { major, minor }),
        }
    }

    fn parse_eseq(buf: &[u8], file_length: u64) -> Result<Self> {
        if buf.len() < ESEQ_HEADER_LEN {
            return Err(SequenceError::truncated("ESEQ header"));
        }
        let start_channel = read_u32(buf, 8)?;
        let channel_count = read_u32(buf, 12)?;
        if channel_count == 0 {
            return Err(SequenceError::InvalidHeader("ESEQ model has no channels".into()));
        }
        let data_len = file_length.saturating_sub(ESEQ_HEADER_LEN as u64);
        let frame_count = u32::try_from(data_len / channel_count as u64)
            .map_err(|_| SequenceError::InvalidHeader("ESEQ frame count overflows".into()))?;

        Ok(Self {
            format: SequenceFormat::Eseq,
            major_version: 0,
            minor_version: 0,
            data_offset: ESEQ_HEADER_LEN as u32,
            header_length: ESEQ_HEADER_LEN as u16,
            channel_count,
            frame_count,
            step_ms: ESEQ_DEFAULT_STEP_MS,
            compression: Compression::None,
            blocks: Vec::new(),
            sparse_ranges: Vec::new(),
            variable_headers: Vec::new(),
            id: 0,
            v1: None,
            // Stored 1-based
            model_start_channel: Some(start_channel.saturating_sub(1)),
            file_length,
        })
    }

    fn parse_v1(format: SequenceFormat, buf: &[u8], file_length: u64) -> Result<Self> {
        if buf.len() < V1_FIXED_HEADER_LEN {
            return Err(SequenceError::truncated("v1 fixed header"));
        }
        let data_offset = read_u16(buf, 4)? as usize;
        let header_length = read_u16(buf, 8)?;
        if (header_length as usize) > data_offset {
            return Err(SequenceError::InvalidHeader(format!(
                "header length {} beyond data offset {}",
                header_length, data_offset
            )));
        }
        if buf.len() < data_offset {
            return Err(SequenceError::truncated("v1 variable headers"));
        }

        Ok(Self {
            format,
            major_version: 1,
            minor_version: buf[6],
            data_offset: data_offset as u32,
            header_length,
            channel_count: read_u32(buf, 10)?,
            frame_count: read_u32(buf, 14)?,
            step_ms: read_u8(buf, 18)?,
            compression: Compression::None,
            blocks: Vec::new(),
            sparse_ranges: Vec::new(),
            variable_headers: parse_variable_headers(buf, header_length as usize, data_offset),
            id: 0,
            v1: Some(V1Info {
                universe_count: read_u16(buf, 20)?,
                universe_size: read_u16(buf, 22)?,
                gamma: read_u8(buf, 24)?,
                color_encoding: read_u8(buf, 25)?,
            }),
            model_start_channel: None,
            file_length,
        })
    }

    fn parse_v2(format: SequenceFormat, buf: &[u8], file_length: u64) -> Result<Self> {
        if buf.len() < V2_FIXED_HEADER_LEN {
            return Err(SequenceError::truncated("v2 fixed header"));
        }
        let data_offset = read_u16(buf, 4)? as usize;
        let header_length = read_u16(buf, 8)?;
        let compression = Compression::from_code(buf[20] & 0x0F);
        let block_count = (((buf[20] & 0xF0) as usize) << 4) | buf[21] as usize;
        let sparse_count = buf[22] as usize;

        let blocks_end = V2_FIXED_HEADER_LEN + block_count * BLOCK_ENTRY_LEN;
        let sparse_end = blocks_end + sparse_count * SPARSE_ENTRY_LEN;
        if sparse_end > header_length as usize || (header_length as usize) > data_offset {
            return Err(SequenceError::InvalidHeader(format!(
                "{} blocks and {} sparse ranges do not fit before offset {} (data at {})",
                block_count, sparse_count, header_length, data_offset
            )));
        }
        if buf.len() < data_offset {
            return Err(SequenceError::truncated("v2 variable headers"));
        }

        let mut blocks = Vec::with_capacity(block_count);
        let mut terminated = false;
        for i in 0..block_count {
            let at = V2_FIXED_HEADER_LEN + i * BLOCK_ENTRY_LEN;
            let block = CompressionBlock {
                start_frame: read_u32(buf, at)?,
                byte_length: read_u32(buf, at + 4)?,
            };
            if block.byte_length == 0 {
                terminated = true;
            } else if terminated {
                return Err(SequenceError::InconsistentBlocks(format!(
                    "block {} follows an empty block",
                    i
                )));
            } else {
                blocks.push(block);
            }
        }

        let mut sparse_ranges = Vec::with_capacity(sparse_count);
        for i in 0..sparse_count {
            let at = blocks_end + i * SPARSE_ENTRY_LEN;
            sparse_ranges.push(SparseChannelRange {
                start_channel: read_u24(buf, at)?,
                count: read_u24(buf, at + 3)?,
            });
        }

        Ok(Self {
            format,
            major_version: 2,
            minor_version: buf[6],
            data_offset: data_offset as u32,
            header_length,
            channel_count: read_u32(buf, 10)?,
            frame_count: read_u32(buf, 14)?,
            step_ms: buf[18],
            compression,
            blocks,
            sparse_ranges,
            variable_headers: parse_variable_headers(buf, header_length as usize, data_offset),
            id: read_u64(buf, 24)?,
            v1: None,
            model_start_channel: None,
            file_length,
        })
    }

    /// Bytes of channel data per frame
    pub fn frame_size(&self) -> usize {
        self.channel_count as usize
    }

    /// Frames per second implied by the frame duration
    pub fn fps(&self) -> f64 {
        if self.step_ms == 0 {
            0.0
        } else {
            1000.0 / self.step_ms as f64
        }
    }

    pub fn duration_ms(&self) -> Millis {
        self.frame_count as Millis * self.step_ms as Millis
    }

    /// Start time of `frame` relative to the beginning of the sequence
    pub fn frame_time(&self, frame: u32) -> Millis {
        frame as Millis * self.step_ms as Millis
    }

    /// Frame showing at `time_ms`, if within the sequence
    pub fn frame_at_time(&self, time_ms: Millis) -> Option<u32> {
        if self.step_ms == 0 {
            return None;
        }
        let frame = time_ms / self.step_ms as Millis;
        if frame < self.frame_count as Millis {
            Some(frame as u32)
        } else {
            None
        }
    }

    /// First value of the variable header `tag`
    pub fn variable_header(&self, tag: &str) -> Option<&str> {
        self.variable_headers
            .iter()
            .find(|(t, _)| t == tag)
            .map(|(_, v)| v.as_str())
    }

    /// Audio/video file the sequence was rendered against
    pub fn media_file(&self) -> Option<&str> {
        self.variable_header(TAG_MEDIA_FILE)
    }

    /// Program that produced the file
    pub fn producer(&self) -> Option<&str> {
        self.variable_header(TAG_PRODUCER)
    }

    /// Map of absolute channel ranges onto the stored frame, ordered by channel.
    ///
    /// Each entry is `(first absolute channel, count, stored offset)`.
    fn stored_segments(&self) -> Vec<(u64, u64, u64)> {
        if self.sparse_ranges.is_empty() {
            let base = self.model_start_channel.unwrap_or(0) as u64;
            return vec![(base, self.channel_count as u64, 0)];
        }
        let mut stored = 0u64;
        let mut segments: Vec<(u64, u64, u64)> = self
            .sparse_ranges
            .iter()
            .map(|range| {
                let segment = (range.start_channel as u64, range.count as u64, stored);
                stored += range.count as u64;
                segment
            })
            .collect();
        segments.sort_by_key(|s| s.0);
        segments
    }

    /// Locate absolute channels `start..start + count` (0-based) in a stored
    /// frame. Channels the file does not carry come back as
    /// [`ChannelSpan::Missing`]; the spans cover exactly `count` channels.
    pub fn resolve_channels(&self, start: u32, count: u32) -> Vec<ChannelSpan> {
        let frame_size = self.frame_size() as u64;
        let mut spans = Vec::new();
        let mut cursor = start as u64;
        let end = start as u64 + count as u64;

        for (abs_start, len, stored) in self.stored_segments() {
            if cursor >= end {
                break;
            }
            let abs_end = abs_start + len;
            if abs_end <= cursor {
                continue;
            }
            if abs_start > cursor {
                let gap_end = abs_start.min(end);
                push_span(&mut spans, ChannelSpan::Missing((gap_end - cursor) as usize));
                cursor = gap_end;
                if cursor >= end {
                    break;
                }
            }
            let take_end = abs_end.min(end);
            let from = (stored + cursor - abs_start).min(frame_size);
            let to = (stored + take_end - abs_start).min(frame_size);
            if to > from {
                push_span(&mut spans, ChannelSpan::Stored(from as usize..to as usize));
            }
            let short = (take_end - cursor) - (to - from);
            if short > 0 {
                push_span(&mut spans, ChannelSpan::Missing(short as usize));
            }
            cursor = take_end;
        }
        if cursor < end {
            push_span(&mut spans, ChannelSpan::Missing((end - cursor) as usize));
        }
        spans
    }
}
