//! ShowPlay I/O - sequence files and decoded frame caching
//!
//! - **fseq**: header parsing for v1, v2 and ESEQ files, the frame-to-chunk
//!   index, an offline reader and a v2 writer
//! - **prefetch**: the frame cache that keeps upcoming frames decoded ahead of
//!   playback

pub mod error;
pub mod fseq;
pub mod prefetch;

pub use error::{Result, SequenceError};
pub use fseq::{
    BlockIndex, ChannelSpan, ChunkEntry, Compression, ModelRange, SequenceFormat, SequenceHeader,
    SequenceReader, SequenceWriter,
};
pub use prefetch::{
    FrameCache, FrameCacheOptions, FrameCacheStats, FramePriority, FrameReference, FrameSelector,
    SequenceFile,
};
