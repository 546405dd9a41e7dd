//! Sequence file format
//!
//! Header parsing, the frame-to-chunk index, a synchronous reader for offline
//! use, and a writer for v2 files.

pub mod block_index;
pub mod header;
pub mod reader;
pub mod writer;

pub use block_index::{BlockIndex, ChunkEntry, DEFAULT_PSEUDO_CHUNK_BYTES};
pub use header::{
    ChannelSpan, Compression, CompressionBlock, SequenceFormat, SequenceHeader, SparseChannelRange,
    V1Info,
};
pub use reader::{ModelRange, SequenceReader};
pub use writer::SequenceWriter;
