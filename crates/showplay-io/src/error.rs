//! Error types for sequence file I/O

use showplay_core::CacheError;

/// Result type alias for sequence operations.
pub type Result<T> = std::result::Result<T, SequenceError>;

/// Errors raised while reading, writing, or serving sequence files.
#[derive(Debug, thiserror::Error)]
pub enum SequenceError {
    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file does not start with a known magic
    #[error("Unrecognized sequence magic {0:?}")]
    BadMagic([u8; 4]),

    /// Major version we cannot read
    #[error("Unsupported sequence version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },

    /// Fewer bytes than the header declares
    #[error("Truncated sequence: {0}")]
    Truncated(String),

    /// Header fields that contradict each other
    #[error("Invalid sequence header: {0}")]
    InvalidHeader(String),

    /// Compression block list is not contiguous or out of order
    #[error("Inconsistent compression blocks: {0}")]
    InconsistentBlocks(String),

    /// Compression kind is recognized but not decoded
    #[error("Compression not implemented: {0}")]
    NotImplemented(String),

    #[error("Frame {frame} out of range (sequence has {frame_count} frames)")]
    FrameOutOfRange { frame: u64, frame_count: u32 },

    /// Frame data handed to the writer has the wrong size
    #[error("Invalid frame data: {0}")]
    InvalidFrame(String),

    /// Failure surfaced through the frame cache
    #[error("Frame cache: {0}")]
    Cache(#[from] CacheError),
}

impl SequenceError {
    pub(crate) fn truncated(what: impl Into<String>) -> Self {
        SequenceError::Truncated(what.into())
    }
}
