//! Error types for controller output
use thiserror::Error;

/// Controller output errors
#[derive(Error, Debug)]
pub enum ControlError {
    /// I/O error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Controller address did not resolve
    #[error("Cannot resolve '{address}': {reason}")]
    Resolve { address: String, reason: String },

    /// Transport used before `connect`
    #[error("Not connected to {0}")]
    NotConnected(String),

    /// Invalid controller descriptor
    #[error(transparent)]
    Core(#[from] showplay_core::CoreError),
}

/// Result type for control operations
pub type Result<T> = std::result::Result<T, ControlError>;
