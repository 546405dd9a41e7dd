//! ShowPlay Control - controller output
//!
//! This crate puts frames on the wire:
//! - **Transport**: non-blocking UDP with send batches
//! - **Senders**: DDP and E1.31 (sACN) packet encoders
//! - **Send jobs**: scatter-gather description of a frame per controller
//! - **Dispatch**: paced fan-out of a frame to every controller
//! - **Ping**: ICMP echo reachability of controllers

#![allow(missing_docs)]

/// Controller opening
pub mod controllers;
/// Frame dispatch loop
pub mod dispatch;
/// Error types
pub mod error;
/// Send job model
pub mod job;
/// Controller reachability
pub mod ping;
/// Protocol senders
pub mod sender;
/// UDP transport
pub mod transport;

pub use controllers::{open_controllers, resolve_address, OutputOptions};
pub use dispatch::{ControllerOutput, FrameDispatcher, FrameSendSummary};
pub use error::{ControlError, Result};
pub use ping::ping;
pub use job::{FrameBuffer, PacingOptions, SendFrameJob, SendPart, SenderCursorState, SenderJob};
pub use sender::{
    DdpHeader, DdpOptions, DdpSender, E131Header, E131Options, E131Sender, ProtocolSender, Sender,
};
pub use transport::{SendBatch, TransportOptions, TransportStats, UdpTransport};
