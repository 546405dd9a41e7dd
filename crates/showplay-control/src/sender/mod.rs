//! Protocol senders
//!
//! A [`Sender`] turns one controller's share of a [`SendFrameJob`] into wire
//! packets and hands them to its transport. Senders never sleep; pacing is
//! applied by the dispatcher between calls to [`Sender::send_portion`].

pub mod ddp;
pub mod e131;

use crate::job::{SendFrameJob, SenderCursorState, SenderJob};
use crate::transport::{SendBatch, UdpTransport};
use showplay_core::ControllerProtocol;
use std::sync::Arc;

pub use ddp::{DdpHeader, DdpOptions, DdpSender};
pub use e131::{E131Header, E131Options, E131Sender};

/// Capability shared by the protocol senders
pub trait Sender {
    fn start_frame(&mut self, _job: &SendFrameJob) {}

    fn end_frame(&mut self, _job: &SendFrameJob) {}

    fn start_batch(&mut self);

    fn end_batch(&mut self) -> Option<SendBatch>;

    /// Send the next portion of `sender_job`. Returns true while data remains
    /// for this frame.
    fn send_portion(&mut self, job: &SendFrameJob, sender_job: &SenderJob, state: &mut SenderCursorState) -> bool;

    /// Mark the end of the frame, if the sender is configured to.
    fn send_push(&mut self, job: &SendFrameJob, sender_job: &SenderJob, state: &mut SenderCursorState);
}

/// Length of the next packet of a burst, or 0 if the burst is full.
///
/// A burst always carries at least one packet so a burst size smaller than
/// one packet still makes progress.
pub(crate) fn next_burst_len(remaining: usize, packet_limit: usize, sent: usize, burst: usize) -> usize {
    let len = remaining.min(packet_limit);
    if len == 0 || (sent > 0 && sent.saturating_add(len) > burst) {
        0
    } else {
        len
    }
}

/// The fixed set of protocol senders
pub enum ProtocolSender {
    Ddp(DdpSender),
    E131(E131Sender),
}

impl ProtocolSender {
    pub fn protocol(&self) -> ControllerProtocol {
        match self {
            ProtocolSender::Ddp(_) => ControllerProtocol::Ddp,
            ProtocolSender::E131(_) => ControllerProtocol::E131,
        }
    }

    pub fn transport(&self) -> &Arc<UdpTransport> {
        match self {
            ProtocolSender::Ddp(s) => s.transport(),
            ProtocolSender::E131(s) => s.transport(),
        }
    }
}

impl Sender for ProtocolSender {
    fn start_frame(&mut self, job: &SendFrameJob) {
        match self {
            ProtocolSender::Ddp(s) => s.start_frame(job),
            ProtocolSender::E131(s) => s.start_frame(job),
        }
    }

    fn end_frame(&mut self, job: &SendFrameJob) {
        match self {
            ProtocolSender::Ddp(s) => s.end_frame(job),
            ProtocolSender::E131(s) => s.end_frame(job),
        }
    }

    fn start_batch(&mut self) {
        match self {
            ProtocolSender::Ddp(s) => s.start_batch(),
            ProtocolSender::E131(s) => s.start_batch(),
        }
    }

    fn end_batch(&mut self) -> Option<SendBatch> {
        match self {
            ProtocolSender::Ddp(s) => s.end_batch(),
            ProtocolSender::E131(s) => s.end_batch(),
        }
    }

    fn send_portion(&mut self, job: &SendFrameJob, sender_job: &SenderJob, state: &mut SenderCursorState) -> bool {
        match self {
            ProtocolSender::Ddp(s) => s.send_portion(job, sender_job, state),
            ProtocolSender::E131(s) => s.send_portion(job, sender_job, state),
        }
    }

    fn send_push(&mut self, job: &SendFrameJob, sender_job: &SenderJob, state: &mut SenderCursorState) {
        match self {
            ProtocolSender::Ddp(s) => s.send_push(job, sender_job, state),
            ProtocolSender::E131(s) => s.send_push(job, sender_job, state),
        }
    }
}

impl From<DdpSender> for ProtocolSender {
    fn from(sender: DdpSender) -> Self {
        ProtocolSender::Ddp(sender)
    }
}

impl From<E131Sender> for ProtocolSender {
    fn from(sender: E131Sender) -> Self {
        ProtocolSender::E131(sender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_always_sends_one_packet() {
        assert_eq!(next_burst_len(3000, 1440, 0, 100), 1440);
        assert_eq!(next_burst_len(3000, 1440, 1440, 100), 0);
    }

    #[test]
    fn test_burst_packs_whole_packets() {
        assert_eq!(next_burst_len(3000, 1440, 1440, 3000), 1440);
        assert_eq!(next_burst_len(120, 1440, 2880, 3000), 120);
        assert_eq!(next_burst_len(200, 1440, 2880, 3000), 0);
        assert_eq!(next_burst_len(0, 1440, 0, usize::MAX), 0);
    }
}
