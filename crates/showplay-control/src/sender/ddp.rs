//! DDP (Distributed Display Protocol) sender
//!
//! Header layout (big-endian):
//!
//! | byte | field |
//! |------|-------|
//! | 0 | flags: version 1 (`0x40`), timecode (`0x10`), push (`0x01`) |
//! | 1 | sequence number, low nibble, 1-15 |
//! | 2 | data type (0 = agreed out of band) |
//! | 3 | destination id (1 = default output) |
//! | 4-7 | channel offset |
//! | 8-9 | payload length |
//! | 10-13 | timecode, only with the timecode flag |

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::trace;

use super::{next_burst_len, Sender};
use crate::job::{SendFrameJob, SenderCursorState, SenderJob};
use crate::transport::{SendBatch, UdpTransport};

pub const DDP_PORT: u16 = 4048;
pub const DDP_HEADER_LEN: usize = 10;
pub const DDP_TIMECODE_HEADER_LEN: usize = 14;
pub const DDP_MAX_PAYLOAD: usize = 1440;

pub const DDP_FLAG_VERSION_1: u8 = 0x40;
pub const DDP_FLAG_TIMECODE: u8 = 0x10;
pub const DDP_FLAG_PUSH: u8 = 0x01;
pub const DDP_DEFAULT_DESTINATION: u8 = 1;

/// Decoded DDP header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DdpHeader {
    pub push: bool,
    pub sequence: u8,
    pub data_type: u8,
    pub destination: u8,
    pub offset: u32,
    pub length: u16,
    pub timecode: Option<u32>,
}

impl DdpHeader {
    pub fn encoded_len(&self) -> usize {
        if self.timecode.is_some() {
            DDP_TIMECODE_HEADER_LEN
        } else {
            DDP_HEADER_LEN
        }
    }

    /// Write into the first `encoded_len()` bytes of `out`.
    pub fn write(&self, out: &mut [u8]) {
        let mut flags = DDP_FLAG_VERSION_1;
        if self.push {
            flags |= DDP_FLAG_PUSH;
        }
        if self.timecode.is_some() {
            flags |= DDP_FLAG_TIMECODE;
        }
        out[0] = flags;
        out[1] = self.sequence & 0x0F;
        out[2] = self.data_type;
        out[3] = self.destination;
        out[4..8].copy_from_slice(&self.offset.to_be_bytes());
        out[8..10].copy_from_slice(&self.length.to_be_bytes());
        if let Some(timecode) = self.timecode {
            out[10..14].copy_from_slice(&timecode.to_be_bytes());
        }
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < DDP_HEADER_LEN || buf[0] & 0xC0 != DDP_FLAG_VERSION_1 {
            return None;
        }
        let timecode = if buf[0] & DDP_FLAG_TIMECODE != 0 {
            let tc = buf.get(10..14)?;
            Some(u32::from_be_bytes([tc[0], tc[1], tc[2], tc[3]]))
        } else {
            None
        };
        Some(Self {
            push: buf[0] & DDP_FLAG_PUSH != 0,
            sequence: buf[1] & 0x0F,
            data_type: buf[2],
            destination: buf[3],
            offset: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            length: u16::from_be_bytes([buf[8], buf[9]]),
            timecode,
        })
    }
}

/// Next DDP sequence number after `current` (1-15, wrapping; 0 is unused)
pub fn next_sequence(current: u8) -> u8 {
    current % 15 + 1
}

/// DDP sender settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DdpOptions {
    /// Send a zero-length push packet at the end of every frame. When off,
    /// the push flag rides on the last data packet instead.
    pub push_at_end_of_frame: bool,
    pub max_payload: usize,
    pub data_type: u8,
    pub destination: u8,
    /// Stamp packets with the frame's timecode
    pub timecode: bool,
}

impl Default for DdpOptions {
    fn default() -> Self {
        Self {
            push_at_end_of_frame: true,
            max_payload: DDP_MAX_PAYLOAD,
            data_type: 0,
            destination: DDP_DEFAULT_DESTINATION,
            timecode: false,
        }
    }
}

pub struct DdpSender {
    transport: Arc<UdpTransport>,
    options: DdpOptions,
    packet: Vec<u8>,
    timecode: u32,
}

impl DdpSender {
    pub fn new(transport: Arc<UdpTransport>, options: DdpOptions) -> Self {
        let max_payload = options.max_payload.clamp(1, u16::MAX as usize);
        Self {
            transport,
            options: DdpOptions {
                max_payload,
                ..options
            },
            packet: Vec::with_capacity(DDP_TIMECODE_HEADER_LEN + max_payload),
            timecode: 0,
        }
    }

    pub fn transport(&self) -> &Arc<UdpTransport> {
        &self.transport
    }

    pub fn options(&self) -> &DdpOptions {
        &self.options
    }

    fn header(&self, push: bool, sequence: u8, offset: usize, length: usize) -> DdpHeader {
        DdpHeader {
            push,
            sequence,
            data_type: self.options.data_type,
            destination: self.options.destination,
            offset: offset as u32,
            length: length as u16,
            timecode: self.options.timecode.then_some(self.timecode),
        }
    }
}

impl Sender for DdpSender {
    fn start_frame(&mut self, job: &SendFrameJob) {
        self.timecode = job.frame;
    }

    fn start_batch(&mut self) {
        self.transport.start_send_batch();
    }

    fn end_batch(&mut self) -> Option<SendBatch> {
        self.transport.end_send_batch()
    }

    fn send_portion(&mut self, job: &SendFrameJob, sender_job: &SenderJob, state: &mut SenderCursorState) -> bool {
        let burst = sender_job.pacing.burst_size.unwrap_or(usize::MAX);
        let mut sent = 0;
        while !state.is_exhausted(sender_job) {
            let len = next_burst_len(state.remaining(sender_job), self.options.max_payload, sent, burst);
            if len == 0 {
                break;
            }

            let offset = state.channel_cursor;
            let header_len = if self.options.timecode {
                DDP_TIMECODE_HEADER_LEN
            } else {
                DDP_HEADER_LEN
            };
            self.packet.clear();
            self.packet.resize(header_len, 0);
            let taken = state.gather(job, sender_job, len, &mut self.packet);

            let last = state.is_exhausted(sender_job);
            state.sequence = next_sequence(state.sequence);
            let push = last && !self.options.push_at_end_of_frame;
            let header = self.header(push, state.sequence, offset, taken);
            header.write(&mut self.packet[..header_len]);

            self.transport.add_send_to_batch(&self.packet);
            state.packets += 1;
            sent += taken;
        }
        state.last_portion_bytes = sent;
        trace!(
            "DDP portion to {}: {} bytes, cursor {}",
            self.transport.destination(),
            sent,
            state.channel_cursor
        );
        !state.is_exhausted(sender_job)
    }

    fn send_push(&mut self, _job: &SendFrameJob, _sender_job: &SenderJob, state: &mut SenderCursorState) {
        if !self.options.push_at_end_of_frame {
            return;
        }
        state.sequence = next_sequence(state.sequence);
        let header = self.header(true, state.sequence, state.channel_cursor, 0);
        let mut packet = [0u8; DDP_TIMECODE_HEADER_LEN];
        let len = header.encoded_len();
        header.write(&mut packet[..len]);
        self.transport.add_send_to_batch(&packet[..len]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = DdpHeader {
            push: true,
            sequence: 7,
            data_type: 0,
            destination: 1,
            offset: 0x0102_0304,
            length: 1440,
            timecode: None,
        };
        let mut buf = [0u8; DDP_HEADER_LEN];
        header.write(&mut buf);
        assert_eq!(buf[0], 0x41);
        assert_eq!(&buf[4..8], &[1, 2, 3, 4]);
        assert_eq!(&buf[8..10], &1440u16.to_be_bytes());
        assert_eq!(DdpHeader::parse(&buf), Some(header));
    }

    #[test]
    fn test_timecode_header() {
        let header = DdpHeader {
            push: false,
            sequence: 15,
            data_type: 0,
            destination: 1,
            offset: 2880,
            length: 3,
            timecode: Some(99),
        };
        let mut buf = [0u8; DDP_TIMECODE_HEADER_LEN];
        header.write(&mut buf);
        assert_eq!(buf[0], 0x50);
        assert_eq!(DdpHeader::parse(&buf), Some(header));
        assert_eq!(DdpHeader::parse(&buf[..12]), None);
    }

    #[test]
    fn test_sequence_wraps_one_to_fifteen() {
        assert_eq!(next_sequence(0), 1);
        assert_eq!(next_sequence(14), 15);
        assert_eq!(next_sequence(15), 1);
        let mut seq = 0;
        for _ in 0..30 {
            seq = next_sequence(seq);
            assert!((1..=15).contains(&seq));
        }
    }
}
