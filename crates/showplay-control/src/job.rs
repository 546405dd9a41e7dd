//! Send job model
//!
//! A [`SendFrameJob`] is one rendered frame: the source buffers plus one
//! [`SenderJob`] per controller describing, scatter-gather style, which byte
//! ranges of those buffers make up the controller's channels. Each controller
//! keeps a [`SenderCursorState`] recording how far it has got.

use serde::{Deserialize, Serialize};
use showplay_core::Scheduled;

/// Frame data shared by the sender jobs of one frame
pub type FrameBuffer = Box<dyn AsRef<[u8]> + Send + Sync>;

/// A byte range of one source buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendPart {
    /// Index into [`SendFrameJob::buffers`]
    pub buffer: usize,
    pub start: usize,
    pub len: usize,
}

/// Token-bucket limits for one controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingOptions {
    /// Sustained rate in bytes per second (unlimited if unset)
    pub byte_rate: Option<u64>,
    /// Most bytes sent back to back before yielding (whole packets, at least one)
    pub burst_size: Option<usize>,
}

/// Everything one controller receives for a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderJob {
    /// Index of the controller in the dispatcher
    pub controller: usize,
    pub parts: Vec<SendPart>,
    pub pacing: PacingOptions,
}

impl SenderJob {
    pub fn new(controller: usize, parts: Vec<SendPart>) -> Self {
        Self {
            controller,
            parts,
            pacing: PacingOptions::default(),
        }
    }

    pub fn with_pacing(mut self, pacing: PacingOptions) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn total_len(&self) -> usize {
        self.parts.iter().map(|p| p.len).sum()
    }

    /// Time in microseconds that `bytes` take at the configured rate
    pub fn pacing_delay_us(&self, bytes: usize) -> u64 {
        match self.pacing.byte_rate {
            Some(rate) if rate > 0 => (bytes as u64).saturating_mul(1_000_000) / rate,
            _ => 0,
        }
    }
}

/// One frame's buffers and per-controller jobs
#[derive(Default)]
pub struct SendFrameJob {
    pub frame: u32,
    pub buffers: Vec<FrameBuffer>,
    pub sender_jobs: Vec<SenderJob>,
}

impl SendFrameJob {
    pub fn new(frame: u32) -> Self {
        Self {
            frame,
            buffers: Vec::new(),
            sender_jobs: Vec::new(),
        }
    }

    /// Add a buffer and return its index
    pub fn add_buffer(&mut self, buffer: FrameBuffer) -> usize {
        self.buffers.push(buffer);
        self.buffers.len() - 1
    }

    /// Bytes of `part`. Ranges beyond the buffer come back short.
    pub fn part_bytes(&self, part: &SendPart) -> &[u8] {
        let Some(buffer) = self.buffers.get(part.buffer) else {
            return &[];
        };
        let data = (**buffer).as_ref();
        let start = part.start.min(data.len());
        let end = part.start.saturating_add(part.len).min(data.len());
        &data[start..end]
    }
}

impl std::fmt::Debug for SendFrameJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendFrameJob")
            .field("frame", &self.frame)
            .field("buffers", &self.buffers.len())
            .field("sender_jobs", &self.sender_jobs)
            .finish()
    }
}

/// Per-controller progress through a frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderCursorState {
    pub part_index: usize,
    pub part_offset: usize,
    /// Earliest time (microseconds on the dispatcher clock) of the next send
    pub next_time: u64,
    /// Channel bytes sent so far this frame
    pub channel_cursor: usize,
    /// Data packets sent so far this frame
    pub packets: usize,
    /// Bytes sent by the most recent portion
    pub last_portion_bytes: usize,
    /// Protocol sequence number of the last data packet
    pub sequence: u8,
    /// Sequence number of the last sync packet
    pub sync_sequence: u8,
}

impl SenderCursorState {
    /// Rewind for a new frame. Sequence numbers carry over.
    pub fn reset(&mut self, now: u64) {
        self.part_index = 0;
        self.part_offset = 0;
        self.next_time = now;
        self.channel_cursor = 0;
        self.packets = 0;
        self.last_portion_bytes = 0;
    }

    /// True once no channel bytes remain. Trailing empty parts do not count.
    pub fn is_exhausted(&self, job: &SenderJob) -> bool {
        self.remaining(job) == 0
    }

    /// Step over parts that are used up or empty
    fn skip_spent(&mut self, job: &SenderJob) {
        while let Some(part) = job.parts.get(self.part_index) {
            if self.part_offset < part.len {
                break;
            }
            self.part_index += 1;
            self.part_offset = 0;
        }
    }

    /// Channel bytes still to send this frame
    pub fn remaining(&self, job: &SenderJob) -> usize {
        job.parts
            .iter()
            .skip(self.part_index)
            .map(|p| p.len)
            .sum::<usize>()
            .saturating_sub(self.part_offset)
    }

    /// Append up to `limit` channel bytes to `out`, advancing the cursor.
    /// Part bytes missing from a short buffer are sent as zero.
    pub fn gather(&mut self, frame: &SendFrameJob, job: &SenderJob, limit: usize, out: &mut Vec<u8>) -> usize {
        let mut taken = 0;
        self.skip_spent(job);
        while taken < limit {
            let Some(part) = job.parts.get(self.part_index) else {
                break;
            };
            let want = (part.len - self.part_offset).min(limit - taken);
            let bytes = frame.part_bytes(part);
            let from = self.part_offset.min(bytes.len());
            let to = (self.part_offset + want).min(bytes.len());
            out.extend_from_slice(&bytes[from..to]);
            out.resize(out.len() + want - (to - from), 0);

            taken += want;
            self.part_offset += want;
            self.skip_spent(job);
        }
        self.channel_cursor += taken;
        taken
    }
}

impl Scheduled for SenderCursorState {
    fn next_time(&self) -> u64 {
        self.next_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> (SendFrameJob, SenderJob) {
        let mut frame = SendFrameJob::new(0);
        let a = frame.add_buffer(Box::new((0u8..10).collect::<Vec<u8>>()));
        let b = frame.add_buffer(Box::new(vec![100u8, 101, 102]));
        let sender = SenderJob::new(
            0,
            vec![
                SendPart { buffer: a, start: 2, len: 4 },
                SendPart { buffer: b, start: 0, len: 5 },
            ],
        );
        (frame, sender)
    }

    #[test]
    fn test_gather_across_parts() {
        let (frame, sender) = job();
        let mut state = SenderCursorState::default();
        let mut out = Vec::new();

        assert_eq!(state.gather(&frame, &sender, 3, &mut out), 3);
        assert_eq!(out, vec![2, 3, 4]);
        assert_eq!(state.remaining(&sender), 6);

        out.clear();
        assert_eq!(state.gather(&frame, &sender, 100, &mut out), 6);
        // Buffer b is two bytes short of its part
        assert_eq!(out, vec![5, 100, 101, 102, 0, 0]);
        assert!(state.is_exhausted(&sender));
        assert_eq!(state.channel_cursor, 9);
    }

    #[test]
    fn test_empty_parts_are_skipped() {
        let mut frame = SendFrameJob::new(0);
        let a = frame.add_buffer(Box::new(vec![1u8, 2, 3, 4]));
        let empty = SendPart { buffer: a, start: 0, len: 0 };
        let sender = SenderJob::new(
            0,
            vec![
                empty,
                SendPart { buffer: a, start: 0, len: 2 },
                empty,
                SendPart { buffer: a, start: 2, len: 2 },
                empty,
            ],
        );
        let mut state = SenderCursorState::default();
        let mut out = Vec::new();

        assert_eq!(state.gather(&frame, &sender, 2, &mut out), 2);
        assert!(!state.is_exhausted(&sender));
        assert_eq!(state.gather(&frame, &sender, 100, &mut out), 2);
        assert_eq!(out, vec![1, 2, 3, 4]);
        assert!(state.is_exhausted(&sender));
        assert_eq!(state.part_index, sender.parts.len());

        let all_empty = SenderJob::new(0, vec![empty, empty]);
        let mut state = SenderCursorState::default();
        assert!(state.is_exhausted(&all_empty));
        assert_eq!(state.gather(&frame, &all_empty, 10, &mut Vec::new()), 0);
        assert_eq!(state.part_index, 2);
    }

    #[test]
    fn test_reset_keeps_sequences() {
        let (frame, sender) = job();
        let mut state = SenderCursorState {
            sequence: 9,
            sync_sequence: 3,
            ..Default::default()
        };
        state.gather(&frame, &sender, 100, &mut Vec::new());
        state.reset(500);
        assert_eq!(state.part_index, 0);
        assert_eq!(state.channel_cursor, 0);
        assert_eq!(state.next_time(), 500);
        assert_eq!(state.sequence, 9);
        assert_eq!(state.sync_sequence, 3);
    }

    #[test]
    fn test_pacing_delay() {
        let (_, sender) = job();
        assert_eq!(sender.pacing_delay_us(1000), 0);
        let paced = sender.with_pacing(PacingOptions {
            byte_rate: Some(1_000_000),
            burst_size: None,
        });
        assert_eq!(paced.pacing_delay_us(1440), 1440);
    }
}
