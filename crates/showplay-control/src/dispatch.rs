//! Frame dispatch loop
//!
//! The dispatcher fans a [`SendFrameJob`] out to the controllers it names.
//! Controllers are visited in order of their cursor's `next_time` through a
//! min-heap, so a rate-limited controller yields to the others between bursts.
//! Wall-clock delay only happens in the `sleep` function handed to
//! [`FrameDispatcher::send_full`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::job::{SendFrameJob, SenderCursorState};
use crate::sender::{ProtocolSender, Sender};
use crate::transport::{SendBatch, UdpTransport};
use showplay_core::{ControllerSetup, MinHeap, Scheduled};

/// An opened controller and the sender bound to it
pub struct ControllerOutput {
    pub setup: ControllerSetup,
    pub sender: ProtocolSender,
}

impl ControllerOutput {
    pub fn new(setup: ControllerSetup, sender: impl Into<ProtocolSender>) -> Self {
        Self {
            setup,
            sender: sender.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.setup.name
    }

    pub fn transport(&self) -> &Arc<UdpTransport> {
        self.sender.transport()
    }
}

#[derive(Debug, Clone, Copy)]
struct CursorSlot {
    /// Index into the frame's sender jobs
    job: usize,
    next_time: u64,
}

impl Scheduled for CursorSlot {
    fn next_time(&self) -> u64 {
        self.next_time
    }
}

/// What one frame put on the wire
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameSendSummary {
    pub controllers: usize,
    pub packets: usize,
    pub bytes: usize,
}

pub struct FrameDispatcher {
    outputs: Vec<ControllerOutput>,
    states: Vec<SenderCursorState>,
    heap: MinHeap<CursorSlot>,
    /// Sender jobs of the current frame addressed to an active controller
    active: Vec<usize>,
}

impl FrameDispatcher {
    pub fn new(outputs: Vec<ControllerOutput>) -> Self {
        let count = outputs.len();
        Self {
            outputs,
            states: vec![SenderCursorState::default(); count],
            heap: MinHeap::with_capacity(count),
            active: Vec::with_capacity(count),
        }
    }

    pub fn outputs(&self) -> &[ControllerOutput] {
        &self.outputs
    }

    pub fn state(&self, controller: usize) -> Option<&SenderCursorState> {
        self.states.get(controller)
    }

    /// Rewind every addressed controller and schedule it at `now_us`.
    pub fn start_frame(&mut self, job: &SendFrameJob, now_us: u64) {
        self.heap.clear();
        self.active.clear();
        for (index, sender_job) in job.sender_jobs.iter().enumerate() {
            let Some(output) = self.outputs.get_mut(sender_job.controller) else {
                debug!(
                    "Frame {} addresses unknown controller {}",
                    job.frame, sender_job.controller
                );
                continue;
            };
            if !output.setup.is_active() {
                continue;
            }
            output.sender.start_frame(job);
            self.states[sender_job.controller].reset(now_us);
            self.heap.insert(CursorSlot {
                job: index,
                next_time: now_us,
            });
            self.active.push(index);
        }
    }

    pub fn start_batch(&mut self, job: &SendFrameJob) {
        for &index in &self.active {
            let controller = job.sender_jobs[index].controller;
            self.outputs[controller].sender.start_batch();
        }
    }

    pub fn end_batch(&mut self, job: &SendFrameJob) -> Vec<SendBatch> {
        let mut batches = Vec::with_capacity(self.active.len());
        for &index in &self.active {
            let controller = job.sender_jobs[index].controller;
            if let Some(batch) = self.outputs[controller].sender.end_batch() {
                batches.push(batch);
            }
        }
        batches
    }

    /// Give each eligible controller one portion.
    ///
    /// Returns -1 once every controller has sent its whole frame, otherwise
    /// the microseconds until the next controller becomes eligible (0 if one
    /// already is).
    pub fn send_partial(&mut self, job: &SendFrameJob, now_us: u64) -> i64 {
        let rounds = self.heap.len();
        for _ in 0..rounds {
            let Some(slot) = self.heap.top().copied() else {
                break;
            };
            if slot.next_time > now_us {
                break;
            }
            let sender_job = &job.sender_jobs[slot.job];
            let state = &mut self.states[sender_job.controller];
            let more = self.outputs[sender_job.controller]
                .sender
                .send_portion(job, sender_job, state);

            // A portion that moved nothing cannot make progress later either
            if more && state.last_portion_bytes > 0 {
                let delay = sender_job.pacing_delay_us(state.last_portion_bytes);
                state.next_time = state.next_time.max(now_us).saturating_add(delay);
                let next_time = state.next_time;
                self.heap.update_top(|slot| slot.next_time = next_time);
            } else {
                trace!(
                    "Controller {} done with frame {}: {} packets",
                    sender_job.controller,
                    job.frame,
                    state.packets
                );
                self.heap.pop();
            }
        }

        match self.heap.top() {
            None => -1,
            Some(slot) => slot.next_time.saturating_sub(now_us).min(i64::MAX as u64) as i64,
        }
    }

    /// Push/sync every addressed controller and close the frame.
    pub fn end_frame(&mut self, job: &SendFrameJob) {
        for &index in &self.active {
            let sender_job = &job.sender_jobs[index];
            let controller = sender_job.controller;
            let output = &mut self.outputs[controller];
            output.sender.send_push(job, sender_job, &mut self.states[controller]);
            output.sender.end_frame(job);
        }
    }

    pub fn summary(&self, job: &SendFrameJob) -> FrameSendSummary {
        let mut summary = FrameSendSummary::default();
        for &index in &self.active {
            let state = &self.states[job.sender_jobs[index].controller];
            summary.controllers += 1;
            summary.packets += state.packets;
            summary.bytes += state.channel_cursor;
        }
        summary
    }

    /// Send the whole frame, awaiting `sleep` whenever every controller is
    /// waiting on its pacing budget, then wait for deferred sends to finish.
    pub async fn send_full<F, Fut>(&mut self, job: &SendFrameJob, mut sleep: F) -> FrameSendSummary
    where
        F: FnMut(Duration) -> Fut,
        Fut: Future<Output = ()>,
    {
        let origin = Instant::now();
        let now_us = || origin.elapsed().as_micros().min(u64::MAX as u128) as u64;

        self.start_frame(job, now_us());
        self.start_batch(job);
        loop {
            let wait = self.send_partial(job, now_us());
            if wait < 0 {
                break;
            }
            if wait > 0 {
                sleep(Duration::from_micros(wait as u64)).await;
            }
        }
        self.end_frame(job);

        for batch in self.end_batch(job) {
            batch.wait().await;
        }
        self.summary(job)
    }

    pub fn into_outputs(self) -> Vec<ControllerOutput> {
        self.outputs
    }
}
