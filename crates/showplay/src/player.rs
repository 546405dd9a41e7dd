//! Sequence playback
//!
//! Plays one sequence file at its own frame rate: frames ahead of the playhead
//! are prefetched into the frame cache, each due frame is mapped onto the
//! controllers' channel ranges and handed to the dispatcher.

use anyhow::{Context, Result};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use showplay_control::{ControllerOutput, FrameDispatcher, PacingOptions, SendFrameJob, SendPart, SenderJob};
use showplay_core::Millis;
use showplay_io::{ChannelSpan, FrameCache, FramePriority, FrameReference, FrameSelector, SequenceHeader};

use crate::config::PlaybackConfig;

/// Index of the frame data in every job
const FRAME_BUFFER: usize = 0;
/// Index of the zero block standing in for channels the file lacks
const ZERO_BUFFER: usize = 1;

/// How each controller's channels map onto a stored frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelLayout {
    parts: Vec<Vec<SendPart>>,
    zero_len: usize,
}

impl ChannelLayout {
    pub fn new(header: &SequenceHeader, outputs: &[ControllerOutput]) -> Self {
        let mut zero_len = 0;
        let parts = outputs
            .iter()
            .map(|output| {
                let setup = &output.setup;
                header
                    .resolve_channels(setup.frame_offset() as u32, setup.channel_count)
                    .into_iter()
                    .map(|span| match span {
                        ChannelSpan::Stored(range) => SendPart {
                            buffer: FRAME_BUFFER,
                            start: range.start,
                            len: range.len(),
                        },
                        ChannelSpan::Missing(len) => {
                            zero_len = zero_len.max(len);
                            SendPart {
                                buffer: ZERO_BUFFER,
                                start: 0,
                                len,
                            }
                        }
                    })
                    .collect()
            })
            .collect();
        Self { parts, zero_len }
    }

    pub fn controller_parts(&self, controller: usize) -> &[SendPart] {
        self.parts.get(controller).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Counters for one playback run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackSummary {
    pub frames_sent: u64,
    /// Frames skipped because playback fell behind
    pub frames_skipped: u64,
    /// Frames that could not be read
    pub frame_errors: u64,
    pub packets: u64,
    pub loops: u64,
}

pub struct Player {
    sequence: PathBuf,
    cache: FrameCache,
    dispatcher: FrameDispatcher,
    settings: PlaybackConfig,
    pacing: PacingOptions,
    clock: Instant,
}

impl Player {
    pub fn new(
        sequence: PathBuf,
        cache: FrameCache,
        outputs: Vec<ControllerOutput>,
        settings: PlaybackConfig,
        pacing: PacingOptions,
    ) -> Self {
        Self {
            sequence,
            cache,
            dispatcher: FrameDispatcher::new(outputs),
            settings,
            pacing,
            clock: Instant::now(),
        }
    }

    /// Milliseconds since the player was created; the frame cache's clock
    fn now_ms(&self) -> Millis {
        self.clock.elapsed().as_millis() as Millis
    }

    fn prefetch_ahead(&self, header: &SequenceHeader, frame: u32) {
        let step = header.step_ms.max(1) as u64;
        let lookahead = (self.settings.lookahead_ms / step).max(1) as u32;
        let now = self.now_ms();
        let end = frame.saturating_add(lookahead).min(header.frame_count);
        self.cache
            .prefetch_seq_frames(&self.sequence, frame..end, FramePriority::at(now), now, None);

        // Wrap the look-ahead into the start of the next loop
        let wrapped = frame.saturating_add(lookahead).saturating_sub(header.frame_count);
        if self.settings.loop_playback && wrapped > 0 {
            let needed_at = now + header.frame_time(header.frame_count - frame);
            self.cache.prefetch_seq_frames(
                &self.sequence,
                0..wrapped.min(header.frame_count),
                FramePriority::at(needed_at),
                now,
                None,
            );
        }
        self.cache.dispatch(now);
    }

    fn build_job(&self, layout: &ChannelLayout, data: FrameReference, zeros: &Arc<[u8]>) -> SendFrameJob {
        let mut job = SendFrameJob::new(data.frame());
        job.add_buffer(Box::new(data));
        job.add_buffer(Box::new(Arc::clone(zeros)));
        for controller in 0..self.dispatcher.outputs().len() {
            job.sender_jobs.push(
                SenderJob::new(controller, layout.controller_parts(controller).to_vec()).with_pacing(self.pacing),
            );
        }
        job
    }

    fn log_stats(&self, summary: &PlaybackSummary) {
        let stats = self.cache.stats();
        info!(
            "Played {} frames ({} skipped, {} errors), {} packets; cache {} chunks / {} bytes, {} hits / {} misses",
            summary.frames_sent,
            summary.frames_skipped,
            summary.frame_errors,
            summary.packets,
            stats.chunks.item_count(),
            stats.chunks.realized_cost,
            stats.chunks.reference.hits,
            stats.chunks.reference.misses,
        );
        for output in self.dispatcher.outputs() {
            let transport = output.transport().stats();
            debug!(
                "  {}: {} sent, {} dropped, {} errors",
                output.name(),
                transport.sent,
                transport.dropped,
                transport.errors
            );
        }
    }

    /// Play until the sequence ends (never, when looping) or `shutdown`
    /// resolves. The frame cache is shut down before returning.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<PlaybackSummary> {
        tokio::pin!(shutdown);
        let result = self.play(&mut shutdown).await;
        self.cache.shutdown().await;
        result
    }

    async fn play(&mut self, shutdown: &mut (impl Future<Output = ()> + Unpin)) -> Result<PlaybackSummary> {
        let header = self
            .cache
            .load_header(&self.sequence, self.now_ms())
            .await
            .with_context(|| format!("Failed to open sequence {:?}", self.sequence))?;
        let step_ms = header.step_ms.max(1) as u64;
        info!(
            "Playing {:?}: {} frames of {} channels at {:.1} fps ({} ms)",
            self.sequence,
            header.frame_count,
            header.channel_count,
            header.fps(),
            header.duration_ms()
        );

        let layout = ChannelLayout::new(&header, self.dispatcher.outputs());
        let zeros: Arc<[u8]> = vec![0u8; layout.zero_len].into();
        let mut summary = PlaybackSummary::default();
        let stats_every = Duration::from_secs(self.settings.stats_interval_secs);
        let mut last_stats = Instant::now();

        let mut frame = self.settings.start_frame;
        let mut origin = Instant::now();
        let mut origin_frame = frame;

        loop {
            if frame >= header.frame_count {
                if !self.settings.loop_playback {
                    break;
                }
                summary.loops += 1;
                frame = 0;
                origin = Instant::now();
                origin_frame = 0;
                debug!("Looping {:?}", self.sequence);
            }

            self.prefetch_ahead(&header, frame);

            let due = origin + Duration::from_millis((frame - origin_frame) as u64 * step_ms);
            tokio::select! {
                _ = &mut *shutdown => {
                    info!("Playback stopped");
                    break;
                }
                _ = tokio::time::sleep_until(due) => {}
            }

            match self
                .cache
                .get_frame(&self.sequence, FrameSelector::Frame(frame), self.now_ms())
                .await
            {
                Ok(data) => {
                    let job = self.build_job(&layout, data, &zeros);
                    let sent = self.dispatcher.send_full(&job, tokio::time::sleep).await;
                    summary.frames_sent += 1;
                    summary.packets += sent.packets as u64;
                }
                Err(e) => {
                    warn!("Frame {} unavailable: {}", frame, e);
                    summary.frame_errors += 1;
                }
            }

            // Catch up with the clock rather than falling further behind
            let elapsed_frames = (origin.elapsed().as_millis() as u64 / step_ms) as u32;
            let next = frame + 1;
            let on_time = origin_frame.saturating_add(elapsed_frames).min(header.frame_count);
            if on_time > next {
                summary.frames_skipped += (on_time - next) as u64;
                frame = on_time;
            } else {
                frame = next;
            }

            if !stats_every.is_zero() && last_stats.elapsed() >= stats_every {
                self.log_stats(&summary);
                last_stats = Instant::now();
            }
        }

        self.log_stats(&summary);
        Ok(summary)
    }
}
