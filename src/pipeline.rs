//! Decode/merge pipeline and the display clock.
//!
//! One decoder thread advances every tile by one frame, composites the
//! tile planes into a single picture and feeds a bounded queue. The
//! display side consumes the queue against a deadline, accumulating
//! stalling time whenever frames arrive late.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::decoder::{DecoderFactory, TileDecoder};
use crate::error::PlayerResult;
use crate::frame::{merge_tiles, merge_tiles_demo, CompositeFrame, FrameQueue};
use crate::tile_stream::TileStreamBuffer;

/// Consecutive failed frame slots tolerated before decode errors are
/// promoted to end-of-stream.
const MAX_DECODE_ERRORS: u32 = 30;

/// Pipeline lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Draining,
    Finished,
}

/// Result of one [`DecodePipeline::present`] call.
#[derive(Debug)]
pub struct DisplayFrameInfo {
    /// PTS of the displayed frame, -1.0 when nothing new was due.
    pub pts_ms: f64,
    /// Frames skipped to catch up with the deadline.
    pub frames_dropped: usize,
    /// Playback has delivered its last frame.
    pub finished: bool,
    /// The frame to display, when a new one was due.
    pub frame: Option<CompositeFrame>,
}

impl DisplayFrameInfo {
    fn idle(finished: bool) -> Self {
        Self {
            pts_ms: -1.0,
            frames_dropped: 0,
            finished,
            frame: None,
        }
    }
}

#[derive(Debug)]
struct DisplayClock {
    current_pts_ms: f64,
    stalling_ms: f64,
}

/// Owns the decoder thread and the composite frame queue.
pub struct DecodePipeline {
    streams: Vec<TileStreamBuffer>,
    queue: Arc<FrameQueue>,
    frame_duration_ms: f64,
    demo: bool,
    started: AtomicBool,
    /// Frames consumed by the display side; the scheduler throttles on it.
    displayed: Arc<AtomicU64>,
    clock: Mutex<DisplayClock>,
    decoder_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DecodePipeline {
    pub fn new(
        streams: Vec<TileStreamBuffer>,
        frame_rate: f64,
        queue_capacity: usize,
        demo: bool,
    ) -> Self {
        assert!(frame_rate > 0.0);
        Self {
            streams,
            queue: Arc::new(FrameQueue::new(queue_capacity)),
            frame_duration_ms: 1000.0 / frame_rate,
            demo,
            started: AtomicBool::new(false),
            displayed: Arc::new(AtomicU64::new(0)),
            clock: Mutex::new(DisplayClock {
                current_pts_ms: 0.0,
                stalling_ms: 0.0,
            }),
            decoder_handle: Mutex::new(None),
        }
    }

    /// Open one decoder per tile and spawn the decoder thread. Call once
    /// the tile buffers hold their first segment.
    pub fn start(&self, factory: &dyn DecoderFactory) -> PlayerResult<()> {
        let mut decoders = Vec::with_capacity(self.streams.len());
        for stream in &self.streams {
            decoders.push(factory.open(stream.clone())?);
        }

        let worker = DecodeWorker {
            decoders,
            streams: self.streams.clone(),
            queue: Arc::clone(&self.queue),
            frame_duration_ms: self.frame_duration_ms,
            demo: self.demo,
        };
        let handle = std::thread::Builder::new()
            .name("tilecast-decode".into())
            .spawn(move || worker.run())
            .expect("failed to spawn decoder thread");

        *self.decoder_handle.lock() = Some(handle);
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    pub fn state(&self) -> PipelineState {
        if !self.started.load(Ordering::Acquire) {
            PipelineState::Idle
        } else if self.queue.is_finished() {
            PipelineState::Finished
        } else if self.queue.is_complete() {
            PipelineState::Draining
        } else {
            PipelineState::Running
        }
    }

    /// Advance the display clock to `deadline_ms` and return the frame
    /// due at that instant. Never blocks.
    pub fn present(&self, deadline_ms: f64) -> DisplayFrameInfo {
        if !self.started.load(Ordering::Acquire) {
            return DisplayFrameInfo::idle(false);
        }
        if self.queue.is_finished() {
            return DisplayFrameInfo::idle(true);
        }

        let mut clock = self.clock.lock();
        let deadline = deadline_ms - clock.stalling_ms;

        // late frame: push the playback clock forward by the gap
        let expected_next = clock.current_pts_ms + self.frame_duration_ms;
        if self.queue.is_empty() && deadline >= expected_next {
            clock.stalling_ms += deadline - expected_next;
            debug!(stalling_ms = clock.stalling_ms, "display stalled");
        }

        let mut kept: Option<CompositeFrame> = None;
        let mut used = 0usize;
        while let Some(pts) = self.queue.front_pts() {
            if pts > deadline {
                break;
            }
            let Some(frame) = self.queue.pop() else {
                break; // the queue was stopped between peek and pop
            };
            clock.current_pts_ms = frame.pts_ms;
            kept = Some(frame);
            used += 1;
        }
        if used > 0 {
            self.displayed.fetch_add(used as u64, Ordering::Release);
        }

        match kept {
            Some(frame) => DisplayFrameInfo {
                pts_ms: frame.pts_ms,
                frames_dropped: used - 1,
                finished: false,
                frame: Some(frame),
            },
            None => DisplayFrameInfo::idle(false),
        }
    }

    /// Display-side progress marker.
    pub fn displayed_frames(&self) -> u64 {
        self.displayed.load(Ordering::Acquire)
    }

    /// Accumulated stalling time in milliseconds.
    pub fn stalling_ms(&self) -> f64 {
        self.clock.lock().stalling_ms
    }

    pub fn frame_duration_ms(&self) -> f64 {
        self.frame_duration_ms
    }

    /// Unblock and join the decoder thread.
    pub fn shutdown(&self) {
        for stream in &self.streams {
            stream.mark_done();
        }
        self.queue.stop();
        self.join();
    }

    /// Join the decoder thread if it is running.
    pub fn join(&self) {
        if let Some(handle) = self.decoder_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DecodePipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct DecodeWorker {
    decoders: Vec<Box<dyn TileDecoder>>,
    streams: Vec<TileStreamBuffer>,
    queue: Arc<FrameQueue>,
    frame_duration_ms: f64,
    demo: bool,
}

impl DecodeWorker {
    fn run(mut self) {
        let mut frame_index: u64 = 0;
        let mut error_streak: u32 = 0;

        'frames: loop {
            let mut tiles = Vec::with_capacity(self.decoders.len());
            let mut slot_failed = false;

            for (tile, decoder) in self.decoders.iter_mut().enumerate() {
                match decoder.next_frame() {
                    Ok(Some(frame)) => {
                        let srd = self.streams[tile].srd();
                        if frame.width != srd.w || frame.height != srd.h
                            || !frame.planes_consistent()
                        {
                            warn!(tile, "decoded frame does not match the tile SRD");
                            slot_failed = true;
                        } else {
                            tiles.push(frame);
                        }
                    }
                    Ok(None) => {
                        debug!(tile, frame_index, "tile stream ended");
                        break 'frames;
                    }
                    Err(error) => {
                        warn!(tile, %error, "tile decode failed");
                        slot_failed = true;
                    }
                }
            }

            if slot_failed {
                error_streak += 1;
                if error_streak >= MAX_DECODE_ERRORS {
                    warn!(error_streak, "persistent decode errors, ending stream");
                    break 'frames;
                }
                continue 'frames; // skip the slot; the display will stall
            }
            error_streak = 0;

            let pts_ms = frame_index as f64 * self.frame_duration_ms;
            let composite = if self.demo {
                let shades: Vec<_> = self
                    .streams
                    .iter()
                    .map(|s| (s.srd(), s.quality_at(pts_ms / 1000.0)))
                    .collect();
                merge_tiles_demo(pts_ms, &shades)
            } else {
                let placed: Vec<_> = tiles
                    .into_iter()
                    .zip(self.streams.iter().map(|s| s.srd()))
                    .collect();
                merge_tiles(pts_ms, &placed)
            };
            frame_index += 1;

            if !self.queue.push(composite) {
                info!("decoder thread stopped");
                return;
            }
        }

        self.queue.set_complete();
        debug!(frame_index, "decoder drained");
    }
}
