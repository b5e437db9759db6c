//! Playback session assembly.
//!
//! Wires the manifest, tile buffers, adaptation unit, scheduler and
//! decode pipeline together behind one handle. All collaborators (HTTP
//! transport, media decoder, head tracker, renderer) arrive through
//! their seams; there is no hidden global state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use glam::DQuat;
use parking_lot::Mutex;
use tracing::info;

use crate::config::PlayerConfig;
use crate::decoder::DecoderFactory;
use crate::error::PlayerResult;
use crate::fetch::SegmentFetcher;
use crate::mpd::Mpd;
use crate::pipeline::{DecodePipeline, DisplayFrameInfo, PipelineState};
use crate::scheduler::SegmentScheduler;
use crate::tile_stream::TileStreamBuffer;
use crate::tracker::{RotationRing, RotationSample};

/// One playback session over a parsed manifest.
pub struct Player {
    mpd: Arc<Mpd>,
    config: PlayerConfig,
    fetcher: Arc<dyn SegmentFetcher>,
    decoder_factory: Arc<dyn DecoderFactory>,
    ring: Arc<RotationRing>,
    streams: Vec<TileStreamBuffer>,
    pipeline: Arc<DecodePipeline>,
    stop: Arc<AtomicBool>,
    scheduler_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Player {
    /// Parse the manifest and set up the session. Playback starts with
    /// [`Self::start`].
    pub fn new(
        config: PlayerConfig,
        mpd_xml: &str,
        fetcher: Arc<dyn SegmentFetcher>,
        decoder_factory: Arc<dyn DecoderFactory>,
    ) -> PlayerResult<Self> {
        let mpd = Arc::new(Mpd::parse(mpd_xml)?);

        let streams: Vec<_> = (0..mpd.tile_count())
            .map(|tile| TileStreamBuffer::new(mpd.srd(tile)))
            .collect();
        let pipeline = Arc::new(DecodePipeline::new(
            streams.clone(),
            mpd.frame_rate(),
            config.frame_queue_capacity,
            config.demo,
        ));

        Ok(Self {
            mpd,
            config,
            fetcher,
            decoder_factory,
            ring: Arc::new(RotationRing::new()),
            streams,
            pipeline,
            stop: Arc::new(AtomicBool::new(false)),
            scheduler_handle: Mutex::new(None),
        })
    }

    pub fn mpd(&self) -> &Mpd {
        &self.mpd
    }

    /// Feed one tracker sample into the rotation ring.
    pub fn push_rotation(&self, timestamp_ms: i64, rotation: DQuat) {
        self.ring.push(RotationSample {
            timestamp_ms,
            rotation,
        });
    }

    /// Spawn the scheduler; it brings up the decode pipeline once the
    /// first segment is buffered. Idempotent.
    pub fn start(&self) {
        let mut handle = self.scheduler_handle.lock();
        if handle.is_some() {
            return;
        }
        *handle = Some(SegmentScheduler::spawn(
            Arc::clone(&self.mpd),
            self.config.clone(),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.decoder_factory),
            Arc::clone(&self.ring),
            self.streams.clone(),
            Arc::clone(&self.pipeline),
            Arc::clone(&self.stop),
        ));
    }

    /// Renderer-side tick; never blocks.
    pub fn present(&self, deadline_ms: f64) -> DisplayFrameInfo {
        self.pipeline.present(deadline_ms)
    }

    pub fn state(&self) -> PipelineState {
        self.pipeline.state()
    }

    pub fn stalling_ms(&self) -> f64 {
        self.pipeline.stalling_ms()
    }

    /// Stop both actors and join them. Safe to call more than once.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        for stream in &self.streams {
            stream.mark_done();
        }
        self.pipeline.shutdown();
        if let Some(handle) = self.scheduler_handle.lock().take() {
            let _ = handle.join();
        }
        info!("player shut down");
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.shutdown();
    }
}
