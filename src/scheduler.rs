//! Segment download scheduler.
//!
//! One long-running thread: plans each segment with the adaptation unit,
//! fetches tiles in viewport-priority order, and appends the payloads to
//! the per-tile stream buffers. Throttled by the display side's progress
//! so the buffers stay roughly one segment ahead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::adaptation::AdaptationUnit;
use crate::config::PlayerConfig;
use crate::decoder::DecoderFactory;
use crate::fetch::{fetch_with_retry, SegmentFetcher};
use crate::mpd::Mpd;
use crate::pipeline::DecodePipeline;
use crate::tile_stream::TileStreamBuffer;
use crate::tracker::RotationRing;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Spawns and identifies the scheduler thread.
pub struct SegmentScheduler;

impl SegmentScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        mpd: Arc<Mpd>,
        config: PlayerConfig,
        fetcher: Arc<dyn SegmentFetcher>,
        decoder_factory: Arc<dyn DecoderFactory>,
        ring: Arc<RotationRing>,
        streams: Vec<TileStreamBuffer>,
        pipeline: Arc<DecodePipeline>,
        stop: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("tilecast-scheduler".into())
            .spawn(move || {
                run(
                    mpd,
                    config,
                    fetcher,
                    decoder_factory,
                    ring,
                    streams,
                    pipeline,
                    stop,
                );
            })
            .expect("failed to spawn scheduler thread")
    }
}

/// Sleep-poll until `ready` holds or the stop flag is raised. Returns
/// false on stop.
fn wait_until(stop: &AtomicBool, mut ready: impl FnMut() -> bool) -> bool {
    while !ready() {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    true
}

#[allow(clippy::too_many_arguments)]
fn run(
    mpd: Arc<Mpd>,
    config: PlayerConfig,
    fetcher: Arc<dyn SegmentFetcher>,
    decoder_factory: Arc<dyn DecoderFactory>,
    ring: Arc<RotationRing>,
    streams: Vec<TileStreamBuffer>,
    pipeline: Arc<DecodePipeline>,
    stop: Arc<AtomicBool>,
) {
    let mut adaptation = AdaptationUnit::new(Arc::clone(&mpd), &config);

    // a first head pose is needed before anything can be planned
    if !wait_until(&stop, || !ring.is_empty()) {
        return;
    }
    let Some(latest) = ring.latest() else { return };
    adaptation.init(latest);

    // segment 0: initialization segment + first media segment per tile
    for tile in 0..mpd.tile_count() {
        if stop.load(Ordering::Acquire) {
            return;
        }
        let init_bytes = match fetch_with_retry(fetcher.as_ref(), &mpd.init_url(tile)) {
            Ok(response) => response.bytes,
            Err(error) => {
                warn!(tile, %error, "init segment failed, ending tile stream");
                streams[tile].mark_done();
                continue;
            }
        };
        match adaptation.download(fetcher.as_ref(), tile, 0) {
            Ok(first_segment) => {
                streams[tile].record_quality(0.0, adaptation.current_quality(tile));
                streams[tile].init(&init_bytes, &first_segment);
            }
            Err(error) => {
                warn!(tile, %error, "first segment failed, ending tile stream");
                streams[tile].mark_done();
            }
        }
    }
    adaptation.stop();

    // the buffers hold data now; bring up the decode side
    if let Err(error) = pipeline.start(decoder_factory.as_ref()) {
        warn!(%error, "decode pipeline failed to start");
        return;
    }
    info!("first segment buffered, playback starting");

    // prime the prediction model with a full rotation history
    if !wait_until(&stop, || ring.is_full()) {
        return;
    }

    let segment_count = mpd.segment_count();
    let segment_duration_s = mpd.segment_duration_s();
    let segment_frames = segment_duration_s * mpd.frame_rate();

    for segment in 1..segment_count {
        // stay one segment ahead of the display, no further
        let threshold = ((segment - 1) as f64 * segment_frames) as u64;
        if !wait_until(&stop, || pipeline.displayed_frames() >= threshold) {
            return;
        }

        let rotations = ring.snapshot();
        let plan = adaptation.plan_segment(&rotations, segment);
        debug!(segment, transition = plan.transition, "segment planned");

        let start_time_s = segment as f64 * segment_duration_s;
        let is_last = segment == segment_count - 1;

        for &tile in &plan.download_order {
            if stop.load(Ordering::Acquire) {
                return;
            }
            match adaptation.download(fetcher.as_ref(), tile, segment) {
                Ok(bytes) => {
                    streams[tile].record_quality(start_time_s, adaptation.current_quality(tile));
                    streams[tile].append(&bytes, is_last);
                }
                Err(error) => {
                    warn!(tile, segment, %error, "segment failed, ending tile stream");
                    streams[tile].mark_done();
                }
            }
        }
        adaptation.stop();
    }

    info!("all segments scheduled");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{mpd_xml, MpdFixture, ScriptedDecoderFactory, ScriptedFetcher};
    use crate::tracker::{RotationSample, ROTATION_RING_CAPACITY};
    use glam::DQuat;
    use std::time::Instant;

    fn small_fixture() -> MpdFixture {
        MpdFixture {
            th: 2,
            tv: 2,
            tile_w: 4,
            tile_h: 2,
            segments: 3,
            frame_rate: "10".into(),
            ..Default::default()
        }
    }

    fn fill_ring(ring: &RotationRing) {
        for i in 0..ROTATION_RING_CAPACITY {
            ring.push(RotationSample {
                timestamp_ms: i as i64 * 10,
                rotation: DQuat::IDENTITY,
            });
        }
    }

    struct Harness {
        mpd: Arc<Mpd>,
        fetcher: Arc<ScriptedFetcher>,
        ring: Arc<RotationRing>,
        streams: Vec<TileStreamBuffer>,
        pipeline: Arc<DecodePipeline>,
        stop: Arc<AtomicBool>,
    }

    fn harness(fixture: &MpdFixture) -> Harness {
        let mpd = Arc::new(Mpd::parse(&mpd_xml(fixture)).unwrap());
        let fetcher = Arc::new(ScriptedFetcher::from_fixture(fixture));
        // 240 bytes = 15 decodable frames per segment, enough to keep the
        // display throttle moving one segment ahead of the decoder
        fetcher.set_default_payload_len(240);
        let streams: Vec<_> = (0..mpd.tile_count())
            .map(|t| TileStreamBuffer::new(mpd.srd(t)))
            .collect();
        let pipeline = Arc::new(DecodePipeline::new(
            streams.clone(),
            mpd.frame_rate(),
            10,
            false,
        ));
        Harness {
            mpd,
            fetcher,
            ring: Arc::new(RotationRing::new()),
            streams,
            pipeline,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    fn spawn_scheduler(h: &Harness) -> JoinHandle<()> {
        SegmentScheduler::spawn(
            Arc::clone(&h.mpd),
            PlayerConfig {
                popularity: false,
                ..Default::default()
            },
            h.fetcher.clone(),
            Arc::new(ScriptedDecoderFactory::default()),
            Arc::clone(&h.ring),
            h.streams.clone(),
            Arc::clone(&h.pipeline),
            Arc::clone(&h.stop),
        )
    }

    /// Drive `present` until the scheduler thread exits.
    fn drive_until_done(h: &Harness, handle: JoinHandle<()>) {
        let frame_duration = h.pipeline.frame_duration_ms();
        let mut deadline = 0.0;
        let start = Instant::now();
        while !handle.is_finished() {
            assert!(
                start.elapsed() < Duration::from_secs(10),
                "scheduler did not finish"
            );
            h.pipeline.present(deadline);
            deadline += frame_duration;
            std::thread::sleep(Duration::from_millis(1));
        }
        handle.join().unwrap();
    }

    #[test]
    fn test_streams_every_segment_once() {
        let fixture = small_fixture();
        let h = harness(&fixture);
        fill_ring(&h.ring);

        let handle = spawn_scheduler(&h);
        drive_until_done(&h, handle);

        // exactly one init fetch and one media fetch per (tile, segment),
        // whatever quality the adaptation unit picked
        for tile in 0..h.mpd.tile_count() {
            assert_eq!(h.fetcher.request_count(&h.mpd.init_url(tile)), 1);
            for segment in 0..h.mpd.segment_count() {
                let fetched: usize = (0..h.mpd.representation_count())
                    .map(|q| h.fetcher.request_count(&h.mpd.media_url(segment, tile, q)))
                    .sum();
                assert_eq!(fetched, 1, "tile {tile} segment {segment}");
            }
            assert!(h.streams[tile].total_size() > 0);
        }
    }

    #[test]
    fn test_quality_recorded_per_segment() {
        let fixture = small_fixture();
        let h = harness(&fixture);
        fill_ring(&h.ring);

        let handle = spawn_scheduler(&h);
        drive_until_done(&h, handle);

        let segment_duration = h.mpd.segment_duration_s();
        for stream in &h.streams {
            for segment in 0..h.mpd.segment_count() {
                // every segment has a quality label inside the ladder
                let quality = stream.quality_at(segment as f64 * segment_duration);
                assert!(quality < h.mpd.representation_count());
            }
        }
    }

    #[test]
    fn test_fetch_failure_cascades_to_tile_eof() {
        let fixture = small_fixture();
        let h = harness(&fixture);
        fill_ring(&h.ring);

        // every quality variant of tile 1 / segment 1 fails twice, so the
        // retry is exhausted no matter which quality the plan picked
        for q in 0..h.mpd.representation_count() {
            h.fetcher.fail_next(&h.mpd.media_url(1, 1, q), 2);
        }

        let handle = spawn_scheduler(&h);
        drive_until_done(&h, handle);

        // the wounded tile carries only its first segment; others got all
        let lone = h.streams[1].total_size();
        assert!(lone > 0);
        assert!(h.streams[0].total_size() > lone);
    }

    #[test]
    fn test_waits_for_first_rotation_and_honours_stop() {
        let fixture = small_fixture();
        let h = harness(&fixture);
        // ring left empty: the scheduler must idle at the gate

        let handle = spawn_scheduler(&h);
        std::thread::sleep(Duration::from_millis(80));
        assert!(!handle.is_finished(), "scheduler ran without a head pose");
        assert_eq!(h.fetcher.total_requests(), 0);

        h.stop.store(true, Ordering::Release);
        handle.join().unwrap();
    }
}
