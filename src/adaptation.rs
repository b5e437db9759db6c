//! Per-segment quality selection under a bandwidth budget.
//!
//! Once per segment boundary the adaptation unit measures recent link
//! throughput, scores tile visibility from the head-rotation history,
//! greedily upgrades the most visible tiles while the plan stays inside
//! 75% of the estimate, and falls back to the offline popularity plan
//! when the viewport plan cannot be afforded.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::config::PlayerConfig;
use crate::error::PlayerResult;
use crate::fetch::{fetch_with_retry, SegmentFetcher};
use crate::mpd::{Mpd, QualityPlan};
use crate::tracker::RotationSample;
use crate::viewport::{predict_visibility, ViewportSampler, LIVE_SAFETY_FACTOR};

/// Fraction of the throughput estimate a plan may consume, and of the
/// segment duration the fetch loop may spend before the quality override
/// kicks in.
const BUDGET_FRACTION: f64 = 0.75;

/// The decision for one segment.
#[derive(Debug, Clone)]
pub struct SegmentPlan {
    /// Tile -> quality index, every tile present.
    pub qualities: QualityPlan,
    /// Fetch order: a permutation of tile indices, highest priority first.
    pub download_order: Vec<usize>,
    /// True when the popularity plan replaced the viewport plan.
    pub transition: bool,
}

/// Viewport- and bandwidth-driven quality selection for one session.
///
/// Owned by the scheduler thread; the throughput counters are only ever
/// touched from there.
pub struct AdaptationUnit {
    mpd: Arc<Mpd>,
    config: PlayerConfig,
    sampler: ViewportSampler,
    qualities: QualityPlan,
    current_segment: usize,
    /// Link throughput estimate in bytes per second.
    bandwidth_estimate: u64,
    bytes_downloaded: u64,
    duration_download_ms: u64,
    download_start: Option<Instant>,
}

impl AdaptationUnit {
    pub fn new(mpd: Arc<Mpd>, config: &PlayerConfig) -> Self {
        let sampler = ViewportSampler::new(&mpd, LIVE_SAFETY_FACTOR);
        let lowest = mpd.representation_count() - 1;
        let qualities = QualityPlan::uniform(mpd.tile_count(), lowest);
        let bandwidth_estimate = config.bandwidth_seed_bytes_per_s;
        Self {
            mpd,
            config: config.clone(),
            sampler,
            qualities,
            current_segment: 0,
            bandwidth_estimate,
            bytes_downloaded: 0,
            duration_download_ms: 0,
            download_start: None,
        }
    }

    /// Plan segment 0 from the first rotation sample.
    pub fn init(&mut self, rotation: RotationSample) -> SegmentPlan {
        self.plan(&[rotation], 0, true)
    }

    /// Plan a subsequent segment from the rotation history (newest first).
    pub fn plan_segment(&mut self, rotations: &[RotationSample], segment: usize) -> SegmentPlan {
        self.plan(rotations, segment, false)
    }

    fn plan(&mut self, rotations: &[RotationSample], segment: usize, init: bool) -> SegmentPlan {
        if init {
            self.bandwidth_estimate = self.config.bandwidth_seed_bytes_per_s;
        } else if self.config.bandwidth_adaption
            && self.duration_download_ms > 0
            && self.bytes_downloaded > 0
        {
            self.bandwidth_estimate = self.bytes_downloaded * 1000 / self.duration_download_ms;
        }
        self.bytes_downloaded = 0;
        self.duration_download_ms = 0;

        debug!(
            segment,
            estimate = self.bandwidth_estimate,
            "start adaptation"
        );

        let tile_count = self.mpd.tile_count();
        let rep_count = self.mpd.representation_count();
        let lowest = rep_count - 1;
        let budget_cap = self.bandwidth_estimate as f64 * BUDGET_FRACTION;

        let mut plan = QualityPlan::uniform(tile_count, lowest);
        let mut order: Vec<usize> = Vec::new();
        let mut transition = false;

        if self.config.popularity && !self.config.viewport_prediction {
            transition = true;
        } else if !rotations.is_empty() && (self.plan_budget(&plan) as f64) < budget_cap {
            let segment_duration_ms = self.mpd.segment_duration_s() * 1000.0;
            let mut visibility = predict_visibility(
                &self.sampler,
                rotations,
                segment_duration_ms,
                self.config.viewport_prediction,
            );

            // highest visibility first, ties broken by tile index ascending;
            // tiles the viewport never touched follow in index order
            let mut ordered = visibility.clone();
            ordered.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
            order = ordered.into_iter().map(|(_, tile)| tile).collect();
            for tile in 0..tile_count {
                if !order.contains(&tile) {
                    order.push(tile);
                }
            }

            if let Some(mut top) = Self::top_tile(&visibility) {
                let v_max = visibility[top].0;
                // a step of at least one keeps the upgrade loop finite
                let step = (v_max / rep_count as u32).max(1);

                while visibility[top].0 > 0 {
                    let tile = visibility[top].1;
                    plan.set_quality(tile, plan.quality(tile).saturating_sub(1));

                    if self.plan_budget(&plan) as f64 > budget_cap {
                        if self.config.popularity && self.config.transitions {
                            transition = true;
                            info!(segment, "transition to popularity plan");
                        }
                        break;
                    }

                    visibility[top].0 = visibility[top].0.saturating_sub(step);
                    match Self::top_tile(&visibility) {
                        Some(next) => top = next,
                        None => break,
                    }
                }
            }
        }

        if transition {
            match self.mpd.popularity_plan(segment) {
                Some(popular) => {
                    plan = popular;
                    // best popular-quality tiles first
                    order.clear();
                    for quality in 0..rep_count {
                        for tile in 0..tile_count {
                            if plan.quality(tile) == quality {
                                order.push(tile);
                            }
                        }
                    }
                }
                None => {
                    warn!(segment, "popularity transition without a table entry");
                    transition = false;
                }
            }
        }
        if order.is_empty() {
            order = (0..tile_count).collect();
        }

        self.qualities = plan.clone();
        self.current_segment = segment;
        self.download_start = Some(Instant::now());

        SegmentPlan {
            qualities: plan,
            download_order: order,
            transition,
        }
    }

    /// First index of the highest score (ties resolve to the lowest tile,
    /// since the list is tile-ordered).
    fn top_tile(visibility: &[(u32, usize)]) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, (score, _)) in visibility.iter().enumerate() {
            match best {
                Some(b) if visibility[b].0 >= *score => {}
                _ => best = Some(i),
            }
        }
        best
    }

    /// Bytes per second the plan would consume: the sum of the selected
    /// representations' bitrates, divided by eight.
    pub fn plan_budget(&self, plan: &QualityPlan) -> u64 {
        let bits: u64 = (0..self.mpd.tile_count())
            .map(|tile| self.mpd.representation_bandwidth(tile, plan.quality(tile)))
            .sum();
        bits / 8
    }

    /// Fetch one tile of a segment, honouring the late-budget override:
    /// past 75% of the segment duration every remaining tile drops to the
    /// lowest quality regardless of the plan.
    pub fn download(
        &mut self,
        fetcher: &dyn SegmentFetcher,
        tile: usize,
        segment: usize,
    ) -> PlayerResult<Bytes> {
        self.current_segment = segment;

        let lowest = self.mpd.representation_count() - 1;
        let mut quality = self.qualities.quality(tile);

        let deadline_ms = BUDGET_FRACTION * self.mpd.segment_duration_s() * 1000.0;
        if let Some(start) = self.download_start {
            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
            if elapsed_ms > deadline_ms {
                debug!(tile, segment, elapsed_ms, "late-budget quality override");
                quality = lowest;
            }
        }

        let url = self.mpd.media_url(segment, tile, quality);
        let response = fetch_with_retry(fetcher, &url)?;

        if !response.cache_hit {
            self.duration_download_ms += response.elapsed_ms;
            self.bytes_downloaded += response.bytes.len() as u64;
        }
        Ok(response.bytes)
    }

    /// Close the segment's fetch window.
    pub fn stop(&mut self) {
        debug!(
            segment = self.current_segment,
            bytes = self.bytes_downloaded,
            duration_ms = self.duration_download_ms,
            "fetch window closed"
        );
    }

    /// Quality the current plan assigns to a tile (pre-override).
    pub fn current_quality(&self, tile: usize) -> usize {
        self.qualities.quality(tile)
    }

    pub fn bandwidth_estimate(&self) -> u64 {
        self.bandwidth_estimate
    }
}
