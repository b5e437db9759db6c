//! Viewport visibility scoring and head-motion prediction.
//!
//! A fixed grid of viewport sample points is cast through the head
//! rotation onto the equirectangular frame; the number of samples landing
//! in each tile is that tile's visibility score. With enough rotation
//! history, three independent linear regressions on the Euler components
//! extrapolate the head pose to two horizons inside the upcoming segment.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use glam::{DQuat, DVec3, EulerRot};

use crate::mpd::Mpd;
use crate::tracker::RotationSample;

/// Sample-grid resolution; the grid has `(SAMPLE_RES + 1)^2` points.
pub const SAMPLE_RES: usize = 8;
pub const SAMPLE_POINTS: usize = (SAMPLE_RES + 1) * (SAMPLE_RES + 1);

/// Monocular field of view, degrees, both axes.
const MONOCULAR_FOV_DEG: f64 = 92.0;

/// Safety factor widening the scored viewport in the live client.
pub const LIVE_SAFETY_FACTOR: f64 = 1.5;
/// Wider factor used when scoring offline popularity corpora.
pub const OFFLINE_SAFETY_FACTOR: f64 = 2.0;

/// Two-level lower-bound map from normalised equirect coordinates to the
/// tile index, keyed by each tile's right/bottom normalised edge.
#[derive(Debug, Clone)]
struct NormalizedTileMap {
    /// `(right_edge, column)` sorted by edge; each column holds
    /// `(bottom_edge, tile)` sorted by edge.
    columns: Vec<(f64, Vec<(f64, usize)>)>,
}

impl NormalizedTileMap {
    fn new(mpd: &Mpd) -> Self {
        let (frame_w, frame_h) = mpd.composite_size();
        let mut columns: Vec<(f64, Vec<(f64, usize)>)> = Vec::new();

        for (tile, set) in mpd.adaptation_sets.iter().enumerate() {
            let srd = set.srd;
            let right = (srd.x + srd.w) as f64 / frame_w as f64;
            let bottom = (srd.y + srd.h) as f64 / frame_h as f64;
            match columns.iter_mut().find(|(edge, _)| *edge == right) {
                Some((_, column)) => column.push((bottom, tile)),
                None => columns.push((right, vec![(bottom, tile)])),
            }
        }

        columns.sort_by(|a, b| a.0.total_cmp(&b.0));
        for (_, column) in &mut columns {
            column.sort_by(|a, b| a.0.total_cmp(&b.0));
        }
        Self { columns }
    }

    /// Lower-bound lookup on both levels; coordinates at or beyond the
    /// last edge clamp to it.
    fn tile_at(&self, u: f64, v: f64) -> usize {
        let ci = self
            .columns
            .partition_point(|(edge, _)| *edge < u)
            .min(self.columns.len() - 1);
        let column = &self.columns[ci].1;
        let ri = column
            .partition_point(|(edge, _)| *edge < v)
            .min(column.len() - 1);
        column[ri].1
    }
}

/// Casts the viewport sample grid through a head rotation and scores
/// tiles. Built once per session; read-only afterwards.
#[derive(Debug, Clone)]
pub struct ViewportSampler {
    samples: Vec<(f64, f64)>,
    tile_map: NormalizedTileMap,
    max_u: f64,
    max_v: f64,
}

impl ViewportSampler {
    pub fn new(mpd: &Mpd, safety_factor: f64) -> Self {
        let half_fov = MONOCULAR_FOV_DEG.to_radians() / 2.0;
        let max_u = safety_factor * half_fov.tan();
        let max_v = safety_factor * half_fov.tan();

        let mut samples = Vec::with_capacity(SAMPLE_POINTS);
        let half = (SAMPLE_RES / 2) as i32;
        for x in -half..=half {
            for y in -half..=half {
                samples.push((
                    0.5 + x as f64 / SAMPLE_RES as f64,
                    0.5 + y as f64 / SAMPLE_RES as f64,
                ));
            }
        }

        Self {
            samples,
            tile_map: NormalizedTileMap::new(mpd),
            max_u,
            max_v,
        }
    }

    /// Map one viewport sample through a head rotation to normalised
    /// equirectangular coordinates in `[0, 1]^2`.
    pub fn equirect_coord(&self, rotation: DQuat, sample: (f64, f64)) -> (f64, f64) {
        let u = (sample.0 - 0.5) * (2.0 * self.max_u);
        let v = (0.5 - sample.1) * (2.0 * self.max_v);

        let ray = DVec3::new(1.0, u, v).normalize();
        let rotated = rotation * ray;

        let theta = rotated.y.atan2(rotated.x);
        let phi = rotated.z.clamp(-1.0, 1.0).acos();

        let x = 1.0 - (0.75 + theta / (2.0 * PI)).rem_euclid(1.0);
        let y = phi / PI;
        (x, y)
    }

    /// The tile a normalised equirect coordinate falls in.
    pub fn tile_at(&self, coord: (f64, f64)) -> usize {
        self.tile_map.tile_at(coord.0, coord.1)
    }

    /// Add this rotation's per-tile sample counts into `counts`.
    pub fn accumulate_visibility(&self, rotation: DQuat, counts: &mut BTreeMap<usize, u32>) {
        for &sample in &self.samples {
            let tile = self.tile_at(self.equirect_coord(rotation, sample));
            *counts.entry(tile).or_insert(0) += 1;
        }
    }

    /// Per-tile sample counts for a single rotation.
    pub fn visibility(&self, rotation: DQuat) -> BTreeMap<usize, u32> {
        let mut counts = BTreeMap::new();
        self.accumulate_visibility(rotation, &mut counts);
        counts
    }
}

/// Ordinary least-squares line fit.
#[derive(Debug, Clone, Copy)]
struct LinearFit {
    slope: f64,
    intercept: f64,
}

impl LinearFit {
    fn at(&self, x: f64) -> f64 {
        x * self.slope + self.intercept
    }
}

fn linear_fit(x: &[f64], y: &[f64]) -> LinearFit {
    let n = x.len() as f64;
    let s_x: f64 = x.iter().sum();
    let s_y: f64 = y.iter().sum();
    let s_xx: f64 = x.iter().map(|v| v * v).sum();
    let s_xy: f64 = x.iter().zip(y).map(|(a, b)| a * b).sum();

    let denom = n * s_xx - s_x * s_x;
    if denom == 0.0 {
        // all samples share one timestamp; the fit degenerates to the mean
        return LinearFit {
            slope: 0.0,
            intercept: s_y / n,
        };
    }
    let slope = (n * s_xy - s_x * s_y) / denom;
    LinearFit {
        slope,
        intercept: (s_y - slope * s_x) / n,
    }
}

/// Predict per-tile visibility for the upcoming segment.
///
/// `rotations` is newest-first. With a single sample or prediction
/// disabled, the newest rotation is scored once. Otherwise the Euler
/// components are regressed against time and the reconstructed poses at
/// `t0 + 0.5 * segment` and `t0 + segment` are scored and aggregated.
///
/// Returns `(score, tile)` pairs for every tile that received samples.
pub fn predict_visibility(
    sampler: &ViewportSampler,
    rotations: &[RotationSample],
    segment_duration_ms: f64,
    prediction: bool,
) -> Vec<(u32, usize)> {
    let mut counts = BTreeMap::new();

    if rotations.len() == 1 || !prediction {
        sampler.accumulate_visibility(rotations[0].rotation, &mut counts);
    } else {
        let mut time = Vec::with_capacity(rotations.len());
        let mut roll = Vec::with_capacity(rotations.len());
        let mut pitch = Vec::with_capacity(rotations.len());
        let mut yaw = Vec::with_capacity(rotations.len());
        for sample in rotations {
            let (z, y, x) = sample.rotation.to_euler(EulerRot::ZYX);
            time.push(sample.timestamp_ms as f64);
            yaw.push(z);
            pitch.push(y);
            roll.push(x);
        }

        let fit_roll = linear_fit(&time, &roll);
        let fit_pitch = linear_fit(&time, &pitch);
        let fit_yaw = linear_fit(&time, &yaw);

        let t0 = rotations[0].timestamp_ms as f64;
        for ts in [t0 + 0.5 * segment_duration_ms, t0 + segment_duration_ms] {
            let rotation = DQuat::from_euler(
                EulerRot::ZYX,
                fit_yaw.at(ts),
                fit_pitch.at(ts),
                fit_roll.at(ts),
            );
            sampler.accumulate_visibility(rotation, &mut counts);
        }
    }

    counts.into_iter().map(|(tile, score)| (score, tile)).collect()
}
