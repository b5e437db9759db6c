//! Head-rotation input: bounded sample ring and trace replay.
//!
//! The tracker collaborator pushes timestamped unit quaternions into a
//! fixed-capacity ring; the adaptation unit reads snapshots of it. A
//! recorded trace file can stand in for a live tracker.

use std::path::Path;

use circular_buffer::CircularBuffer;
use glam::DQuat;
use parking_lot::Mutex;

use crate::error::{PlayerError, PlayerResult};

/// Ring capacity: a few seconds of samples at tracker rate.
pub const ROTATION_RING_CAPACITY: usize = 256;

/// One tracker sample.
#[derive(Debug, Clone, Copy)]
pub struct RotationSample {
    /// Milliseconds since playback start.
    pub timestamp_ms: i64,
    pub rotation: DQuat,
}

/// Fixed-capacity rotation history, newest sample at index 0.
///
/// Written by the tracker thread, snapshotted by the scheduler. No
/// allocation happens after the ring warms up.
#[derive(Debug, Default)]
pub struct RotationRing {
    samples: Mutex<CircularBuffer<ROTATION_RING_CAPACITY, RotationSample>>,
}

impl RotationRing {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(CircularBuffer::new()),
        }
    }

    pub fn push(&self, sample: RotationSample) {
        self.samples.lock().push_front(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.lock().is_full()
    }

    /// The most recent sample.
    pub fn latest(&self) -> Option<RotationSample> {
        self.samples.lock().front().copied()
    }

    /// Copy of the ring contents, newest first.
    pub fn snapshot(&self) -> Vec<RotationSample> {
        self.samples.lock().iter().copied().collect()
    }
}

/// A recorded head trace, replayable by timestamp.
#[derive(Debug, Clone)]
pub struct HeadTrace {
    /// `(timestamp_s, rotation)` sorted by timestamp.
    samples: Vec<(f64, DQuat)>,
}

impl HeadTrace {
    /// Parse a trace. One sample per line: `t _ w x y z`; the field at
    /// index 1 is discarded (trace-format quirk).
    pub fn parse(text: &str) -> PlayerResult<Self> {
        let mut samples = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<f64> = line
                .split_whitespace()
                .map(|f| f.parse::<f64>())
                .collect::<Result<_, _>>()
                .map_err(|e| {
                    PlayerError::Trace(format!("line {}: {e}", lineno + 1))
                })?;
            if fields.len() < 6 {
                return Err(PlayerError::Trace(format!(
                    "line {}: {} fields, expected 6",
                    lineno + 1,
                    fields.len()
                )));
            }
            let (t, w, x, y, z) = (fields[0], fields[2], fields[3], fields[4], fields[5]);
            samples.push((t, DQuat::from_xyzw(x, y, z, w)));
        }
        if samples.is_empty() {
            return Err(PlayerError::Trace("empty trace".into()));
        }
        samples.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(Self { samples })
    }

    pub fn load(path: &Path) -> PlayerResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// The first sample at or after `timestamp_s` (the last one once the
    /// trace is exhausted).
    pub fn rotation_for(&self, timestamp_s: f64) -> DQuat {
        let idx = self
            .samples
            .partition_point(|(t, _)| *t < timestamp_s)
            .min(self.samples.len() - 1);
        self.samples[idx].1
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
