//! Composite frames, the YUV merge, and the bounded frame queue.
//!
//! The merge is memory-bandwidth bound; plane copies are laid out so
//! every row copy is contiguous in the destination, and grid rows are
//! distributed over the rayon pool.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;

use crate::decoder::TileFrame;
use crate::mpd::Srd;

/// One composited equirectangular frame, YUV 4:2:0 planar.
#[derive(Debug, Clone)]
pub struct CompositeFrame {
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp, milliseconds since playback start.
    pub pts_ms: f64,
}

impl CompositeFrame {
    fn new(width: u32, height: u32, pts_ms: f64) -> Self {
        let luma = (width * height) as usize;
        Self {
            y: vec![0; luma],
            u: vec![0; luma / 4],
            v: vec![0; luma / 4],
            width,
            height,
            pts_ms,
        }
    }
}

/// One tile's contribution to a plane copy. `src` is tightly packed with
/// stride `w`.
struct Placement<'a> {
    x: usize,
    y: usize,
    w: usize,
    h: usize,
    src: &'a [u8],
}

/// Copy tile regions into a plane, one grid-row band per rayon task.
/// `band_h` is the tile height in this plane's resolution.
fn blit(plane: &mut [u8], stride: usize, band_h: usize, placements: &[Placement<'_>]) {
    plane
        .par_chunks_mut(stride * band_h)
        .enumerate()
        .for_each(|(band, rows)| {
            let band_top = band * band_h;
            for p in placements.iter().filter(|p| p.y == band_top) {
                for l in 0..p.h {
                    let dst = l * stride + p.x;
                    rows[dst..dst + p.w].copy_from_slice(&p.src[l * p.w..(l + 1) * p.w]);
                }
            }
        });
}

/// Fill tile regions of a plane with a constant, same banding as [`blit`].
fn fill(plane: &mut [u8], stride: usize, band_h: usize, regions: &[(usize, usize, usize, usize, u8)]) {
    plane
        .par_chunks_mut(stride * band_h)
        .enumerate()
        .for_each(|(band, rows)| {
            let band_top = band * band_h;
            for &(x, y, w, h, value) in regions.iter().filter(|r| r.1 == band_top) {
                for l in 0..h {
                    let dst = l * stride + x;
                    rows[dst..dst + w].fill(value);
                }
            }
        });
}

fn assert_tile_geometry(srd: &Srd) {
    // odd tile sizes or origins would shear the chroma planes
    assert!(
        srd.w % 2 == 0 && srd.h % 2 == 0 && srd.x % 2 == 0 && srd.y % 2 == 0,
        "tile geometry must be even: {srd:?}"
    );
}

/// Composite decoded tile frames into one picture.
pub fn merge_tiles(pts_ms: f64, tiles: &[(TileFrame, Srd)]) -> CompositeFrame {
    assert!(!tiles.is_empty());
    let srd0 = tiles[0].1;
    let width = srd0.w * srd0.th;
    let height = srd0.h * srd0.tv;
    let mut frame = CompositeFrame::new(width, height, pts_ms);

    let mut luma = Vec::with_capacity(tiles.len());
    let mut cb = Vec::with_capacity(tiles.len());
    let mut cr = Vec::with_capacity(tiles.len());
    for (tile, srd) in tiles {
        assert_tile_geometry(srd);
        assert!(
            tile.width == srd.w && tile.height == srd.h && tile.planes_consistent(),
            "decoded tile does not match its SRD: {srd:?}"
        );
        let (x, y, w, h) = (srd.x as usize, srd.y as usize, srd.w as usize, srd.h as usize);
        luma.push(Placement { x, y, w, h, src: &tile.y });
        cb.push(Placement { x: x / 2, y: y / 2, w: w / 2, h: h / 2, src: &tile.u });
        cr.push(Placement { x: x / 2, y: y / 2, w: w / 2, h: h / 2, src: &tile.v });
    }

    let stride = width as usize;
    let band_h = srd0.h as usize;
    blit(&mut frame.y, stride, band_h, &luma);
    blit(&mut frame.u, stride / 2, band_h / 2, &cb);
    blit(&mut frame.v, stride / 2, band_h / 2, &cr);
    frame
}

/// Demo-mode composite: paint each tile by the quality it was fetched
/// in (Y = 127, U = 0, V = quality * 255/3) instead of copying chroma.
pub fn merge_tiles_demo(pts_ms: f64, tiles: &[(Srd, usize)]) -> CompositeFrame {
    assert!(!tiles.is_empty());
    let srd0 = tiles[0].0;
    let width = srd0.w * srd0.th;
    let height = srd0.h * srd0.tv;
    let mut frame = CompositeFrame::new(width, height, pts_ms);

    let mut luma = Vec::with_capacity(tiles.len());
    let mut cb = Vec::with_capacity(tiles.len());
    let mut cr = Vec::with_capacity(tiles.len());
    for (srd, quality) in tiles {
        assert_tile_geometry(srd);
        let (x, y, w, h) = (srd.x as usize, srd.y as usize, srd.w as usize, srd.h as usize);
        let shade = (*quality as u32 * (255 / 3)).min(255) as u8;
        luma.push((x, y, w, h, 127u8));
        cb.push((x / 2, y / 2, w / 2, h / 2, 0u8));
        cr.push((x / 2, y / 2, w / 2, h / 2, shade));
    }

    let stride = width as usize;
    let band_h = srd0.h as usize;
    fill(&mut frame.y, stride, band_h, &luma);
    fill(&mut frame.u, stride / 2, band_h / 2, &cb);
    fill(&mut frame.v, stride / 2, band_h / 2, &cr);
    frame
}

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<CompositeFrame>,
    complete: bool,
    stopped: bool,
}

/// Bounded queue of composite frames between the decoder thread and the
/// display side. The producer blocks when full (backpressure); the
/// consumer never blocks.
#[derive(Debug)]
pub struct FrameQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    space: Condvar,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            capacity,
            state: Mutex::new(QueueState::default()),
            space: Condvar::new(),
        }
    }

    /// Blocking push. Returns false once the queue has been stopped.
    pub fn push(&self, frame: CompositeFrame) -> bool {
        let mut state = self.state.lock();
        while state.frames.len() >= self.capacity && !state.stopped {
            self.space.wait(&mut state);
        }
        if state.stopped {
            return false;
        }
        state.frames.push_back(frame);
        true
    }

    /// Presentation timestamp of the oldest queued frame.
    pub fn front_pts(&self) -> Option<f64> {
        self.state.lock().frames.front().map(|f| f.pts_ms)
    }

    pub fn pop(&self) -> Option<CompositeFrame> {
        let mut state = self.state.lock();
        let frame = state.frames.pop_front();
        if frame.is_some() {
            self.space.notify_one();
        }
        frame
    }

    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().frames.is_empty()
    }

    /// The producer saw EOF; no further frames will arrive.
    pub fn set_complete(&self) {
        self.state.lock().complete = true;
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().complete
    }

    /// Drained after completion: playback is over.
    pub fn is_finished(&self) -> bool {
        let state = self.state.lock();
        state.complete && state.frames.is_empty()
    }

    /// Drop queued frames and unblock the producer for shutdown.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        state.frames.clear();
        self.space.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }
}
