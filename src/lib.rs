//! tilecast - viewport-adaptive streaming core for tiled 360-degree video.
//!
//! This crate implements the decision and data path of a DASH-SRD tiled
//! streaming client:
//! - Manifest model with spatial relationship descriptors and an offline
//!   popularity table
//! - Viewport visibility scoring with linear head-motion prediction
//! - Per-segment quality planning under a bandwidth budget, with a
//!   popularity fallback and a late-fetch quality override
//! - Double-buffered per-tile byte streams feeding a blocking demuxer
//! - A decode/merge pipeline compositing tile planes into one
//!   equirectangular YUV picture, paced against a display deadline
//!
//! The HTTP transport, media codec, head tracker and renderer are
//! collaborators behind the [`SegmentFetcher`], [`DecoderFactory`] and
//! rotation-sample seams; [`Player`] ties everything together.

mod adaptation;
mod config;
mod decoder;
mod error;
mod fetch;
mod frame;
mod mpd;
mod pipeline;
mod player;
mod scheduler;
mod tile_stream;
mod tracker;
mod viewport;
#[cfg(test)]
pub(crate) mod test_utils;

pub use adaptation::{AdaptationUnit, SegmentPlan};
pub use config::PlayerConfig;
pub use decoder::{DecoderFactory, TileDecoder, TileFrame};
pub use error::{PlayerError, PlayerResult};
pub use fetch::{fetch_with_retry, FetchResponse, SegmentFetcher};
pub use frame::{merge_tiles, merge_tiles_demo, CompositeFrame, FrameQueue};
pub use mpd::{AdaptationSet, Mpd, PopularityTable, QualityPlan, Representation, SegmentList, Srd};
pub use pipeline::{DecodePipeline, DisplayFrameInfo, PipelineState};
pub use player::Player;
pub use scheduler::SegmentScheduler;
pub use tile_stream::{TileStreamBuffer, SEEK_CUR, SEEK_END, SEEK_SET, SEEK_TOTAL_SIZE};
pub use tracker::{HeadTrace, RotationRing, RotationSample, ROTATION_RING_CAPACITY};
pub use viewport::{
    predict_visibility, ViewportSampler, LIVE_SAFETY_FACTOR, OFFLINE_SAFETY_FACTOR, SAMPLE_POINTS,
    SAMPLE_RES,
};
