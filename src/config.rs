//! Player configuration.
//!
//! An explicit record threaded through every constructor. There is no
//! process-wide config singleton; whoever assembles a [`crate::Player`]
//! owns one of these.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::PlayerResult;

/// Configuration for a playback session.
#[derive(Debug, Clone, Deserialize)]
pub struct PlayerConfig {
    /// Proxy host the HTTP collaborator connects to.
    #[serde(default)]
    pub proxy_address: String,
    /// Proxy port.
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
    /// Request path of the manifest.
    #[serde(default)]
    pub mpd_uri: String,

    /// Fit a linear head-motion model instead of using the latest rotation.
    #[serde(default = "default_true")]
    pub viewport_prediction: bool,
    /// Consume the offline popularity table when the viewport plan busts
    /// the budget (or exclusively, when prediction is off).
    #[serde(default = "default_true")]
    pub popularity: bool,
    /// Allow mid-stream transitions from the viewport plan to popularity.
    #[serde(default = "default_true")]
    pub transitions: bool,
    /// Paint tiles by fetched quality instead of compositing real chroma.
    #[serde(default)]
    pub demo: bool,
    /// Update the throughput estimate from measured downloads. When off,
    /// the estimate stays at the seed for the whole session.
    #[serde(default = "default_true")]
    pub bandwidth_adaption: bool,
    /// Initial throughput estimate in bytes per second, used until the
    /// first segment window has been measured.
    #[serde(default = "default_bandwidth_seed")]
    pub bandwidth_seed_bytes_per_s: u64,

    /// Capacity of the composite frame queue.
    #[serde(default = "default_frame_queue_capacity")]
    pub frame_queue_capacity: usize,

    /// Optional head-trace file to replay instead of a live tracker.
    #[serde(default)]
    pub headtrace_path: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_proxy_port() -> u16 {
    3128
}

fn default_bandwidth_seed() -> u64 {
    2_000_000
}

fn default_frame_queue_capacity() -> usize {
    10
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            proxy_address: String::new(),
            proxy_port: default_proxy_port(),
            mpd_uri: String::new(),
            viewport_prediction: true,
            popularity: true,
            transitions: true,
            demo: false,
            bandwidth_adaption: true,
            bandwidth_seed_bytes_per_s: default_bandwidth_seed(),
            frame_queue_capacity: default_frame_queue_capacity(),
            headtrace_path: None,
        }
    }
}

impl PlayerConfig {
    /// Load a configuration from a JSON file.
    pub fn load(path: &Path) -> PlayerResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PlayerConfig = serde_json::from_str(&content)?;
        Ok(config)
    }
}
