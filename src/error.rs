//! Error types for tilecast.

use thiserror::Error;

/// Error types for playback operations.
#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("Invalid manifest: {0}")]
    Manifest(String),

    #[error("Invalid head trace: {0}")]
    Trace(String),

    #[error("Fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("XML parse error: {0}")]
    Xml(#[from] quick_xml::Error),
}

/// Result type alias for playback operations.
pub type PlayerResult<T> = Result<T, PlayerError>;
