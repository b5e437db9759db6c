//! HTTP collaborator seam.
//!
//! The core never talks to a socket; it consumes this trait. A response
//! carries the payload, the wall-clock cost of the round trip, and
//! whether the proxy answered from cache (`X-Cache: HIT...`); the
//! throughput estimator must ignore cache hits.

use bytes::Bytes;
use tracing::warn;

use crate::error::{PlayerError, PlayerResult};

/// One completed segment fetch.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub bytes: Bytes,
    /// Round-trip duration in milliseconds.
    pub elapsed_ms: u64,
    /// True when the proxy served the response from its cache.
    pub cache_hit: bool,
}

/// Blocking segment transport.
pub trait SegmentFetcher: Send + Sync {
    fn get(&self, url: &str) -> PlayerResult<FetchResponse>;
}

/// Fetch a URL, retrying once on a transport failure.
///
/// The second failure is returned to the caller, which marks the tile's
/// buffer done and lets playback end cleanly.
pub fn fetch_with_retry(
    fetcher: &dyn SegmentFetcher,
    url: &str,
) -> PlayerResult<FetchResponse> {
    match fetcher.get(url) {
        Ok(response) => Ok(response),
        Err(first) => {
            warn!(url, error = %first, "fetch failed, retrying once");
            fetcher.get(url).map_err(|second| PlayerError::Fetch {
                url: url.to_string(),
                reason: second.to_string(),
            })
        }
    }
}
