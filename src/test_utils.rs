//! Shared fixtures: a parameterised synthetic manifest plus scripted
//! stand-ins for the HTTP and decoder collaborators.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::decoder::{DecoderFactory, TileDecoder, TileFrame};
use crate::error::{PlayerError, PlayerResult};
use crate::fetch::{FetchResponse, SegmentFetcher};
use crate::mpd::Mpd;
use crate::tile_stream::TileStreamBuffer;

/// Parameters of the synthetic manifest.
pub struct MpdFixture {
    pub th: u32,
    pub tv: u32,
    pub tile_w: u32,
    pub tile_h: u32,
    pub qualities: usize,
    pub segments: usize,
    /// Bitrate of quality 0 in bits/s; each rung below halves it.
    pub base_bandwidth: u64,
    pub frame_rate: String,
    pub popularity: bool,
}

impl Default for MpdFixture {
    fn default() -> Self {
        Self {
            th: 4,
            tv: 4,
            tile_w: 480,
            tile_h: 240,
            qualities: 4,
            segments: 4,
            base_bandwidth: 1_000_000,
            frame_rate: "30".into(),
            popularity: false,
        }
    }
}

impl MpdFixture {
    fn bandwidth(&self, quality: usize) -> u64 {
        self.base_bandwidth >> quality
    }
}

/// Render the fixture as MPD XML (1.5 s segments, row-major tiles).
pub fn mpd_xml(fixture: &MpdFixture) -> String {
    let mut xml = String::new();
    let total_s = (fixture.segments as f64 * 1.5).ceil() as u64;
    let _ = write!(
        xml,
        "<MPD xmlns=\"urn:mpeg:dash:schema:mpd:2011\" mediaPresentationDuration=\"PT{total_s}S\"><Period>"
    );

    if fixture.popularity {
        xml.push_str("<Popularity>");
        for segment in 1..=fixture.segments {
            let csv = (0..fixture.th * fixture.tv)
                .map(|t| (t as usize % fixture.qualities).to_string())
                .collect::<Vec<_>>()
                .join(",");
            let _ = write!(
                xml,
                "<SegmentPopularity segment=\"{segment}\" tileQuality=\"{csv}\"/>"
            );
        }
        xml.push_str("</Popularity>");
    }

    for tile in 0..fixture.th * fixture.tv {
        let x = (tile % fixture.th) * fixture.tile_w;
        let y = (tile / fixture.th) * fixture.tile_h;
        let _ = write!(
            xml,
            "<AdaptationSet segmentAlignment=\"true\">\
             <SupplementalProperty schemeIdUri=\"urn:mpeg:dash:srd:2014\" \
             value=\"{tile},{x},{y},{},{},{},{}\"/>",
            fixture.tile_w, fixture.tile_h, fixture.th, fixture.tv
        );
        for quality in 0..fixture.qualities {
            let _ = write!(
                xml,
                "<Representation id=\"t{tile}q{quality}\" width=\"{}\" height=\"{}\" \
                 bandwidth=\"{}\" frameRate=\"{}\">\
                 <SegmentList timescale=\"1000\" duration=\"1500\">\
                 <Initialization sourceURL=\"tile{tile}_init.mp4\"/>",
                fixture.tile_w,
                fixture.tile_h,
                fixture.bandwidth(quality),
                fixture.frame_rate
            );
            for segment in 0..fixture.segments {
                let _ = write!(
                    xml,
                    "<SegmentURL media=\"tile{tile}_q{quality}_s{segment}.m4s\"/>"
                );
            }
            xml.push_str("</SegmentList></Representation>");
        }
        xml.push_str("</AdaptationSet>");
    }
    xml.push_str("</Period></MPD>");
    xml
}

pub fn sample_mpd(fixture: &MpdFixture) -> Mpd {
    Mpd::parse(&mpd_xml(fixture)).expect("fixture manifest must parse")
}

#[derive(Debug)]
struct Scripted {
    bytes: Bytes,
    elapsed_ms: Option<u64>,
    cache_hit: Option<bool>,
}

/// Programmable [`SegmentFetcher`]: canned responses per URL, injectable
/// failures, request counting.
#[derive(Debug, Default)]
pub struct ScriptedFetcher {
    responses: Mutex<HashMap<String, Scripted>>,
    failures: Mutex<HashMap<String, usize>>,
    counts: Mutex<HashMap<String, usize>>,
    default_elapsed_ms: AtomicU64,
    default_cache_hit: AtomicBool,
    /// When nonzero, every payload is replaced by this many zero bytes.
    default_payload_len: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        let fetcher = Self::default();
        fetcher.default_elapsed_ms.store(10, Ordering::Relaxed);
        fetcher
    }

    /// A fetcher that answers every URL of the fixture manifest; the
    /// payload echoes the URL bytes unless a length override is set.
    pub fn from_fixture(fixture: &MpdFixture) -> Self {
        let fetcher = Self::new();
        let mpd = sample_mpd(fixture);
        let mut urls = Vec::new();
        for tile in 0..mpd.tile_count() {
            urls.push(mpd.init_url(tile));
            for quality in 0..mpd.representation_count() {
                for segment in 0..mpd.segment_count() {
                    urls.push(mpd.media_url(segment, tile, quality));
                }
            }
        }
        {
            let mut responses = fetcher.responses.lock();
            for url in urls {
                let bytes = Bytes::from(url.clone().into_bytes());
                responses.insert(
                    url,
                    Scripted {
                        bytes,
                        elapsed_ms: None,
                        cache_hit: None,
                    },
                );
            }
        }
        fetcher
    }

    pub fn insert(&self, url: &str, bytes: Bytes, elapsed_ms: u64, cache_hit: bool) {
        self.responses.lock().insert(
            url.to_string(),
            Scripted {
                bytes,
                elapsed_ms: Some(elapsed_ms),
                cache_hit: Some(cache_hit),
            },
        );
    }

    /// Fail the next `n` requests for a URL before serving it again.
    pub fn fail_next(&self, url: &str, n: usize) {
        self.failures.lock().insert(url.to_string(), n);
    }

    pub fn set_default_elapsed_ms(&self, elapsed_ms: u64) {
        self.default_elapsed_ms.store(elapsed_ms, Ordering::Relaxed);
    }

    pub fn set_default_cache_hit(&self, cache_hit: bool) {
        self.default_cache_hit.store(cache_hit, Ordering::Relaxed);
    }

    pub fn set_default_payload_len(&self, len: usize) {
        self.default_payload_len.store(len, Ordering::Relaxed);
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.counts.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_requests(&self) -> usize {
        self.counts.lock().values().sum()
    }
}

impl SegmentFetcher for ScriptedFetcher {
    fn get(&self, url: &str) -> PlayerResult<FetchResponse> {
        *self.counts.lock().entry(url.to_string()).or_insert(0) += 1;

        {
            let mut failures = self.failures.lock();
            if let Some(remaining) = failures.get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(PlayerError::Fetch {
                        url: url.to_string(),
                        reason: "scripted failure".into(),
                    });
                }
            }
        }

        let responses = self.responses.lock();
        let scripted = responses.get(url).ok_or_else(|| PlayerError::Fetch {
            url: url.to_string(),
            reason: "no scripted response".into(),
        })?;

        let override_len = self.default_payload_len.load(Ordering::Relaxed);
        let bytes = if override_len > 0 {
            Bytes::from(vec![0u8; override_len])
        } else {
            scripted.bytes.clone()
        };
        Ok(FetchResponse {
            bytes,
            elapsed_ms: scripted
                .elapsed_ms
                .unwrap_or_else(|| self.default_elapsed_ms.load(Ordering::Relaxed)),
            cache_hit: scripted
                .cache_hit
                .unwrap_or_else(|| self.default_cache_hit.load(Ordering::Relaxed)),
        })
    }
}

/// Bytes one scripted frame consumes from its tile stream.
pub const BYTES_PER_FRAME: usize = 16;

/// Factory for byte-counting decoders: each frame swallows
/// [`BYTES_PER_FRAME`] stream bytes; a short read is end of stream.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDecoderFactory {
    /// Frame-slot indices at which tile 0's decoder reports an error.
    pub error_frames: Vec<usize>,
}

impl DecoderFactory for ScriptedDecoderFactory {
    fn open(&self, stream: TileStreamBuffer) -> PlayerResult<Box<dyn TileDecoder>> {
        Ok(Box::new(ScriptedDecoder {
            stream,
            calls: 0,
            error_frames: self.error_frames.clone(),
        }))
    }
}

struct ScriptedDecoder {
    stream: TileStreamBuffer,
    calls: usize,
    error_frames: Vec<usize>,
}

impl TileDecoder for ScriptedDecoder {
    fn next_frame(&mut self) -> PlayerResult<Option<TileFrame>> {
        let call = self.calls;
        self.calls += 1;

        let srd = self.stream.srd();
        if srd.index == 0 && self.error_frames.contains(&call) {
            return Err(PlayerError::Decode(format!(
                "scripted decode failure at frame {call}"
            )));
        }

        let mut sink = [0u8; BYTES_PER_FRAME];
        let mut got = 0;
        while got < BYTES_PER_FRAME {
            let n = self.stream.read(&mut sink[got..]);
            if n == 0 {
                return Ok(None); // a truncated tail counts as end of stream
            }
            got += n;
        }

        let mut frame = TileFrame::new(srd.w, srd.h);
        frame.y.fill((call % 256) as u8);
        Ok(Some(frame))
    }
}
