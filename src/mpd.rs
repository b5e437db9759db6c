//! DASH manifest model for tiled spatial streaming.
//!
//! Parses an MPD with one adaptation set per tile, each carrying an SRD
//! supplemental property (`i,x,y,w,h,th,tv`) and a `<SegmentList>`. An
//! optional `<Popularity>` element under `<Period>` carries the offline
//! per-segment tile-quality table. The model is read-only after
//! construction and shared by every other component.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{PlayerError, PlayerResult};

/// Spatial relationship descriptor of one tile.
///
/// `(x, y)` is the tile's pixel origin inside the composite frame,
/// `(w, h)` its pixel size, and `th x tv` the tiling grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Srd {
    pub index: u32,
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub th: u32,
    pub tv: u32,
}

impl Srd {
    /// Parse the `value` attribute of an SRD supplemental property.
    fn parse(value: &str) -> PlayerResult<Self> {
        let fields: Vec<u32> = value
            .split(',')
            .map(|f| f.trim().parse::<u32>())
            .collect::<Result<_, _>>()
            .map_err(|e| PlayerError::Manifest(format!("bad SRD value {value:?}: {e}")))?;
        if fields.len() != 7 {
            return Err(PlayerError::Manifest(format!(
                "SRD value {value:?} has {} fields, expected 7",
                fields.len()
            )));
        }
        Ok(Srd {
            index: fields[0],
            x: fields[1],
            y: fields[2],
            w: fields[3],
            h: fields[4],
            th: fields[5],
            tv: fields[6],
        })
    }
}

/// Segment list of one representation.
#[derive(Debug, Clone, Default)]
pub struct SegmentList {
    pub timescale: u32,
    pub duration: u32,
    pub initialization: String,
    pub segment_urls: Vec<String>,
}

/// One quality level of a tile.
#[derive(Debug, Clone, Default)]
pub struct Representation {
    pub id: String,
    pub width: u32,
    pub height: u32,
    /// Declared bitrate in bits per second.
    pub bandwidth: u64,
    pub frame_rate: f64,
    pub segment_list: SegmentList,
}

/// One tile: its SRD plus the quality ladder, index 0 = highest quality.
#[derive(Debug, Clone, Default)]
pub struct AdaptationSet {
    pub srd: Srd,
    pub representations: Vec<Representation>,
}

/// Per-segment tile-to-quality assignment.
///
/// Indexed by tile; every quality is in `[0, representation_count - 1]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityPlan {
    qualities: Vec<usize>,
}

impl QualityPlan {
    /// A plan with every tile at the given quality.
    pub fn uniform(tile_count: usize, quality: usize) -> Self {
        Self {
            qualities: vec![quality; tile_count],
        }
    }

    pub fn from_vec(qualities: Vec<usize>) -> Self {
        Self { qualities }
    }

    pub fn quality(&self, tile: usize) -> usize {
        self.qualities[tile]
    }

    pub fn set_quality(&mut self, tile: usize, quality: usize) {
        self.qualities[tile] = quality;
    }

    pub fn tile_count(&self) -> usize {
        self.qualities.len()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.qualities
    }
}

/// Offline popularity table: segment -> per-tile quality vector.
///
/// Stored zero-based; the XML attribute `segment` is one-based.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PopularityTable {
    entries: BTreeMap<usize, Vec<usize>>,
}

impl PopularityTable {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, segment: usize, qualities: Vec<usize>) {
        self.entries.insert(segment, qualities);
    }

    pub fn plan(&self, segment: usize) -> Option<QualityPlan> {
        self.entries
            .get(&segment)
            .map(|q| QualityPlan::from_vec(q.clone()))
    }

    /// Serialise back to the `<Popularity>` element the offline tool writes.
    pub fn to_xml(&self) -> String {
        let mut out = String::from("<Popularity>");
        for (segment, qualities) in &self.entries {
            let csv = qualities
                .iter()
                .map(|q| q.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let _ = write!(
                out,
                "<SegmentPopularity segment=\"{}\" tileQuality=\"{}\"/>",
                segment + 1,
                csv
            );
        }
        out.push_str("</Popularity>");
        out
    }
}

/// Parsed manifest.
#[derive(Debug, Clone, Default)]
pub struct Mpd {
    pub media_presentation_duration_ms: u64,
    pub adaptation_sets: Vec<AdaptationSet>,
    popularity: PopularityTable,
}

/// Parse an `xs:duration` (`PT0H1M30.000S`) into milliseconds.
fn parse_duration_ms(value: &str) -> PlayerResult<u64> {
    let dur = iso8601_duration::Duration::parse(value)
        .map_err(|e| PlayerError::Manifest(format!("bad duration {value:?}: {e:?}")))?;
    let std = dur
        .to_std()
        .ok_or_else(|| PlayerError::Manifest(format!("non-exact duration {value:?}")))?;
    Ok(std.as_millis() as u64)
}

/// Parse a frame rate attribute, either `num/den` or a plain integer.
fn parse_frame_rate(value: &str) -> PlayerResult<f64> {
    let bad = || PlayerError::Manifest(format!("bad frameRate {value:?}"));
    match value.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().map_err(|_| bad())?;
            let den: f64 = den.trim().parse().map_err(|_| bad())?;
            if den == 0.0 {
                return Err(bad());
            }
            Ok(num / den)
        }
        None => value.trim().parse().map_err(|_| bad()),
    }
}

impl Mpd {
    /// Parse and validate a manifest document.
    pub fn parse(xml: &str) -> PlayerResult<Self> {
        let mut reader = Reader::from_str(xml);
        let mut buf = Vec::new();

        let mut mpd = Mpd::default();
        let mut current_set: Option<AdaptationSet> = None;
        let mut current_rep: Option<Representation> = None;

        loop {
            let event = reader.read_event_into(&mut buf)?;
            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let name = e.name().as_ref().to_owned();
                    match name.as_slice() {
                        b"MPD" => {
                            for attr in e.attributes() {
                                let attr = attr.map_err(|e| PlayerError::Manifest(format!("bad attribute: {e}")))?;
                                if attr.key.as_ref() == b"mediaPresentationDuration" {
                                    let value = String::from_utf8_lossy(&attr.value);
                                    mpd.media_presentation_duration_ms =
                                        parse_duration_ms(&value)?;
                                }
                            }
                        }
                        b"AdaptationSet" => {
                            current_set = Some(AdaptationSet::default());
                        }
                        b"SupplementalProperty" => {
                            let mut scheme = String::new();
                            let mut value = String::new();
                            for attr in e.attributes() {
                                let attr = attr.map_err(|e| PlayerError::Manifest(format!("bad attribute: {e}")))?;
                                match attr.key.as_ref() {
                                    b"schemeIdUri" => {
                                        scheme =
                                            String::from_utf8_lossy(&attr.value).into_owned()
                                    }
                                    b"value" => {
                                        value =
                                            String::from_utf8_lossy(&attr.value).into_owned()
                                    }
                                    _ => {}
                                }
                            }
                            if let Some(set) = current_set.as_mut() {
                                if scheme.is_empty() || scheme.contains(":srd:") {
                                    set.srd = Srd::parse(&value)?;
                                }
                            }
                        }
                        b"Representation" => {
                            let mut rep = Representation::default();
                            for attr in e.attributes() {
                                let attr = attr.map_err(|e| PlayerError::Manifest(format!("bad attribute: {e}")))?;
                                let value = String::from_utf8_lossy(&attr.value).into_owned();
                                match attr.key.as_ref() {
                                    b"id" => rep.id = value,
                                    b"width" => rep.width = value.parse().unwrap_or(0),
                                    b"height" => rep.height = value.parse().unwrap_or(0),
                                    b"bandwidth" => rep.bandwidth = value.parse().unwrap_or(0),
                                    b"frameRate" => rep.frame_rate = parse_frame_rate(&value)?,
                                    _ => {}
                                }
                            }
                            current_rep = Some(rep);
                        }
                        b"SegmentList" => {
                            if let Some(rep) = current_rep.as_mut() {
                                for attr in e.attributes() {
                                    let attr = attr.map_err(|e| PlayerError::Manifest(format!("bad attribute: {e}")))?;
                                    let value =
                                        String::from_utf8_lossy(&attr.value).into_owned();
                                    match attr.key.as_ref() {
                                        b"timescale" => {
                                            rep.segment_list.timescale =
                                                value.parse().unwrap_or(1)
                                        }
                                        b"duration" => {
                                            rep.segment_list.duration =
                                                value.parse().unwrap_or(0)
                                        }
                                        _ => {}
                                    }
                                }
                            }
                        }
                        b"Initialization" => {
                            if let Some(rep) = current_rep.as_mut() {
                                for attr in e.attributes() {
                                    let attr = attr.map_err(|e| PlayerError::Manifest(format!("bad attribute: {e}")))?;
                                    if attr.key.as_ref() == b"sourceURL" {
                                        rep.segment_list.initialization =
                                            String::from_utf8_lossy(&attr.value).into_owned();
                                    }
                                }
                            }
                        }
                        b"SegmentURL" => {
                            if let Some(rep) = current_rep.as_mut() {
                                for attr in e.attributes() {
                                    let attr = attr.map_err(|e| PlayerError::Manifest(format!("bad attribute: {e}")))?;
                                    if attr.key.as_ref() == b"media" {
                                        rep.segment_list.segment_urls.push(
                                            String::from_utf8_lossy(&attr.value).into_owned(),
                                        );
                                    }
                                }
                            }
                        }
                        b"SegmentPopularity" => {
                            let mut segment: Option<usize> = None;
                            let mut qualities: Vec<usize> = Vec::new();
                            for attr in e.attributes() {
                                let attr = attr.map_err(|e| PlayerError::Manifest(format!("bad attribute: {e}")))?;
                                let value = String::from_utf8_lossy(&attr.value).into_owned();
                                match attr.key.as_ref() {
                                    b"segment" => segment = value.parse().ok(),
                                    b"tileQuality" => {
                                        qualities = value
                                            .split(',')
                                            .map(|q| q.trim().parse::<usize>())
                                            .collect::<Result<_, _>>()
                                            .map_err(|e| {
                                                PlayerError::Manifest(format!(
                                                    "bad tileQuality {value:?}: {e}"
                                                ))
                                            })?;
                                    }
                                    _ => {}
                                }
                            }
                            match segment {
                                // the XML attribute is one-based
                                Some(s) if s >= 1 => {
                                    mpd.popularity.insert(s - 1, qualities);
                                }
                                _ => {
                                    return Err(PlayerError::Manifest(
                                        "SegmentPopularity without a valid segment attribute"
                                            .into(),
                                    ));
                                }
                            }
                        }
                        _ => {}
                    }

                    // Self-closing elements never see an End event.
                    if matches!(event, Event::Empty(_)) {
                        match name.as_slice() {
                            b"Representation" => {
                                if let (Some(set), Some(rep)) =
                                    (current_set.as_mut(), current_rep.take())
                                {
                                    set.representations.push(rep);
                                }
                            }
                            b"AdaptationSet" => {
                                if let Some(set) = current_set.take() {
                                    mpd.adaptation_sets.push(set);
                                }
                            }
                            _ => {}
                        }
                    }
                }
                Event::End(ref e) => match e.name().as_ref() {
                    b"Representation" => {
                        if let (Some(set), Some(rep)) = (current_set.as_mut(), current_rep.take())
                        {
                            set.representations.push(rep);
                        }
                    }
                    b"AdaptationSet" => {
                        if let Some(set) = current_set.take() {
                            mpd.adaptation_sets.push(set);
                        }
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        mpd.validate()?;
        Ok(mpd)
    }

    /// Schema checks the rest of the pipeline relies on.
    fn validate(&self) -> PlayerResult<()> {
        if self.adaptation_sets.is_empty() {
            return Err(PlayerError::Manifest("no adaptation sets".into()));
        }

        let first = &self.adaptation_sets[0];
        if first.representations.is_empty() {
            return Err(PlayerError::Manifest("adaptation set without representations".into()));
        }
        let srd0 = first.srd;
        if srd0.th == 0 || srd0.tv == 0 || srd0.w == 0 || srd0.h == 0 {
            return Err(PlayerError::Manifest("degenerate SRD grid".into()));
        }
        if self.adaptation_sets.len() != (srd0.th * srd0.tv) as usize {
            return Err(PlayerError::Manifest(format!(
                "{} adaptation sets but SRD grid is {}x{}",
                self.adaptation_sets.len(),
                srd0.th,
                srd0.tv
            )));
        }

        let rep_count = first.representations.len();
        let seg_count = first.representations[0].segment_list.segment_urls.len();
        if seg_count == 0 {
            return Err(PlayerError::Manifest("empty segment list".into()));
        }

        for (i, set) in self.adaptation_sets.iter().enumerate() {
            let srd = set.srd;
            if (srd.w, srd.h, srd.th, srd.tv) != (srd0.w, srd0.h, srd0.th, srd0.tv) {
                return Err(PlayerError::Manifest(format!(
                    "tile {i} SRD disagrees with tile 0 on size or grid"
                )));
            }
            if srd.x + srd.w > srd.w * srd.th || srd.y + srd.h > srd.h * srd.tv {
                return Err(PlayerError::Manifest(format!("tile {i} exceeds the composite")));
            }
            if set.representations.len() != rep_count {
                return Err(PlayerError::Manifest(format!(
                    "tile {i} has {} representations, tile 0 has {rep_count}",
                    set.representations.len()
                )));
            }
            for rep in &set.representations {
                if rep.segment_list.segment_urls.len() != seg_count {
                    return Err(PlayerError::Manifest(format!(
                        "tile {i} representation {} segment count mismatch",
                        rep.id
                    )));
                }
                if rep.segment_list.timescale == 0 {
                    return Err(PlayerError::Manifest(format!(
                        "tile {i} representation {} has zero timescale",
                        rep.id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn tile_count(&self) -> usize {
        self.adaptation_sets.len()
    }

    pub fn representation_count(&self) -> usize {
        self.adaptation_sets[0].representations.len()
    }

    pub fn segment_count(&self) -> usize {
        self.adaptation_sets[0].representations[0]
            .segment_list
            .segment_urls
            .len()
    }

    pub fn frame_rate(&self) -> f64 {
        self.adaptation_sets[0].representations[0].frame_rate
    }

    /// Segment duration in seconds (`SegmentList.duration / timescale`).
    pub fn segment_duration_s(&self) -> f64 {
        let list = &self.adaptation_sets[0].representations[0].segment_list;
        list.duration as f64 / list.timescale as f64
    }

    pub fn srd(&self, tile: usize) -> Srd {
        self.adaptation_sets[tile].srd
    }

    /// Composite frame size `(w * th, h * tv)`.
    pub fn composite_size(&self) -> (u32, u32) {
        let srd = self.adaptation_sets[0].srd;
        (srd.w * srd.th, srd.h * srd.tv)
    }

    pub fn representation_bandwidth(&self, tile: usize, quality: usize) -> u64 {
        self.adaptation_sets[tile].representations[quality].bandwidth
    }

    /// Request path of a tile's initialization segment (highest quality
    /// representation; init segments are shared across the ladder).
    pub fn init_url(&self, tile: usize) -> String {
        format!(
            "/{}",
            self.adaptation_sets[tile].representations[0]
                .segment_list
                .initialization
        )
    }

    /// Request path of one media segment.
    pub fn media_url(&self, segment: usize, tile: usize, quality: usize) -> String {
        format!(
            "/{}",
            self.adaptation_sets[tile].representations[quality]
                .segment_list
                .segment_urls[segment]
        )
    }

    pub fn popularity(&self) -> &PopularityTable {
        &self.popularity
    }

    /// The offline quality vector for a segment, if the table carries one.
    pub fn popularity_plan(&self, segment: usize) -> Option<QualityPlan> {
        self.popularity.plan(segment)
    }
}
