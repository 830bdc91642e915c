pub mod auth;
pub mod command;
pub mod connect;
pub mod frame;
pub mod health;
pub mod request;
pub mod resilience;
pub mod transport;

pub use auth::{AuthProvider, Credential};
pub use command::{Command, Envelope};
pub use frame::{Frame, FrameError, Header};
pub use health::ConnectionHealth;
pub use request::{RequestId, RequestKind, RequestTracker, Trackers};
pub use transport::{CommandSink, Event, TransportError, TransportHandle};

use serde::{Deserialize, Serialize};

use std::{fmt, str::FromStr, sync::Arc};

/// Waveform source identifier, `network.station.location.code`.
///
/// Cheap to clone: the string is shared, and the id never changes once a
/// request has been issued for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(Arc<str>);

impl ChannelId {
    pub fn new(id: &str) -> Self {
        Self(Arc::from(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the id into its `(network, station, location, code)` parts.
    /// Returns `None` when the id is not dot separated into four parts.
    pub fn parts(&self) -> Option<(&str, &str, &str, &str)> {
        let mut it = self.0.split('.');
        let parts = (it.next()?, it.next()?, it.next()?, it.next()?);
        if it.next().is_some() {
            return None;
        }
        Some(parts)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ChannelId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty channel id".to_string());
        }
        if s.len() > frame::FIELD_LEN {
            return Err(format!(
                "Channel id longer than {} bytes: {s}",
                frame::FIELD_LEN
            ));
        }
        Ok(Self::new(s))
    }
}

/// Half-open time interval `[start, end)` in milliseconds since epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Segment {
    pub start: i64,
    pub end: i64,
}

impl Segment {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }

    pub fn contains(&self, ts: i64) -> bool {
        self.start <= ts && ts < self.end
    }

    pub fn overlaps(&self, other: &Segment) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Consecutive segments of `width` ms covering `[start, end)`.
    /// The last one is clipped to `end`.
    pub fn split(&self, width: i64) -> Vec<Segment> {
        if width <= 0 || self.end <= self.start {
            return vec![];
        }

        let mut out = Vec::new();
        let mut cursor = self.start;
        while cursor < self.end {
            let next = cursor.saturating_add(width).min(self.end);
            out.push(Segment::new(cursor, next));
            cursor = next;
        }
        out
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Decoded waveform for one (channel, segment).
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesData {
    /// Sample timestamps in ms since epoch.
    pub index: Vec<f64>,
    pub data: Vec<f32>,
    /// Per-sample validity, `false` marks a gap. Same length as `data` when present.
    pub mask: Option<Vec<bool>>,
    pub min: f32,
    pub max: f32,
    pub count: usize,
}

impl SeriesData {
    pub fn is_valid(&self, i: usize) -> bool {
        match &self.mask {
            Some(mask) => mask.get(i).copied().unwrap_or(false),
            None => i < self.data.len(),
        }
    }

    pub fn gap_count(&self) -> usize {
        self.mask
            .as_ref()
            .map_or(0, |mask| mask.iter().filter(|valid| !**valid).count())
    }
}

/// Server-rendered spectrogram raster plus its axis bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrogramData {
    pub time_min: f64,
    pub time_max: f64,
    pub freq_min: f64,
    pub freq_max: f64,
    pub time_length: i32,
    pub freq_length: i32,
    pub min: f32,
    pub max: f32,
    /// Raster consumed verbatim by the chart surface.
    pub image: Vec<u8>,
}

impl SpectrogramData {
    /// A zero-length axis means the server had nothing to rasterize.
    pub fn is_empty(&self) -> bool {
        self.time_length <= 0 || self.freq_length <= 0
    }
}
