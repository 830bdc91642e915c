use crate::cache::SegmentResult;
use crate::fetch::FetchPlan;
use crate::filter::FilterSpec;

use enum_map::Enum;
use feed::{ChannelId, ConnectionHealth, RequestKind, Segment, SeriesData, SpectrogramData};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use std::{collections::BTreeMap, sync::Arc};

/// The two chart surfaces sharing one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum, Deserialize, Serialize)]
pub enum SurfaceId {
    /// Helicorder-style stack of fixed-width tracks.
    Overview,
    /// Zoomed waveform window.
    Detail,
}

impl SurfaceId {
    pub const ALL: [SurfaceId; 2] = [SurfaceId::Overview, SurfaceId::Detail];
}

impl std::fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SurfaceId::Overview => write!(f, "overview"),
            SurfaceId::Detail => write!(f, "detail"),
        }
    }
}

/// Pixel dimensions of a destination track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TrackSize {
    pub width: u32,
    pub height: u32,
}

/// What a surface currently displays.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewState {
    pub extent: Segment,
    pub channels: SmallVec<[ChannelId; 4]>,
    pub filter: FilterSpec,
    /// `Some` while the spectrogram layer is visible.
    pub spectrogram: Option<TrackSize>,
}

impl ViewState {
    pub fn new(extent: Segment, channels: impl IntoIterator<Item = ChannelId>) -> Self {
        Self {
            extent,
            channels: channels.into_iter().collect(),
            filter: FilterSpec::none(),
            spectrogram: None,
        }
    }

    pub fn with_filter(mut self, filter: FilterSpec) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_spectrogram(mut self, size: TrackSize) -> Self {
        self.spectrogram = Some(size);
        self
    }

    pub fn shows(&self, channel: &ChannelId, segment: &Segment) -> bool {
        self.extent.overlaps(segment) && self.channels.contains(channel)
    }
}

/// Surface → orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceRequest {
    View(SurfaceId, ViewState),
    /// Debounced: only the last plan per surface and layer within the window is issued.
    Fetch(SurfaceId, FetchPlan),
    Teardown,
}

/// Orchestrator → surface.
#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceUpdate {
    Apply {
        surface: SurfaceId,
        channel: ChannelId,
        segment: Segment,
        result: SegmentResult,
    },
    Busy {
        surface: SurfaceId,
        kind: RequestKind,
    },
    /// Every request of `kind` for this surface has been answered or abandoned.
    Idle {
        surface: SurfaceId,
        kind: RequestKind,
    },
    /// A batch finished without touching the network.
    Render {
        surface: SurfaceId,
        signal_refreshed: bool,
    },
    Health(ConnectionHealth),
}

impl SurfaceUpdate {
    pub fn surface(&self) -> Option<SurfaceId> {
        match self {
            SurfaceUpdate::Apply { surface, .. }
            | SurfaceUpdate::Busy { surface, .. }
            | SurfaceUpdate::Idle { surface, .. }
            | SurfaceUpdate::Render { surface, .. } => Some(*surface),
            SurfaceUpdate::Health(_) => None,
        }
    }
}

/// Applied results of one surface, keyed by (channel, segment).
///
/// Applying is idempotent: a result replaces whatever was stored under its
/// key, so re-applying the same one leaves the visible state unchanged.
#[derive(Debug, Default)]
pub struct TrackStore {
    series: BTreeMap<(ChannelId, Segment), Arc<SeriesData>>,
    spectrograms: BTreeMap<(ChannelId, Segment), Arc<SpectrogramData>>,
}

impl TrackStore {
    /// Returns whether the visible state changed.
    pub fn apply(&mut self, channel: &ChannelId, segment: Segment, result: &SegmentResult) -> bool {
        let key = (channel.clone(), segment);
        match result {
            SegmentResult::Series(series) => match self.series.get(&key) {
                Some(existing) if existing == series => false,
                _ => {
                    self.series.insert(key, Arc::clone(series));
                    true
                }
            },
            SegmentResult::Spectrogram(spectrogram) => match self.spectrograms.get(&key) {
                Some(existing) if existing == spectrogram => false,
                _ => {
                    self.spectrograms.insert(key, Arc::clone(spectrogram));
                    true
                }
            },
        }
    }

    pub fn series(&self, channel: &ChannelId) -> impl Iterator<Item = (&Segment, &SeriesData)> {
        self.series
            .iter()
            .filter(move |((ch, _), _)| ch == channel)
            .map(|((_, segment), data)| (segment, &**data))
    }

    pub fn spectrograms(
        &self,
        channel: &ChannelId,
    ) -> impl Iterator<Item = (&Segment, &SpectrogramData)> {
        self.spectrograms
            .iter()
            .filter(move |((ch, _), _)| ch == channel)
            .map(|((_, segment), data)| (segment, &**data))
    }

    /// Amplitude range of `channel` over the segments overlapping `extent`.
    pub fn amplitude_range(&self, channel: &ChannelId, extent: &Segment) -> Option<(f32, f32)> {
        self.series(channel)
            .filter(|(segment, data)| segment.overlaps(extent) && data.count > 0)
            .fold(None, |acc, (_, data)| match acc {
                None => Some((data.min, data.max)),
                Some((lo, hi)) => Some((lo.min(data.min), hi.max(data.max))),
            })
    }

    /// Evicts everything not overlapping `extent`. Returns how many were dropped.
    pub fn retain_within(&mut self, extent: &Segment) -> usize {
        let before = self.len();
        self.series.retain(|(_, segment), _| segment.overlaps(extent));
        self.spectrograms
            .retain(|(_, segment), _| segment.overlaps(extent));
        before - self.len()
    }

    pub fn len(&self) -> usize {
        self.series.len() + self.spectrograms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
