//! Headless chart surfaces: hold what they display and log every render pass.

use data::{
    Config, FetchPlan, Policy, SurfaceId, SurfaceRequest, SurfaceUpdate, TrackStore, ViewState,
};
use feed::{ConnectionHealth, RequestKind, Segment};

use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Geometry {
    /// `tracks` rows of `track_ms`, the last one containing now.
    Helicorder { track_ms: i64, tracks: u32 },
    /// Trailing window split into `segment_ms` segments.
    Trailing { window_ms: i64, segment_ms: i64 },
}

impl Geometry {
    fn segments(&self, now: i64) -> Vec<Segment> {
        match *self {
            Geometry::Helicorder { track_ms, tracks } => {
                let track_ms = track_ms.max(1);
                let last_start = now.div_euclid(track_ms) * track_ms;
                let first_start = last_start - i64::from(tracks.max(1) - 1) * track_ms;
                Segment::new(first_start, last_start + track_ms).split(track_ms)
            }
            Geometry::Trailing {
                window_ms,
                segment_ms,
            } => {
                let segment_ms = segment_ms.max(1);
                let end = (now.div_euclid(segment_ms) + 1) * segment_ms;
                let start = end - window_ms.max(segment_ms);
                Segment::new(start, end).split(segment_ms)
            }
        }
    }
}

pub struct Surface {
    view: ViewState,
    id: SurfaceId,
    geometry: Geometry,
    segments: Vec<Segment>,
    tracks: TrackStore,
    busy: SmallVec<[RequestKind; 3]>,
    health: ConnectionHealth,
    renders: u64,
}

impl Surface {
    pub fn overview(config: &Config, now: i64) -> Self {
        let geometry = Geometry::Helicorder {
            track_ms: config.overview.track_secs as i64 * 1_000,
            tracks: config.overview.tracks,
        };
        Self::new(SurfaceId::Overview, geometry, config, now)
    }

    pub fn detail(config: &Config, now: i64) -> Self {
        let geometry = Geometry::Trailing {
            window_ms: config.detail.window_secs as i64 * 1_000,
            segment_ms: config.detail.segment_secs as i64 * 1_000,
        };
        let mut surface = Self::new(SurfaceId::Detail, geometry, config, now);
        surface.view.filter = config.detail.filter;
        surface.view.spectrogram = config.detail.spectrogram;
        surface
    }

    fn new(id: SurfaceId, geometry: Geometry, config: &Config, now: i64) -> Self {
        let segments = geometry.segments(now);
        let extent = span(&segments);

        Self {
            view: ViewState::new(extent, config.channels.iter().cloned()),
            id,
            geometry,
            segments,
            tracks: TrackStore::default(),
            busy: SmallVec::new(),
            health: ConnectionHealth::default(),
            renders: 0,
        }
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    /// Slides the surface so that it ends at `now`. Returns whether it moved.
    pub fn follow(&mut self, now: i64) -> bool {
        let segments = self.geometry.segments(now);
        if segments == self.segments {
            return false;
        }

        self.view.extent = span(&segments);
        self.segments = segments;

        let evicted = self.tracks.retain_within(&self.view.extent);
        if evicted > 0 {
            log::debug!("{}: scrolled past {evicted} segments", self.id);
        }
        true
    }

    pub fn view_request(&self) -> SurfaceRequest {
        SurfaceRequest::View(self.id, self.view.clone())
    }

    pub fn fetch_requests(&self, policy: Policy) -> Vec<SurfaceRequest> {
        let channels = self.view.channels.iter().cloned();
        let mut requests = vec![SurfaceRequest::Fetch(
            self.id,
            FetchPlan::waveform(channels.clone(), self.segments.clone(), policy),
        )];

        if self.view.spectrogram.is_some() {
            requests.push(SurfaceRequest::Fetch(
                self.id,
                FetchPlan::spectrogram(channels, self.segments.clone(), policy),
            ));
        }
        requests
    }

    pub fn update(&mut self, update: SurfaceUpdate) {
        match update {
            SurfaceUpdate::Apply {
                channel,
                segment,
                result,
                ..
            } => {
                self.tracks.apply(&channel, segment, &result);
            }
            SurfaceUpdate::Busy { kind, .. } => {
                if !self.busy.contains(&kind) {
                    self.busy.push(kind);
                }
            }
            SurfaceUpdate::Idle { kind, .. } => {
                self.busy.retain(|busy| *busy != kind);
                self.render(false);
            }
            SurfaceUpdate::Render {
                signal_refreshed, ..
            } => self.render(signal_refreshed),
            SurfaceUpdate::Health(health) => {
                if health == ConnectionHealth::Offline {
                    log::warn!("{}: streaming server unreachable", self.id);
                }
                self.health = health;
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        !self.busy.is_empty()
    }

    fn render(&mut self, signal_refreshed: bool) {
        self.renders += 1;

        for channel in &self.view.channels {
            let segments = self.tracks.series(channel).count();
            let tiles = match self.view.spectrogram {
                Some(_) => format!(", {} spectrogram tiles", self.tracks.spectrograms(channel).count()),
                None => String::new(),
            };

            match self.tracks.amplitude_range(channel, &self.view.extent) {
                Some((min, max)) => log::info!(
                    "{} #{}: {channel} {segments}/{} segments, amplitude {min:.1}..{max:.1}{tiles}{}",
                    self.id,
                    self.renders,
                    self.segments.len(),
                    if signal_refreshed { " (cached)" } else { "" }
                ),
                None => log::info!(
                    "{} #{}: {channel} no data yet, connection {}",
                    self.id,
                    self.renders,
                    self.health
                ),
            }
        }
    }

    #[cfg(test)]
    fn segments(&self) -> &[Segment] {
        &self.segments
    }

    #[cfg(test)]
    fn layers(&self) -> Vec<data::Layer> {
        self.fetch_requests(Policy::Cache)
            .into_iter()
            .filter_map(|request| match request {
                SurfaceRequest::Fetch(_, plan) => Some(plan.layer),
                _ => None,
            })
            .collect()
    }
}

fn span(segments: &[Segment]) -> Segment {
    match (segments.first(), segments.last()) {
        (Some(first), Some(last)) => Segment::new(first.start, last.end),
        _ => Segment::new(0, 0),
    }
}
