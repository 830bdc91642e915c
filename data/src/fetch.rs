use crate::cache::{
    CacheEntry, CacheError, CacheKey, LIVE_WINDOW_MS, LiveBoundary, Namespace, SegmentCache,
    SegmentResult, is_live,
};
use crate::chart::{SurfaceId, SurfaceRequest, SurfaceUpdate, TrackSize, ViewState};
use crate::debounce::Debounce;
use crate::filter::{FilterError, FilterSpec};

use enum_map::{Enum, EnumMap};
use feed::{
    ChannelId, CommandSink, ConnectionHealth, Envelope, Event, Frame, RequestId, RequestKind,
    Segment, Trackers, TransportError,
    command::{SeriesRequest, SpectrogramRequest},
};
use iced_futures::futures::{Stream, StreamExt, channel::mpsc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use std::{
    ops::ControlFlow,
    sync::Arc,
    time::{Duration, Instant},
};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Filter rejected: {0}")]
    Filter(#[from] FilterError),
}

/// How a batch treats the segment cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Ignore the cache, request every segment.
    Force,
    /// Serve non-live segments from the cache.
    Cache,
    /// Like `Cache`, for periodic catch-up ticks. A segment exactly at the edge
    /// of the live window is trusted.
    Refresh,
}

impl Policy {
    /// `None` for `Force`, which never consults the cache.
    pub fn live_boundary(self) -> Option<LiveBoundary> {
        match self {
            Policy::Force => None,
            Policy::Cache => Some(LiveBoundary::Inclusive),
            Policy::Refresh => Some(LiveBoundary::Exclusive),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum)]
pub enum Layer {
    Waveform,
    Spectrogram,
}

/// One `planAndFetch` call: every (channel, segment) pair under one policy.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchPlan {
    pub layer: Layer,
    pub channels: SmallVec<[ChannelId; 4]>,
    pub segments: Vec<Segment>,
    pub policy: Policy,
}

impl FetchPlan {
    pub fn waveform(
        channels: impl IntoIterator<Item = ChannelId>,
        segments: Vec<Segment>,
        policy: Policy,
    ) -> Self {
        Self {
            layer: Layer::Waveform,
            channels: channels.into_iter().collect(),
            segments,
            policy,
        }
    }

    pub fn spectrogram(
        channels: impl IntoIterator<Item = ChannelId>,
        segments: Vec<Segment>,
        policy: Policy,
    ) -> Self {
        Self {
            layer: Layer::Spectrogram,
            channels: channels.into_iter().collect(),
            segments,
            policy,
        }
    }

    pub fn pairs(&self) -> usize {
        self.channels.len() * self.segments.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOptions {
    pub live_window_ms: i64,
    pub debounce: Duration,
    pub force_center: bool,
    pub resample: bool,
    pub sample_rate: Option<f32>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            live_window_ms: LIVE_WINDOW_MS,
            debounce: Duration::from_millis(200),
            force_center: false,
            resample: true,
            sample_rate: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub requested: usize,
    pub from_cache: usize,
}

/// Request family and wire shape a batch resolves to.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Shape {
    Plain,
    Filtered(FilterSpec),
    Spectrogram(TrackSize),
}

impl Shape {
    fn kind(&self) -> RequestKind {
        match self {
            Shape::Plain => RequestKind::Fetch,
            Shape::Filtered(_) => RequestKind::Filter,
            Shape::Spectrogram(_) => RequestKind::Spectrogram,
        }
    }

    fn namespace(&self) -> Namespace {
        match self {
            Shape::Plain => Namespace::Raw,
            Shape::Filtered(filter) => Namespace::Filtered(Arc::from(filter.fingerprint())),
            Shape::Spectrogram(size) => Namespace::Spectrogram {
                width: size.width,
                height: size.height,
            },
        }
    }

    fn envelope(
        &self,
        id: RequestId,
        channel: &ChannelId,
        segment: Segment,
        options: &FetchOptions,
    ) -> Envelope {
        let series = || SeriesRequest {
            channel: channel.clone(),
            segment,
            force_center: options.force_center,
            resample: options.resample,
            sample_rate: options.sample_rate,
        };

        match self {
            Shape::Plain => Envelope::series(self.kind().command(), id, &series()),
            Shape::Filtered(filter) => {
                let envelope = Envelope::series(self.kind().command(), id, &series());
                match filter.request_fields() {
                    Some(fields) => envelope.extend(fields),
                    None => envelope,
                }
            }
            Shape::Spectrogram(size) => Envelope::spectrogram(
                id,
                &SpectrogramRequest {
                    channel: channel.clone(),
                    segment,
                    width: size.width,
                    height: size.height,
                },
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct RequestContext {
    channel: ChannelId,
    segment: Segment,
    namespace: Namespace,
}

/// How long an abandoned request's response is still worth caching.
pub const ORPHAN_TTL: Duration = Duration::from_secs(120);

#[derive(Debug)]
struct Orphan {
    context: RequestContext,
    since: Instant,
}

#[derive(Debug, Default)]
struct SurfaceState {
    view: Option<ViewState>,
    trackers: Trackers<RequestContext>,
}

impl SurfaceState {
    /// Whether a result may still be applied. A surface that never reported a
    /// view has nothing to be stale against.
    fn accepts(&self, context: &RequestContext) -> bool {
        let Some(view) = &self.view else {
            return true;
        };

        if !view.shows(&context.channel, &context.segment) {
            return false;
        }

        match &context.namespace {
            Namespace::Raw => !view.filter.is_active(),
            Namespace::Filtered(key) => {
                view.filter.is_active() && key.as_ref() == view.filter.fingerprint()
            }
            Namespace::Spectrogram { .. } => view.spectrogram.is_some(),
        }
    }
}

/// Decides per (channel, segment) whether to serve from the cache or the
/// network, correlates responses, and feeds both chart surfaces.
///
/// Owns the per-surface request trackers; the cache is shared with whoever
/// else holds the `Arc` for the lifetime of the session.
pub struct FetchOrchestrator<S> {
    sink: S,
    cache: Arc<SegmentCache>,
    options: FetchOptions,
    surfaces: EnumMap<SurfaceId, SurfaceState>,
    debounce: EnumMap<SurfaceId, EnumMap<Layer, Debounce<FetchPlan>>>,
    /// Abandoned requests whose responses are still cached when they arrive.
    orphans: FxHashMap<RequestId, Orphan>,
    updates: mpsc::UnboundedSender<SurfaceUpdate>,
    health: ConnectionHealth,
}

impl<S: CommandSink> FetchOrchestrator<S> {
    pub fn new(
        sink: S,
        cache: Arc<SegmentCache>,
        options: FetchOptions,
        updates: mpsc::UnboundedSender<SurfaceUpdate>,
    ) -> Self {
        let window = options.debounce;

        Self {
            sink,
            cache,
            options,
            surfaces: EnumMap::default(),
            debounce: EnumMap::from_fn(|_| EnumMap::from_fn(|_| Debounce::new(window))),
            orphans: FxHashMap::default(),
            updates,
            health: ConnectionHealth::default(),
        }
    }

    pub fn cache(&self) -> &Arc<SegmentCache> {
        &self.cache
    }

    pub fn health(&self) -> ConnectionHealth {
        self.health
    }

    pub fn has_pending(&self, surface: SurfaceId, kind: RequestKind) -> bool {
        self.surfaces[surface].trackers.has_pending(kind)
    }

    /// Records what `surface` displays. Moving to a disjoint extent abandons
    /// the surface's outstanding requests for segments it no longer shows.
    pub fn set_view(&mut self, surface: SurfaceId, view: ViewState) {
        let previous = self.surfaces[surface].view.replace(view.clone());

        if let Some(previous) = previous
            && !previous.extent.overlaps(&view.extent)
        {
            let extent = view.extent;
            let dropped = self.abandon(surface, |ctx| !ctx.segment.overlaps(&extent));
            if dropped > 0 {
                log::debug!("{surface}: view moved to {extent}, abandoned {dropped} requests");
            }
        }
    }

    /// Debounced entry point. Supersedes any plan for the same surface and
    /// layer that has not been issued yet.
    pub fn request(&mut self, surface: SurfaceId, plan: FetchPlan, now: Instant) {
        let layer = plan.layer;
        if self.debounce[surface][layer].push(plan, now).is_some() {
            log::trace!("{surface}: superseded pending {layer:?} fetch");
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.debounce
            .values()
            .flat_map(|layers| layers.values())
            .filter_map(Debounce::deadline)
            .min()
    }

    /// Issues every debounced plan whose window has elapsed.
    pub fn poll_debounced(&mut self, now: Instant, now_ms: i64) {
        self.prune_orphans(now);

        let mut ready = Vec::new();
        for (surface, layers) in self.debounce.iter_mut() {
            for (_, debounce) in layers.iter_mut() {
                if let Some(plan) = debounce.poll(now) {
                    ready.push((surface, plan));
                }
            }
        }

        for (surface, plan) in ready {
            if let Err(err) = self.plan_and_fetch(surface, &plan, now_ms) {
                log::warn!("{surface}: fetch failed: {err}");
            }
        }
    }

    pub fn plan_and_fetch(
        &mut self,
        surface: SurfaceId,
        plan: &FetchPlan,
        now_ms: i64,
    ) -> Result<BatchSummary, FetchError> {
        let view = self.surfaces[surface].view.as_ref();

        let shape = match plan.layer {
            Layer::Waveform => {
                let filter = view.map(|view| view.filter).unwrap_or_default();
                if filter.is_active() {
                    filter.validate()?;
                    Shape::Filtered(filter)
                } else {
                    Shape::Plain
                }
            }
            Layer::Spectrogram => match view.and_then(|view| view.spectrogram) {
                Some(size) => Shape::Spectrogram(size),
                None => {
                    log::trace!("{surface}: spectrogram layer hidden, skipping fetch");
                    return Ok(BatchSummary::default());
                }
            },
        };
        let namespace = shape.namespace();

        let mut summary = BatchSummary::default();

        for channel in &plan.channels {
            for segment in &plan.segments {
                let key = CacheKey::new(namespace.clone(), channel.clone(), *segment);

                if let Some(entry) = self.cached(&key, plan.policy, now_ms) {
                    self.emit(SurfaceUpdate::Apply {
                        surface,
                        channel: channel.clone(),
                        segment: *segment,
                        result: entry.result.clone(),
                    });
                    summary.from_cache += 1;
                    continue;
                }

                self.issue(
                    surface,
                    &shape,
                    RequestContext {
                        channel: channel.clone(),
                        segment: *segment,
                        namespace: namespace.clone(),
                    },
                )?;
                summary.requested += 1;
            }
        }

        if summary.requested == 0 {
            self.emit(SurfaceUpdate::Render {
                surface,
                signal_refreshed: true,
            });
        }

        log::debug!(
            "{surface}: {:?} {:?} batch, {} requested, {} from cache",
            plan.policy,
            plan.layer,
            summary.requested,
            summary.from_cache
        );

        Ok(summary)
    }

    fn cached(&self, key: &CacheKey, policy: Policy, now_ms: i64) -> Option<Arc<CacheEntry>> {
        let boundary = policy.live_boundary()?;
        if is_live(&key.segment, now_ms, self.options.live_window_ms, boundary) {
            return None;
        }
        self.cache.get(key)
    }

    fn issue(
        &mut self,
        surface: SurfaceId,
        shape: &Shape,
        context: RequestContext,
    ) -> Result<(), FetchError> {
        let kind = shape.kind();
        let trackers = &mut self.surfaces[surface].trackers;

        let was_idle = !trackers.has_pending(kind);
        let (channel, segment) = (context.channel.clone(), context.segment);
        let id = trackers.begin(kind, context);

        let envelope = shape.envelope(id, &channel, segment, &self.options);

        if let Err(err) = self.sink.send(envelope) {
            self.surfaces[surface].trackers.complete(id).ok();
            return Err(err.into());
        }

        if was_idle {
            self.emit(SurfaceUpdate::Busy { surface, kind });
        }
        Ok(())
    }

    pub fn handle_event(&mut self, event: Event, now_ms: i64) {
        match event {
            Event::Frame(frame) => self.handle_frame(frame, now_ms),
            Event::Connected => self.set_health(ConnectionHealth::Connected),
            Event::Disconnected(reason) => {
                log::info!("Stream disconnected: {reason}");
                if self.health != ConnectionHealth::Offline {
                    self.set_health(ConnectionHealth::Reconnecting);
                }
            }
            Event::Offline(reason) => {
                log::warn!("Stream offline: {reason}");
                self.set_health(ConnectionHealth::Offline);
            }
            Event::Notify(header) => {
                log::info!("Server notice for request {}", header.request_id);
            }
        }
    }

    /// Correlates a response with its request, caches it, and applies it to
    /// the surface that asked unless the surface has moved on.
    pub fn handle_frame(&mut self, frame: Frame, now_ms: i64) {
        let Ok(id) = frame.request_id().parse::<RequestId>() else {
            log::debug!("Frame with foreign request id {:?}", frame.request_id());
            return;
        };

        if let Some(orphan) = self.orphans.remove(&id) {
            self.accept(None, &orphan.context, frame, now_ms);
            return;
        }

        let completed = SurfaceId::ALL.into_iter().find_map(|surface| {
            self.surfaces[surface]
                .trackers
                .complete(id)
                .ok()
                .map(|done| (surface, done))
        });

        let Some((surface, done)) = completed else {
            log::debug!("Response for unknown request {id}");
            return;
        };

        self.accept(Some(surface), &done.request.context, frame, now_ms);

        if done.drained {
            self.emit(SurfaceUpdate::Idle {
                surface,
                kind: done.request.kind,
            });
        }
    }

    fn accept(
        &mut self,
        surface: Option<SurfaceId>,
        context: &RequestContext,
        frame: Frame,
        now_ms: i64,
    ) {
        let result = match frame {
            Frame::Header(header) => {
                log::warn!(
                    "{} for {} {} answered without data",
                    header.command,
                    context.channel,
                    context.segment
                );
                return;
            }
            Frame::Series(series) => {
                if series.channel != context.channel || series.segment != context.segment {
                    log::debug!(
                        "Response for {} {} echoes {} {}",
                        context.channel,
                        context.segment,
                        series.channel,
                        series.segment
                    );
                }
                SegmentResult::Series(Arc::new(series.series))
            }
            Frame::Spectrogram(spectrogram) => {
                SegmentResult::Spectrogram(Arc::new(spectrogram.spectrogram))
            }
        };

        let key = CacheKey::new(
            context.namespace.clone(),
            context.channel.clone(),
            context.segment,
        );

        let entry = match self.cache.put(key, result, now_ms) {
            Ok(entry) => entry,
            Err(CacheError::EmptySpectrogram) => {
                log::debug!(
                    "Discarding empty spectrogram for {} {}",
                    context.channel,
                    context.segment
                );
                return;
            }
        };

        let Some(surface) = surface else {
            return;
        };

        if !self.surfaces[surface].accepts(context) {
            log::trace!(
                "{surface}: stale apply of {} {} dropped",
                context.channel,
                context.segment
            );
            return;
        }

        self.emit(SurfaceUpdate::Apply {
            surface,
            channel: context.channel.clone(),
            segment: context.segment,
            result: entry.result.clone(),
        });
    }

    /// Forgets matching requests of `surface`, emitting idle for every
    /// tracker this drains. Returns how many were dropped.
    fn abandon(&mut self, surface: SurfaceId, f: impl Fn(&RequestContext) -> bool) -> usize {
        let now = Instant::now();
        let mut drained: SmallVec<[RequestKind; 3]> = SmallVec::new();
        let mut dropped = 0;

        for (kind, tracker) in self.surfaces[surface].trackers.iter_mut() {
            if !tracker.has_pending() {
                continue;
            }
            for request in tracker.abandon_where(&f) {
                self.sink.forget(request.id);
                self.orphans.insert(
                    request.id,
                    Orphan {
                        context: request.context,
                        since: now,
                    },
                );
                dropped += 1;
            }
            if !tracker.has_pending() {
                drained.push(kind);
            }
        }

        for kind in drained {
            self.emit(SurfaceUpdate::Idle { surface, kind });
        }
        self.prune_orphans(now);
        dropped
    }

    /// Stops waiting for abandoned requests older than [`ORPHAN_TTL`].
    pub fn prune_orphans(&mut self, now: Instant) {
        let before = self.orphans.len();
        self.orphans
            .retain(|_, orphan| now.saturating_duration_since(orphan.since) < ORPHAN_TTL);

        let expired = before - self.orphans.len();
        if expired > 0 {
            log::debug!("{expired} abandoned requests expired unanswered");
        }
    }

    /// Ends the session: drops pending plans, abandons every request and
    /// empties the cache.
    pub fn teardown(&mut self) {
        for layers in self.debounce.values_mut() {
            for debounce in layers.values_mut() {
                debounce.cancel();
            }
        }

        for surface in SurfaceId::ALL {
            self.abandon(surface, |_| true);
        }
        self.orphans.clear();

        let dropped = self.cache.clear();
        log::info!("Fetch session torn down, {dropped} cached segments dropped");
    }

    pub fn handle_request(
        &mut self,
        request: SurfaceRequest,
        now: Instant,
    ) -> ControlFlow<()> {
        match request {
            SurfaceRequest::View(surface, view) => self.set_view(surface, view),
            SurfaceRequest::Fetch(surface, plan) => self.request(surface, plan, now),
            SurfaceRequest::Teardown => {
                self.teardown();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Drives the orchestrator until the surfaces hang up or ask for teardown.
    pub async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<SurfaceRequest>,
        events: impl Stream<Item = Event>,
    ) {
        let mut events = std::pin::pin!(events);

        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                request = requests.next() => match request {
                    Some(request) => {
                        if self.handle_request(request, Instant::now()).is_break() {
                            return;
                        }
                    }
                    None => {
                        log::info!("Chart surfaces closed");
                        self.teardown();
                        return;
                    }
                },
                event = events.next() => match event {
                    Some(event) => self.handle_event(event, now_ms()),
                    None => {
                        log::warn!("Transport event stream ended");
                        self.set_health(ConnectionHealth::Offline);
                        self.teardown();
                        return;
                    }
                },
                () = wait_until(deadline) => self.poll_debounced(Instant::now(), now_ms()),
            }
        }
    }

    fn set_health(&mut self, health: ConnectionHealth) {
        if self.health != health {
            log::info!("Connection {} -> {health}", self.health);
            self.health = health;
            self.emit(SurfaceUpdate::Health(health));
        }
    }

    fn emit(&self, update: SurfaceUpdate) {
        if self.updates.unbounded_send(update).is_err() {
            log::trace!("Surface channel closed, update dropped");
        }
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use feed::{
        Command, Header, SeriesData, SpectrogramData,
        frame::{SeriesFrame, SpectrogramFrame},
    };

    use std::sync::Mutex;

    const NOW: i64 = 1_700_000_000_000;

    #[derive(Clone, Default)]
    struct Recorder {
        sent: Arc<Mutex<Vec<Envelope>>>,
        forgotten: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<Envelope> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }

        fn forgotten(&self) -> Vec<String> {
            self.forgotten.lock().unwrap().clone()
        }
    }

    impl CommandSink for Recorder {
        fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(envelope);
            Ok(())
        }

        fn forget(&self, request_id: RequestId) {
            self.forgotten.lock().unwrap().push(request_id.to_string());
        }
    }

    struct Harness {
        orchestrator: FetchOrchestrator<Recorder>,
        sink: Recorder,
        updates: mpsc::UnboundedReceiver<SurfaceUpdate>,
    }

    impl Harness {
        fn new() -> Self {
            let sink = Recorder::default();
            let (tx, updates) = mpsc::unbounded();
            let options = FetchOptions {
                debounce: Duration::from_millis(100),
                ..FetchOptions::default()
            };
            let orchestrator =
                FetchOrchestrator::new(sink.clone(), Arc::new(SegmentCache::new()), options, tx);

            Self {
                orchestrator,
                sink,
                updates,
            }
        }

        fn drain(&mut self) -> Vec<SurfaceUpdate> {
            let mut out = Vec::new();
            while let Ok(Some(update)) = self.updates.try_next() {
                out.push(update);
            }
            out
        }
    }

    fn channel(id: &str) -> ChannelId {
        ChannelId::new(id)
    }

    fn old_segment(n: i64) -> Segment {
        let start = NOW - 3_600_000 + n * 60_000;
        Segment::new(start, start + 60_000)
    }

    fn series(values: &[f32]) -> SegmentResult {
        SegmentResult::Series(Arc::new(SeriesData {
            index: (0..values.len()).map(|i| i as f64).collect(),
            data: values.to_vec(),
            mask: Some(vec![true; values.len()]),
            min: values.iter().copied().fold(f32::INFINITY, f32::min),
            max: values.iter().copied().fold(f32::NEG_INFINITY, f32::max),
            count: values.len(),
        }))
    }

    fn target(envelope: &Envelope) -> (ChannelId, Segment) {
        let data = &envelope.data;
        (
            channel(data["channelId"].as_str().unwrap()),
            Segment::new(
                data["start"].as_i64().unwrap(),
                data["end"].as_i64().unwrap(),
            ),
        )
    }

    fn respond(envelope: &Envelope, values: &[f32]) -> Frame {
        let (channel, segment) = target(envelope);
        Frame::Series(SeriesFrame::new(
            Header::new(envelope.request_id().unwrap(), envelope.command.as_str()),
            channel,
            segment,
            segment.start as f64,
            100.0,
            values.to_vec(),
            Some(vec![true; values.len()]),
        ))
    }

    /// What applying `frame` should hand the surface.
    fn expected(frame: &Frame) -> SegmentResult {
        match frame {
            Frame::Series(series) => SegmentResult::Series(Arc::new(series.series.clone())),
            other => panic!("expected a series frame, got {other:?}"),
        }
    }

    fn applied(updates: &[SurfaceUpdate]) -> Vec<(Segment, SegmentResult)> {
        updates
            .iter()
            .filter_map(|update| match update {
                SurfaceUpdate::Apply {
                    segment, result, ..
                } => Some((*segment, result.clone())),
                _ => None,
            })
            .collect()
    }

    fn idles(updates: &[SurfaceUpdate]) -> usize {
        updates
            .iter()
            .filter(|update| matches!(update, SurfaceUpdate::Idle { .. }))
            .count()
    }

    #[test]
    fn cache_policy_serves_non_live_entry_without_network() {
        let mut h = Harness::new();
        let ch = channel("IU.ANMO.00.BHZ");
        let seg = old_segment(0);
        h.orchestrator
            .cache()
            .put(CacheKey::new(Namespace::Raw, ch.clone(), seg), series(&[1.0]), NOW)
            .unwrap();

        let plan = FetchPlan::waveform([ch], vec![seg], Policy::Cache);
        let summary = h
            .orchestrator
            .plan_and_fetch(SurfaceId::Overview, &plan, NOW)
            .unwrap();

        assert_eq!(summary.requested, 0);
        assert_eq!(summary.from_cache, 1);
        assert!(h.sink.take().is_empty());

        let updates = h.drain();
        assert_eq!(applied(&updates), vec![(seg, series(&[1.0]))]);
        assert!(updates.contains(&SurfaceUpdate::Render {
            surface: SurfaceId::Overview,
            signal_refreshed: true,
        }));
    }

    #[test]
    fn force_policy_requests_every_pair() {
        let mut h = Harness::new();
        let channels = [channel("IU.ANMO.00.BHZ"), channel("IU.COLA.00.BHZ")];
        let segments: Vec<_> = (0..3).map(old_segment).collect();

        for ch in &channels {
            for seg in &segments {
                h.orchestrator
                    .cache()
                    .put(CacheKey::new(Namespace::Raw, ch.clone(), *seg), series(&[1.0]), NOW)
                    .unwrap();
            }
        }

        let plan = FetchPlan::waveform(channels, segments, Policy::Force);
        h.orchestrator
            .plan_and_fetch(SurfaceId::Detail, &plan, NOW)
            .unwrap();

        let sent = h.sink.take();
        assert_eq!(sent.len(), plan.pairs());
        assert!(sent.iter().all(|e| e.command == Command::Fetch));

        let ids: std::collections::HashSet<_> =
            sent.iter().filter_map(Envelope::request_id).collect();
        assert_eq!(ids.len(), 6);

        let updates = h.drain();
        assert!(applied(&updates).is_empty());
        assert_eq!(
            updates,
            vec![SurfaceUpdate::Busy {
                surface: SurfaceId::Detail,
                kind: RequestKind::Fetch,
            }]
        );
    }

    #[test]
    fn live_edge_differs_between_cache_and_refresh() {
        let mut h = Harness::new();
        let ch = channel("IU.ANMO.00.BHZ");
        let edge = Segment::new(NOW - LIVE_WINDOW_MS - 60_000, NOW - LIVE_WINDOW_MS);
        h.orchestrator
            .cache()
            .put(CacheKey::new(Namespace::Raw, ch.clone(), edge), series(&[1.0]), NOW)
            .unwrap();

        let cache = FetchPlan::waveform([ch.clone()], vec![edge], Policy::Cache);
        let summary = h
            .orchestrator
            .plan_and_fetch(SurfaceId::Overview, &cache, NOW)
            .unwrap();
        assert_eq!(summary.requested, 1);

        let refresh = FetchPlan::waveform([ch], vec![edge], Policy::Refresh);
        let summary = h
            .orchestrator
            .plan_and_fetch(SurfaceId::Overview, &refresh, NOW)
            .unwrap();
        assert_eq!(summary.requested, 0);
    }

    #[test]
    fn live_segment_always_refetched() {
        let mut h = Harness::new();
        let ch = channel("IU.ANMO.00.BHZ");
        let live = Segment::new(NOW - 30_000, NOW);
        h.orchestrator
            .cache()
            .put(CacheKey::new(Namespace::Raw, ch.clone(), live), series(&[1.0]), NOW)
            .unwrap();

        for policy in [Policy::Cache, Policy::Refresh] {
            let plan = FetchPlan::waveform([ch.clone()], vec![live], policy);
            h.orchestrator
                .plan_and_fetch(SurfaceId::Detail, &plan, NOW)
                .unwrap();
        }
        assert_eq!(h.sink.take().len(), 2);
    }

    #[test]
    fn filtered_fetch_keeps_its_own_namespace() {
        let mut h = Harness::new();
        let ch = channel("IU.ANMO.00.BHZ");
        let seg = old_segment(1);
        let raw = CacheKey::new(Namespace::Raw, ch.clone(), seg);
        h.orchestrator
            .cache()
            .put(raw.clone(), series(&[1.0]), NOW)
            .unwrap();

        let filter = FilterSpec::bandpass(0.5, 10.0, 4, true);
        h.orchestrator.set_view(
            SurfaceId::Detail,
            ViewState::new(seg, [ch.clone()]).with_filter(filter),
        );

        let plan = FetchPlan::waveform([ch.clone()], vec![seg], Policy::Cache);
        let summary = h
            .orchestrator
            .plan_and_fetch(SurfaceId::Detail, &plan, NOW)
            .unwrap();
        assert_eq!(summary.requested, 1);

        let sent = h.sink.take();
        assert_eq!(sent[0].command, Command::Filter);
        assert_eq!(sent[0].data["filterType"], "bandpass");
        assert_eq!(sent[0].data["taperType"], "hann");

        h.orchestrator.handle_frame(respond(&sent[0], &[7.0, 8.0]), NOW);

        assert_eq!(
            h.orchestrator.cache().get(&raw).unwrap().result,
            series(&[1.0])
        );
        let filtered = CacheKey::new(
            Namespace::Filtered(Arc::from(filter.fingerprint())),
            ch,
            seg,
        );
        let entry = h.orchestrator.cache().get(&filtered).unwrap();
        let SegmentResult::Series(data) = &entry.result else {
            panic!("expected a series entry");
        };
        assert_eq!(data.data, vec![7.0, 8.0]);
    }

    #[test]
    fn sentinel_filter_issues_plain_fetch() {
        let mut h = Harness::new();
        let ch = channel("IU.ANMO.00.BHZ");
        h.orchestrator.set_view(
            SurfaceId::Detail,
            ViewState::new(old_segment(0), [ch.clone()]).with_filter(FilterSpec::none()),
        );

        let plan = FetchPlan::waveform([ch], vec![old_segment(0)], Policy::Force);
        h.orchestrator
            .plan_and_fetch(SurfaceId::Detail, &plan, NOW)
            .unwrap();

        let sent = h.sink.take();
        assert_eq!(sent[0].command, Command::Fetch);
        assert!(!sent[0].data.contains_key("filterType"));
    }

    #[test]
    fn invalid_filter_is_rejected_before_sending() {
        let mut h = Harness::new();
        let ch = channel("IU.ANMO.00.BHZ");
        h.orchestrator.set_view(
            SurfaceId::Detail,
            ViewState::new(old_segment(0), [ch.clone()])
                .with_filter(FilterSpec::bandpass(10.0, 1.0, 4, true)),
        );

        let plan = FetchPlan::waveform([ch], vec![old_segment(0)], Policy::Force);
        assert!(matches!(
            h.orchestrator.plan_and_fetch(SurfaceId::Detail, &plan, NOW),
            Err(FetchError::Filter(_))
        ));
        assert!(h.sink.take().is_empty());
    }

    #[test]
    fn empty_spectrogram_is_neither_cached_nor_applied() {
        let mut h = Harness::new();
        let ch = channel("IU.ANMO.00.BHZ");
        let seg = old_segment(0);
        h.orchestrator.set_view(
            SurfaceId::Detail,
            ViewState::new(seg, [ch.clone()]).with_spectrogram(TrackSize {
                width: 800,
                height: 120,
            }),
        );

        let plan = FetchPlan::spectrogram([ch.clone()], vec![seg], Policy::Force);
        h.orchestrator
            .plan_and_fetch(SurfaceId::Detail, &plan, NOW)
            .unwrap();

        let sent = h.sink.take();
        assert_eq!(sent[0].command, Command::Spectrogram);
        assert_eq!(sent[0].data["width"], 800);
        assert_eq!(sent[0].data["height"], 120);

        let frame = Frame::Spectrogram(SpectrogramFrame {
            header: Header::new(sent[0].request_id().unwrap(), "stream.spectrogram"),
            channel: ch,
            segment: seg,
            spectrogram: SpectrogramData {
                time_min: seg.start as f64,
                time_max: seg.end as f64,
                freq_min: 0.0,
                freq_max: 50.0,
                time_length: 0,
                freq_length: 64,
                min: 0.0,
                max: 0.0,
                image: vec![],
            },
        });
        h.drain();
        h.orchestrator.handle_frame(frame, NOW);

        assert!(h.orchestrator.cache().is_empty());
        let updates = h.drain();
        assert!(applied(&updates).is_empty());
        assert_eq!(idles(&updates), 1);
    }

    #[test]
    fn hidden_spectrogram_layer_issues_nothing() {
        let mut h = Harness::new();
        let ch = channel("IU.ANMO.00.BHZ");
        h.orchestrator.set_view(
            SurfaceId::Overview,
            ViewState::new(old_segment(0), [ch.clone()]),
        );

        let plan = FetchPlan::spectrogram([ch], vec![old_segment(0)], Policy::Force);
        let summary = h
            .orchestrator
            .plan_and_fetch(SurfaceId::Overview, &plan, NOW)
            .unwrap();

        assert_eq!(summary, BatchSummary::default());
        assert!(h.sink.take().is_empty());
    }

    #[test]
    fn debounce_issues_only_the_last_plan() {
        let mut h = Harness::new();
        let ch = channel("IU.ANMO.00.BHZ");
        let t0 = Instant::now();

        for (offset, n) in [(0, 0), (20, 1), (45, 2)] {
            let plan = FetchPlan::waveform([ch.clone()], vec![old_segment(n)], Policy::Force);
            h.orchestrator.request(
                SurfaceId::Detail,
                plan,
                t0 + Duration::from_millis(offset),
            );
        }

        h.orchestrator
            .poll_debounced(t0 + Duration::from_millis(100), NOW);
        assert!(h.sink.take().is_empty());
        assert_eq!(
            h.orchestrator.next_deadline(),
            Some(t0 + Duration::from_millis(145))
        );

        h.orchestrator
            .poll_debounced(t0 + Duration::from_millis(145), NOW);
        let sent = h.sink.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(target(&sent[0]), (ch, old_segment(2)));
        assert_eq!(h.orchestrator.next_deadline(), None);
    }

    #[test]
    fn out_of_order_responses_land_on_their_own_segments() {
        let mut h = Harness::new();
        let ch = channel("IU.ANMO.00.BHZ");
        let (a, b) = (old_segment(0), old_segment(1));

        let plan = FetchPlan::waveform([ch.clone()], vec![a, b], Policy::Force);
        h.orchestrator
            .plan_and_fetch(SurfaceId::Detail, &plan, NOW)
            .unwrap();
        let sent = h.sink.take();
        h.drain();

        assert_eq!(target(&sent[0]).1, a);
        assert_eq!(target(&sent[1]).1, b);
        let (for_a, for_b) = (respond(&sent[0], &[1.0]), respond(&sent[1], &[2.0]));
        assert_ne!(expected(&for_a), expected(&for_b));

        h.orchestrator.handle_frame(for_b.clone(), NOW);
        let updates = h.drain();
        assert_eq!(applied(&updates), vec![(b, expected(&for_b))]);
        assert_eq!(idles(&updates), 0);
        assert!(h.orchestrator.has_pending(SurfaceId::Detail, RequestKind::Fetch));

        h.orchestrator.handle_frame(for_a.clone(), NOW);
        let updates = h.drain();
        assert_eq!(applied(&updates), vec![(a, expected(&for_a))]);
        assert_eq!(idles(&updates), 1);

        let get = |seg| {
            h.orchestrator
                .cache()
                .get(&CacheKey::new(Namespace::Raw, ch.clone(), seg))
                .map(|entry| entry.result.clone())
        };
        assert_eq!(get(a), Some(expected(&for_a)));
        assert_eq!(get(b), Some(expected(&for_b)));
    }

    #[test]
    fn stale_response_is_cached_but_not_applied() {
        let mut h = Harness::new();
        let ch = channel("IU.ANMO.00.BHZ");
        let seg = old_segment(0);
        h.orchestrator
            .set_view(SurfaceId::Detail, ViewState::new(seg, [ch.clone()]));

        let plan = FetchPlan::waveform([ch.clone()], vec![seg], Policy::Force);
        h.orchestrator
            .plan_and_fetch(SurfaceId::Detail, &plan, NOW)
            .unwrap();
        let sent = h.sink.take();

        h.orchestrator.set_view(
            SurfaceId::Detail,
            ViewState::new(old_segment(10), [ch.clone()]),
        );
        assert!(!h.orchestrator.has_pending(SurfaceId::Detail, RequestKind::Fetch));
        assert_eq!(idles(&h.drain()), 1);

        h.orchestrator.handle_frame(respond(&sent[0], &[3.0]), NOW);
        assert!(applied(&h.drain()).is_empty());
        assert!(
            h.orchestrator
                .cache()
                .get(&CacheKey::new(Namespace::Raw, ch, seg))
                .is_some()
        );
    }

    #[test]
    fn abandoned_requests_are_forgotten_and_expire() {
        let mut h = Harness::new();
        let ch = channel("IU.ANMO.00.BHZ");
        let seg = old_segment(0);
        h.orchestrator
            .set_view(SurfaceId::Detail, ViewState::new(seg, [ch.clone()]));

        let plan = FetchPlan::waveform([ch.clone()], vec![seg], Policy::Force);
        h.orchestrator
            .plan_and_fetch(SurfaceId::Detail, &plan, NOW)
            .unwrap();
        let sent = h.sink.take();
        assert!(h.sink.forgotten().is_empty());

        h.orchestrator.set_view(
            SurfaceId::Detail,
            ViewState::new(old_segment(10), [ch.clone()]),
        );
        assert_eq!(
            h.sink.forgotten(),
            vec![sent[0].request_id().unwrap().to_string()]
        );

        h.orchestrator
            .prune_orphans(Instant::now() + ORPHAN_TTL + Duration::from_secs(1));
        h.orchestrator.handle_frame(respond(&sent[0], &[3.0]), NOW);
        assert!(h.orchestrator.cache().is_empty());
    }

    #[test]
    fn each_surface_goes_idle_on_its_own() {
        let mut h = Harness::new();
        let ch = channel("IU.ANMO.00.BHZ");
        let plan = FetchPlan::waveform([ch], vec![old_segment(0)], Policy::Force);
        h.orchestrator
            .plan_and_fetch(SurfaceId::Overview, &plan, NOW)
            .unwrap();
        h.orchestrator
            .plan_and_fetch(SurfaceId::Detail, &plan, NOW)
            .unwrap();
        let sent = h.sink.take();
        assert_eq!(sent.len(), 2);
        h.drain();

        h.orchestrator.handle_frame(respond(&sent[1], &[1.0]), NOW);
        let updates = h.drain();
        assert!(updates.iter().any(|update| matches!(
            update,
            SurfaceUpdate::Idle {
                surface: SurfaceId::Detail,
                kind: RequestKind::Fetch
            }
        )));
        assert_eq!(idles(&updates), 1);
        assert!(!h.orchestrator.has_pending(SurfaceId::Detail, RequestKind::Fetch));
        assert!(h.orchestrator.has_pending(SurfaceId::Overview, RequestKind::Fetch));
    }

    #[test]
    fn data_less_acknowledgement_completes_request() {
        let mut h = Harness::new();
        let ch = channel("IU.ANMO.00.BHZ");
        let plan = FetchPlan::waveform([ch], vec![old_segment(0)], Policy::Force);
        h.orchestrator
            .plan_and_fetch(SurfaceId::Overview, &plan, NOW)
            .unwrap();
        let sent = h.sink.take();
        h.drain();

        let ack = Frame::Header(Header::new(sent[0].request_id().unwrap(), "stream.fetch"));
        h.orchestrator.handle_frame(ack, NOW);

        assert!(h.orchestrator.cache().is_empty());
        assert_eq!(
            h.drain(),
            vec![SurfaceUpdate::Idle {
                surface: SurfaceId::Overview,
                kind: RequestKind::Fetch,
            }]
        );
    }

    #[test]
    fn unknown_request_id_is_ignored() {
        let mut h = Harness::new();
        let frame = Frame::Header(Header::new(RequestId::new().to_string(), "stream.fetch"));
        h.orchestrator.handle_frame(frame, NOW);
        h.orchestrator
            .handle_frame(Frame::Header(Header::new("not-a-uuid", "notify")), NOW);
        assert!(h.drain().is_empty());
    }

    #[test]
    fn teardown_clears_cache_and_pending() {
        let mut h = Harness::new();
        let ch = channel("IU.ANMO.00.BHZ");
        h.orchestrator
            .cache()
            .put(
                CacheKey::new(Namespace::Raw, ch.clone(), old_segment(5)),
                series(&[1.0]),
                NOW,
            )
            .unwrap();

        let plan = FetchPlan::waveform([ch], vec![old_segment(0)], Policy::Force);
        h.orchestrator
            .plan_and_fetch(SurfaceId::Overview, &plan, NOW)
            .unwrap();
        let sent = h.sink.take();
        h.drain();

        h.orchestrator.teardown();
        assert!(h.orchestrator.cache().is_empty());
        assert_eq!(idles(&h.drain()), 1);

        h.orchestrator.handle_frame(respond(&sent[0], &[1.0]), NOW);
        assert!(h.orchestrator.cache().is_empty());
        assert!(h.drain().is_empty());
    }

    #[test]
    fn health_follows_transport_events() {
        let mut h = Harness::new();
        h.orchestrator.handle_event(Event::Connected, NOW);
        h.orchestrator
            .handle_event(Event::Offline("refused".to_string()), NOW);
        h.orchestrator
            .handle_event(Event::Disconnected("refused".to_string()), NOW);

        assert_eq!(
            h.drain(),
            vec![
                SurfaceUpdate::Health(ConnectionHealth::Connected),
                SurfaceUpdate::Health(ConnectionHealth::Offline),
            ]
        );
        assert_eq!(h.orchestrator.health(), ConnectionHealth::Offline);
    }

    #[tokio::test]
    async fn run_loop_debounces_and_tears_down() {
        let mut h = Harness::new();
        let (requests, rx) = mpsc::unbounded();
        let ch = channel("IU.ANMO.00.BHZ");

        let sink = h.sink.clone();
        let task = tokio::spawn(
            h.orchestrator
                .run(rx, iced_futures::futures::stream::pending()),
        );

        for n in 0..3 {
            let plan = FetchPlan::waveform([ch.clone()], vec![old_segment(n)], Policy::Force);
            requests
                .unbounded_send(SurfaceRequest::Fetch(SurfaceId::Detail, plan))
                .unwrap();
        }

        let busy = tokio::time::timeout(Duration::from_secs(5), h.updates.next())
            .await
            .unwrap();
        assert_eq!(
            busy,
            Some(SurfaceUpdate::Busy {
                surface: SurfaceId::Detail,
                kind: RequestKind::Fetch,
            })
        );
        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(target(&sent[0]).1, old_segment(2));

        requests.unbounded_send(SurfaceRequest::Teardown).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        let idle = h.updates.next().await;
        assert!(matches!(idle, Some(SurfaceUpdate::Idle { .. })));
    }
}
