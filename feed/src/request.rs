use crate::command::Command;

use enum_map::{Enum, EnumMap};
use rustc_hash::FxHashMap;
use uuid::Uuid;

use std::{fmt, str::FromStr, time::Instant};

/// Correlates a request with its response frame. Sent as the hyphenated
/// uuid string, which fits the 64-byte requestId field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        RequestId(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(RequestId)
    }
}

/// Logical request families, each tracked independently so that one family
/// draining never marks another idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum)]
pub enum RequestKind {
    Fetch,
    Filter,
    Spectrogram,
}

impl RequestKind {
    pub const ALL: [RequestKind; 3] = [
        RequestKind::Fetch,
        RequestKind::Filter,
        RequestKind::Spectrogram,
    ];

    pub fn command(&self) -> Command {
        match self {
            RequestKind::Fetch => Command::Fetch,
            RequestKind::Filter => Command::Filter,
            RequestKind::Spectrogram => Command::Spectrogram,
        }
    }

    pub fn from_command(command: Command) -> Option<Self> {
        match command {
            Command::Fetch => Some(RequestKind::Fetch),
            Command::Filter => Some(RequestKind::Filter),
            Command::Spectrogram => Some(RequestKind::Spectrogram),
            _ => None,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    #[error("Request not found: {0}")]
    Unknown(RequestId),
}

#[derive(Debug, Clone)]
pub struct PendingRequest<T> {
    pub id: RequestId,
    pub kind: RequestKind,
    pub issued_at: Instant,
    pub context: T,
}

/// A finished request and whether it was the last one outstanding.
#[derive(Debug, Clone)]
pub struct Completed<T> {
    pub request: PendingRequest<T>,
    pub drained: bool,
}

/// Outstanding requests of one [`RequestKind`].
#[derive(Debug)]
pub struct RequestTracker<T> {
    kind: RequestKind,
    pending: FxHashMap<RequestId, PendingRequest<T>>,
}

impl<T> RequestTracker<T> {
    pub fn new(kind: RequestKind) -> Self {
        RequestTracker {
            kind,
            pending: FxHashMap::default(),
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn begin(&mut self, context: T) -> RequestId {
        let id = RequestId::new();
        self.pending.insert(
            id,
            PendingRequest {
                id,
                kind: self.kind,
                issued_at: Instant::now(),
                context,
            },
        );
        id
    }

    pub fn complete(&mut self, id: RequestId) -> Result<Completed<T>, RequestError> {
        let request = self
            .pending
            .remove(&id)
            .ok_or(RequestError::Unknown(id))?;

        log::trace!(
            "{:?} request {id} completed in {:?}",
            self.kind,
            request.issued_at.elapsed()
        );

        Ok(Completed {
            request,
            drained: self.pending.is_empty(),
        })
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Forgets matching requests without waiting for their responses.
    pub fn abandon_where(&mut self, mut f: impl FnMut(&T) -> bool) -> Vec<PendingRequest<T>> {
        let ids: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, req)| f(&req.context))
            .map(|(id, _)| *id)
            .collect();

        ids.into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }

    pub fn abandon_all(&mut self) -> Vec<PendingRequest<T>> {
        self.pending.drain().map(|(_, req)| req).collect()
    }
}

/// One [`RequestTracker`] per [`RequestKind`].
#[derive(Debug)]
pub struct Trackers<T> {
    trackers: EnumMap<RequestKind, RequestTracker<T>>,
}

impl<T> Trackers<T> {
    pub fn new() -> Self {
        Trackers {
            trackers: EnumMap::from_fn(RequestTracker::new),
        }
    }

    pub fn begin(&mut self, kind: RequestKind, context: T) -> RequestId {
        self.trackers[kind].begin(context)
    }

    /// Completes `id` in whichever tracker issued it.
    pub fn complete(&mut self, id: RequestId) -> Result<Completed<T>, RequestError> {
        let kind = RequestKind::ALL
            .into_iter()
            .find(|kind| self.trackers[*kind].contains(&id))
            .ok_or(RequestError::Unknown(id))?;

        self.trackers[kind].complete(id)
    }

    pub fn has_pending(&self, kind: RequestKind) -> bool {
        self.trackers[kind].has_pending()
    }

    pub fn pending_count(&self, kind: RequestKind) -> usize {
        self.trackers[kind].len()
    }

    pub fn tracker_mut(&mut self, kind: RequestKind) -> &mut RequestTracker<T> {
        &mut self.trackers[kind]
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (RequestKind, &mut RequestTracker<T>)> {
        self.trackers.iter_mut()
    }
}

impl<T> Default for Trackers<T> {
    fn default() -> Self {
        Self::new()
    }
}
