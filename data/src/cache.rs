use feed::{ChannelId, Segment, SeriesData, SpectrogramData};

use rustc_hash::FxHashMap;

use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

/// Trailing duration during which the server may still amend a segment.
pub const LIVE_WINDOW_MS: i64 = 60_000;

/// Which comparison closes the live window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveBoundary {
    /// `end + window >= now`
    Inclusive,
    /// `end + window > now`
    Exclusive,
}

pub fn is_live(segment: &Segment, now: i64, window: i64, boundary: LiveBoundary) -> bool {
    let edge = segment.end.saturating_add(window);
    match boundary {
        LiveBoundary::Inclusive => edge >= now,
        LiveBoundary::Exclusive => edge > now,
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Spectrogram has a zero-length axis")]
    EmptySpectrogram,
}

/// Result families never share entries, even for the same channel and segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Namespace {
    Raw,
    /// Keyed by [`crate::filter::FilterSpec::fingerprint`].
    Filtered(Arc<str>),
    Spectrogram { width: u32, height: u32 },
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Raw => write!(f, "raw"),
            Namespace::Filtered(key) => write!(f, "filtered[{key}]"),
            Namespace::Spectrogram { width, height } => write!(f, "spectrogram[{width}x{height}]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub namespace: Namespace,
    pub channel: ChannelId,
    pub segment: Segment,
}

impl CacheKey {
    pub fn new(namespace: Namespace, channel: ChannelId, segment: Segment) -> Self {
        Self {
            namespace,
            channel,
            segment,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.namespace, self.channel, self.segment.start, self.segment.end
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SegmentResult {
    Series(Arc<SeriesData>),
    Spectrogram(Arc<SpectrogramData>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub result: SegmentResult,
    /// Wall clock (ms) at which the entry was written.
    pub stored_at: i64,
}

/// Results shared by every chart surface of a session.
///
/// Entries are stored whole behind an `Arc`; a reader sees either the old or
/// the new entry, and concurrent writers resolve last-writer-wins.
#[derive(Debug, Default)]
pub struct SegmentCache {
    entries: RwLock<FxHashMap<CacheKey, Arc<CacheEntry>>>,
}

impl SegmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn put(
        &self,
        key: CacheKey,
        result: SegmentResult,
        now: i64,
    ) -> Result<Arc<CacheEntry>, CacheError> {
        if let SegmentResult::Spectrogram(spectrogram) = &result
            && spectrogram.is_empty()
        {
            return Err(CacheError::EmptySpectrogram);
        }

        let entry = Arc::new(CacheEntry {
            result,
            stored_at: now,
        });

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&entry));

        Ok(entry)
    }

    pub fn remove(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    /// Drops every entry, returning how many there were.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
