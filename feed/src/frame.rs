//! Binary frame codec.
//!
//! Every frame travels as one compressed block. After decompression it starts
//! with a fixed prologue:
//!
//! ```text
//! [4]  version     u32 LE
//! [64] requestId   NUL-padded ASCII
//! [64] command     NUL-padded ASCII
//! [64] channelId   NUL-padded ASCII (data frames only)
//! ```
//!
//! followed by the command specific fields, all little-endian.

use crate::command::Command;
use crate::{ChannelId, Segment, SeriesData, SpectrogramData};

use flate2::{
    Compression,
    read::{GzDecoder, ZlibDecoder},
    write::ZlibEncoder,
};

use std::io::{Read, Write};

pub const PROTOCOL_VERSION: u32 = 1;
/// Width of every fixed-length string field.
pub const FIELD_LEN: usize = 64;
const VERSION_LEN: usize = 4;
/// Length of a decompressed header-only frame.
pub const HEADER_LEN: usize = VERSION_LEN + 2 * FIELD_LEN;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
/// Largest decompressed frame accepted; matches the websocket message cap.
pub const MAX_FRAME_LEN: usize = 64 << 20;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("Decompression: {0}")]
    Decompression(String),
    #[error("Malformed frame: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub request_id: String,
    pub command: String,
}

impl Header {
    pub fn new(request_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            command: command.into(),
        }
    }

    pub fn command(&self) -> Option<Command> {
        self.command.parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesFrame {
    pub header: Header,
    pub channel: ChannelId,
    pub segment: Segment,
    /// Timestamp of the first sample, ms since epoch.
    pub time: f64,
    pub sampling_rate: f32,
    pub series: SeriesData,
}

impl SeriesFrame {
    /// Builds a frame from raw samples, deriving the time index and the
    /// min/max over valid samples.
    pub fn new(
        header: Header,
        channel: ChannelId,
        segment: Segment,
        time: f64,
        sampling_rate: f32,
        data: Vec<f32>,
        mask: Option<Vec<bool>>,
    ) -> Self {
        let index = sample_index(time, sampling_rate, data.len());

        let (min, max) = data
            .iter()
            .enumerate()
            .filter(|(i, _)| mask.as_ref().is_none_or(|m| m.get(*i).copied().unwrap_or(false)))
            .fold(None, |acc: Option<(f32, f32)>, (_, v)| match acc {
                Some((lo, hi)) => Some((lo.min(*v), hi.max(*v))),
                None => Some((*v, *v)),
            })
            .unwrap_or((0.0, 0.0));

        let count = data.len();

        Self {
            header,
            channel,
            segment,
            time,
            sampling_rate,
            series: SeriesData {
                index,
                data,
                mask,
                min,
                max,
                count,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpectrogramFrame {
    pub header: Header,
    pub channel: ChannelId,
    pub segment: Segment,
    pub spectrogram: SpectrogramData,
}

/// One decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Header(Header),
    Series(SeriesFrame),
    Spectrogram(SpectrogramFrame),
}

impl Frame {
    pub fn header(&self) -> &Header {
        match self {
            Frame::Header(header) => header,
            Frame::Series(frame) => &frame.header,
            Frame::Spectrogram(frame) => &frame.header,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.header().request_id
    }
}

enum Layout {
    Series,
    Spectrogram,
}

fn layout_of(command: &str) -> Option<Layout> {
    match command.parse::<Command>() {
        Ok(Command::Fetch | Command::Filter) => Some(Layout::Series),
        Ok(Command::Spectrogram) => Some(Layout::Spectrogram),
        _ => None,
    }
}

/// `time + (i / samplingRate) * 1000` for every sample.
pub fn sample_index(time: f64, sampling_rate: f32, n: usize) -> Vec<f64> {
    let rate = f64::from(sampling_rate);
    (0..n).map(|i| time + (i as f64 / rate) * 1000.0).collect()
}

pub fn mask_len(n_samples: usize) -> usize {
    n_samples.div_ceil(8)
}

/// Decompresses and parses one received block.
pub fn decode(raw: &[u8]) -> Result<Frame, FrameError> {
    let buf = decompress(raw)?;
    let mut reader = Reader::new(&buf);

    let version = reader.u32("version")?;
    if version != PROTOCOL_VERSION && version != 0 {
        return Err(FrameError::Malformed(format!(
            "unsupported protocol version {version}"
        )));
    }

    let header = Header {
        request_id: reader.fixed_str("requestId")?,
        command: reader.fixed_str("command")?,
    };

    // data commands that stop right after the prologue are acknowledgements
    let layout = match layout_of(&header.command) {
        Some(layout) if !reader.is_empty() => layout,
        _ => return Ok(Frame::Header(header)),
    };

    let channel = reader.fixed_str("channelId")?;
    if channel.is_empty() {
        return Err(FrameError::Malformed("empty channelId".to_string()));
    }
    let channel = ChannelId::new(&channel);

    match layout {
        Layout::Series => decode_series(header, channel, &mut reader).map(Frame::Series),
        Layout::Spectrogram => {
            decode_spectrogram(header, channel, &mut reader).map(Frame::Spectrogram)
        }
    }
}

fn decode_series(
    header: Header,
    channel: ChannelId,
    reader: &mut Reader<'_>,
) -> Result<SeriesFrame, FrameError> {
    let start = reader.i64("start")?;
    let end = reader.i64("end")?;
    let time = reader.f64("time")?;
    let sampling_rate = reader.f32("samplingRate")?;
    let n_samples = reader.i32("nSamples")?;
    let min = reader.f32("min")?;
    let max = reader.f32("max")?;

    let n = usize::try_from(n_samples)
        .map_err(|_| FrameError::Malformed(format!("negative nSamples {n_samples}")))?;

    if n > 0 && !(sampling_rate.is_finite() && sampling_rate > 0.0) {
        return Err(FrameError::Malformed(format!(
            "invalid samplingRate {sampling_rate} for {n} samples"
        )));
    }

    let value_bytes = n
        .checked_mul(4)
        .ok_or_else(|| FrameError::Malformed(format!("nSamples {n} overflows")))?;

    let data = reader
        .take(value_bytes, "samples")?
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect::<Vec<f32>>();

    let mask_bytes = reader.take(mask_len(n), "mask")?;
    let mask = (0..n)
        .map(|i| (mask_bytes[i / 8] >> (i % 8)) & 1 == 1)
        .collect::<Vec<bool>>();

    Ok(SeriesFrame {
        header,
        channel,
        segment: Segment::new(start, end),
        time,
        sampling_rate,
        series: SeriesData {
            index: sample_index(time, sampling_rate, n),
            data,
            mask: Some(mask),
            min,
            max,
            count: n,
        },
    })
}

fn decode_spectrogram(
    header: Header,
    channel: ChannelId,
    reader: &mut Reader<'_>,
) -> Result<SpectrogramFrame, FrameError> {
    let start = reader.i64("start")?;
    let end = reader.i64("end")?;

    let spectrogram = SpectrogramData {
        time_min: reader.f64("timeMin")?,
        time_max: reader.f64("timeMax")?,
        freq_min: reader.f64("freqMin")?,
        freq_max: reader.f64("freqMax")?,
        time_length: reader.i32("timeLength")?,
        freq_length: reader.i32("freqLength")?,
        min: reader.f32("min")?,
        max: reader.f32("max")?,
        image: reader.rest().to_vec(),
    };

    if spectrogram.time_length < 0 || spectrogram.freq_length < 0 {
        return Err(FrameError::Malformed(format!(
            "negative spectrogram axis {}x{}",
            spectrogram.time_length, spectrogram.freq_length
        )));
    }

    Ok(SpectrogramFrame {
        header,
        channel,
        segment: Segment::new(start, end),
        spectrogram,
    })
}

fn decompress(raw: &[u8]) -> Result<Vec<u8>, FrameError> {
    decompress_within(raw, MAX_FRAME_LEN)
}

fn decompress_within(raw: &[u8], limit: usize) -> Result<Vec<u8>, FrameError> {
    if raw.is_empty() {
        return Err(FrameError::Decompression("empty block".to_string()));
    }

    // one byte past the limit is enough to tell an overrun from an exact fit
    let budget = limit as u64 + 1;
    let mut out = Vec::new();
    let read = if raw.starts_with(&GZIP_MAGIC) {
        GzDecoder::new(raw).take(budget).read_to_end(&mut out)
    } else {
        ZlibDecoder::new(raw).take(budget).read_to_end(&mut out)
    };

    read.map_err(|e| FrameError::Decompression(e.to_string()))?;

    if out.len() > limit {
        return Err(FrameError::Malformed(format!(
            "block inflates past {limit} bytes"
        )));
    }
    Ok(out)
}

/// Bounds-checked little-endian cursor over a decompressed frame.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize, field: &str) -> Result<&'a [u8], FrameError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                FrameError::Malformed(format!(
                    "{field}: needs {n} bytes at offset {}, frame is {} bytes",
                    self.pos,
                    self.buf.len()
                ))
            })?;

        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos.min(self.buf.len())..];
        self.pos = self.buf.len();
        out
    }

    fn array<const N: usize>(&mut self, field: &str) -> Result<[u8; N], FrameError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, field)?);
        Ok(out)
    }

    fn u32(&mut self, field: &str) -> Result<u32, FrameError> {
        self.array(field).map(u32::from_le_bytes)
    }

    fn i32(&mut self, field: &str) -> Result<i32, FrameError> {
        self.array(field).map(i32::from_le_bytes)
    }

    fn i64(&mut self, field: &str) -> Result<i64, FrameError> {
        self.array(field).map(i64::from_le_bytes)
    }

    fn f32(&mut self, field: &str) -> Result<f32, FrameError> {
        self.array(field).map(f32::from_le_bytes)
    }

    fn f64(&mut self, field: &str) -> Result<f64, FrameError> {
        self.array(field).map(f64::from_le_bytes)
    }

    fn fixed_str(&mut self, field: &str) -> Result<String, FrameError> {
        let raw = self.take(FIELD_LEN, field)?;
        let bytes = raw.iter().copied().filter(|b| *b != 0).collect::<Vec<u8>>();

        String::from_utf8(bytes)
            .map(|s| s.trim().to_string())
            .map_err(|e| FrameError::Malformed(format!("{field}: {e}")))
    }
}

/// Serializes and compresses a frame the way the server emits it.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, FrameError> {
    let mut buf = Vec::with_capacity(HEADER_LEN + FIELD_LEN + 64);
    buf.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());

    let header = frame.header();
    put_fixed_str(&mut buf, &header.request_id, "requestId")?;
    put_fixed_str(&mut buf, &header.command, "command")?;

    match frame {
        Frame::Header(_) => {}
        Frame::Series(series) => {
            put_fixed_str(&mut buf, series.channel.as_str(), "channelId")?;

            let n = i32::try_from(series.series.data.len()).map_err(|_| {
                FrameError::Malformed(format!("{} samples", series.series.data.len()))
            })?;

            buf.extend_from_slice(&series.segment.start.to_le_bytes());
            buf.extend_from_slice(&series.segment.end.to_le_bytes());
            buf.extend_from_slice(&series.time.to_le_bytes());
            buf.extend_from_slice(&series.sampling_rate.to_le_bytes());
            buf.extend_from_slice(&n.to_le_bytes());
            buf.extend_from_slice(&series.series.min.to_le_bytes());
            buf.extend_from_slice(&series.series.max.to_le_bytes());

            for value in &series.series.data {
                buf.extend_from_slice(&value.to_le_bytes());
            }

            let n = series.series.data.len();
            let mut mask = vec![0u8; mask_len(n)];
            for i in (0..n).filter(|i| series.series.is_valid(*i)) {
                mask[i / 8] |= 1 << (i % 8);
            }
            buf.extend_from_slice(&mask);
        }
        Frame::Spectrogram(spec) => {
            put_fixed_str(&mut buf, spec.channel.as_str(), "channelId")?;

            let s = &spec.spectrogram;
            buf.extend_from_slice(&spec.segment.start.to_le_bytes());
            buf.extend_from_slice(&spec.segment.end.to_le_bytes());
            buf.extend_from_slice(&s.time_min.to_le_bytes());
            buf.extend_from_slice(&s.time_max.to_le_bytes());
            buf.extend_from_slice(&s.freq_min.to_le_bytes());
            buf.extend_from_slice(&s.freq_max.to_le_bytes());
            buf.extend_from_slice(&s.time_length.to_le_bytes());
            buf.extend_from_slice(&s.freq_length.to_le_bytes());
            buf.extend_from_slice(&s.min.to_le_bytes());
            buf.extend_from_slice(&s.max.to_le_bytes());
            buf.extend_from_slice(&s.image);
        }
    }

    let mut encoder = ZlibEncoder::new(Vec::with_capacity(buf.len() / 2), Compression::fast());
    encoder
        .write_all(&buf)
        .and_then(|_| encoder.finish())
        .map_err(|e| FrameError::Malformed(e.to_string()))
}

fn put_fixed_str(buf: &mut Vec<u8>, value: &str, field: &str) -> Result<(), FrameError> {
    let bytes = value.as_bytes();
    if bytes.len() > FIELD_LEN {
        return Err(FrameError::Malformed(format!(
            "{field} is {} bytes, limit is {FIELD_LEN}",
            bytes.len()
        )));
    }

    buf.extend_from_slice(bytes);
    buf.resize(buf.len() + FIELD_LEN - bytes.len(), 0);
    Ok(())
}
