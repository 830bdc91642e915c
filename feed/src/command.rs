use crate::{ChannelId, Credential, RequestId, Segment};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};

use std::{fmt, str::FromStr};

/// Commands understood by the streaming server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Fetch,
    Filter,
    Spectrogram,
    Ping,
    Setup,
    RefreshToken,
    Notify,
}

impl Command {
    pub const ALL: [Command; 7] = [
        Command::Fetch,
        Command::Filter,
        Command::Spectrogram,
        Command::Ping,
        Command::Setup,
        Command::RefreshToken,
        Command::Notify,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Fetch => "stream.fetch",
            Command::Filter => "stream.filter",
            Command::Spectrogram => "stream.spectrogram",
            Command::Ping => "ping",
            Command::Setup => "setup",
            Command::RefreshToken => "refreshToken",
            Command::Notify => "notify",
        }
    }

    /// Commands whose responses carry channel data.
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            Command::Fetch | Command::Filter | Command::Spectrogram
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("Unknown command: {s}"))
    }
}

impl Serialize for Command {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Command {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Plaintext JSON command sent to the server: `{ command, data: { requestId, ... } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub command: Command,
    pub data: Map<String, Value>,
}

impl Envelope {
    pub fn new(command: Command, request_id: RequestId) -> Self {
        let mut data = Map::new();
        data.insert("requestId".to_string(), json!(request_id.to_string()));
        Self { command, data }
    }

    pub fn setup(request_id: RequestId, credential: &Credential) -> Self {
        Self::new(Command::Setup, request_id).with(
            "token",
            json!({ "access": credential.access, "refresh": credential.refresh }),
        )
    }

    pub fn ping(request_id: RequestId) -> Self {
        Self::new(Command::Ping, request_id)
    }

    pub fn series(command: Command, request_id: RequestId, request: &SeriesRequest) -> Self {
        Self::new(command, request_id)
            .with("channelId", json!(request.channel.as_str()))
            .with("start", json!(request.segment.start))
            .with("end", json!(request.segment.end))
            .with("forceCenter", json!(request.force_center))
            .with("resample", json!(request.resample))
            .with("sampleRate", json!(request.sample_rate))
    }

    pub fn spectrogram(request_id: RequestId, request: &SpectrogramRequest) -> Self {
        Self::new(Command::Spectrogram, request_id)
            .with("channelId", json!(request.channel.as_str()))
            .with("start", json!(request.segment.start))
            .with("end", json!(request.segment.end))
            .with("width", json!(request.width))
            .with("height", json!(request.height))
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }

    pub fn extend(mut self, fields: Map<String, Value>) -> Self {
        self.data.extend(fields);
        self
    }

    pub fn request_id(&self) -> Option<&str> {
        self.data.get("requestId").and_then(Value::as_str)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Waveform request parameters shared by plain and filtered fetches.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesRequest {
    pub channel: ChannelId,
    pub segment: Segment,
    pub force_center: bool,
    pub resample: bool,
    /// Target sampling rate in Hz when resampling, `None` lets the server decide.
    pub sample_rate: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpectrogramRequest {
    pub channel: ChannelId,
    pub segment: Segment,
    /// Pixel size of the destination track.
    pub width: u32,
    pub height: u32,
}
