use crate::chart::TrackSize;
use crate::fetch::FetchOptions;
use crate::filter::FilterSpec;
use crate::{data_path, write_json_to_file};

use feed::{ChannelId, Credential, resilience::ReconnectPolicy, transport::TransportConfig};
use serde::{Deserialize, Serialize};

use std::path::Path;
use std::time::Duration;

pub const CONFIG_FILE: &str = "seisflow.json";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Config io: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config parse: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub offline_after: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 1_000,
            max_delay_ms: 30_000,
            offline_after: 5,
        }
    }
}

/// Fields sent with every plain and filtered fetch.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RequestDefaults {
    pub force_center: bool,
    pub resample: bool,
    pub sample_rate: Option<f32>,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            force_center: false,
            resample: true,
            sample_rate: None,
        }
    }
}

/// Helicorder layout: `tracks` rows of `track_secs` each, the last ending now.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OverviewConfig {
    pub track_secs: u64,
    pub tracks: u32,
}

impl Default for OverviewConfig {
    fn default() -> Self {
        Self {
            track_secs: 1_800,
            tracks: 12,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DetailConfig {
    /// Trailing window shown by the detail chart.
    pub window_secs: u64,
    /// Width of one fetch/cache segment inside the window.
    pub segment_secs: u64,
    pub filter: FilterSpec,
    pub spectrogram: Option<TrackSize>,
}

impl Default for DetailConfig {
    fn default() -> Self {
        Self {
            window_secs: 600,
            segment_secs: 60,
            filter: FilterSpec::none(),
            spectrogram: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server_url: String,
    pub debounce_ms: u64,
    pub live_window_ms: i64,
    pub refresh_interval_secs: u64,
    pub ping_interval_secs: u64,
    pub reconnect: ReconnectConfig,
    pub request: RequestDefaults,
    pub channels: Vec<ChannelId>,
    pub overview: OverviewConfig,
    pub detail: DetailConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080/stream".to_string(),
            debounce_ms: 200,
            live_window_ms: crate::cache::LIVE_WINDOW_MS,
            refresh_interval_secs: 10,
            ping_interval_secs: 30,
            reconnect: ReconnectConfig::default(),
            request: RequestDefaults::default(),
            channels: vec![],
            overview: OverviewConfig::default(),
            detail: DetailConfig::default(),
        }
    }
}

impl Config {
    /// Reads the saved config from the data folder, falling back to defaults
    /// when it is missing or unreadable, then applies environment overrides.
    pub fn load() -> Self {
        let path = data_path(Some(CONFIG_FILE));

        let mut config = if path.exists() {
            match read_from_path(&path) {
                Ok(config) => config,
                Err(e) => {
                    log::error!("Failed to load config from {}: {e}", path.display());
                    Config::default()
                }
            }
        } else {
            log::info!("No config at {}, writing defaults", path.display());
            let config = Config::default();
            if let Err(e) = config.save() {
                log::warn!("Failed to write default config: {e}");
            }
            config
        };

        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        write_json_to_file(&json, CONFIG_FILE)?;
        Ok(())
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("SEISFLOW_URL").filter(|url| !url.trim().is_empty()) {
            self.server_url = url.trim().to_string();
        }
    }

    pub fn credential(lookup: impl Fn(&str) -> Option<String>) -> Credential {
        Credential::new(
            lookup("SEISFLOW_ACCESS_TOKEN").unwrap_or_default(),
            lookup("SEISFLOW_REFRESH_TOKEN").unwrap_or_default(),
        )
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            min_delay: Duration::from_millis(self.reconnect.min_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            offline_after: self.reconnect.offline_after.max(1),
        }
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            url: self.server_url.clone(),
            reconnect: self.reconnect_policy(),
            ping_interval: Duration::from_secs(self.ping_interval_secs.max(1)),
        }
    }

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            live_window_ms: self.live_window_ms,
            debounce: Duration::from_millis(self.debounce_ms),
            force_center: self.request.force_center,
            resample: self.request.resample,
            sample_rate: self.request.sample_rate,
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}

/// Parses the config at `path`. A file that fails to parse is moved aside to
/// `<stem>_old.<ext>` so the next save does not overwrite it.
pub fn read_from_path(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;

    match serde_json::from_str(&contents) {
        Ok(config) => Ok(config),
        Err(e) => {
            let backup_path = backup_path(path);

            if let Err(rename_err) = std::fs::rename(path, &backup_path) {
                log::warn!(
                    "Failed to backup corrupted config '{}' to '{}': {}",
                    path.display(),
                    backup_path.display(),
                    rename_err
                );
            } else {
                log::info!(
                    "Backed up corrupted config to '{}'. It can be restored manually.",
                    backup_path.display()
                );
            }

            Err(ConfigError::Parse(e))
        }
    }
}

fn backup_path(path: &Path) -> std::path::PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let name = match path.extension() {
        Some(ext) => format!("{stem}_old.{}", ext.to_string_lossy()),
        None => format!("{stem}_old"),
    };
    path.with_file_name(name)
}
