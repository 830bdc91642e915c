pub mod cache;
pub mod chart;
pub mod config;
pub mod debounce;
pub mod fetch;
pub mod filter;

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

pub use cache::{CacheKey, Namespace, SegmentCache, SegmentResult};
pub use chart::{SurfaceId, SurfaceRequest, SurfaceUpdate, TrackSize, TrackStore, ViewState};
pub use config::Config;
pub use fetch::{FetchOptions, FetchOrchestrator, FetchPlan, Layer, Policy};
pub use filter::FilterSpec;

#[derive(thiserror::Error, Debug, Clone)]
pub enum InternalError {
    #[error("Data folder error: {0}")]
    DataFolder(String),
}

pub fn write_json_to_file(json: &str, file_name: &str) -> std::io::Result<()> {
    let path = data_path(Some(file_name));

    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "Invalid file path")
    })?;

    if !parent.exists() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = File::create(path)?;
    file.write_all(json.as_bytes())?;
    Ok(())
}

/// Creates the data folder if needed and returns it.
pub fn ensure_data_folder() -> Result<PathBuf, InternalError> {
    let path = data_path(None);

    std::fs::create_dir_all(&path).map_err(|e| {
        InternalError::DataFolder(format!("Failed to create {}: {e}", path.display()))
    })?;

    Ok(path)
}

/// `<data dir>/seisflow[/path_name]`, or `$SEISFLOW_DATA_PATH[/path_name]` when set.
pub fn data_path(path_name: Option<&str>) -> PathBuf {
    let base = match std::env::var("SEISFLOW_DATA_PATH") {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => dirs_next::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("seisflow"),
    };

    match path_name {
        Some(path_name) => base.join(path_name),
        None => base,
    }
}
