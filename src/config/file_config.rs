use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub uploads_dir: Option<String>,
    pub sweep_interval_hours: Option<u64>,

    // Feature configs
    pub pipeline: Option<PipelineConfig>,
    pub download_cache: Option<DownloadCacheConfig>,
    pub object_store: Option<ObjectStoreConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue_capacity: Option<usize>,
    pub worker_count: Option<usize>,
    pub audio_max_duration_min: Option<u64>,
    pub audio_max_extract_size_mb: Option<u64>,
    pub transcode_timeout_sec: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct DownloadCacheConfig {
    pub ttl_sec: Option<u64>,
    pub budget_mb: Option<u64>,
    pub max_file_size_mb: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ObjectStoreConfig {
    /// S3-compatible gateway URL. When unset, derived assets go to a local
    /// directory instead.
    pub url: Option<String>,
    pub bucket: Option<String>,
    pub timeout_sec: Option<u64>,
    pub dir: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
