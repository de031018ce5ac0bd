mod file_config;

pub use file_config::{DownloadCacheConfig, FileConfig, ObjectStoreConfig, PipelineConfig};

use crate::download::DownloadSettings;
use crate::metadata::AudioExtractorSettings;
use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub uploads_dir: Option<PathBuf>,
    pub sweep_interval_hours: Option<u64>,
    pub object_store_url: Option<String>,
    pub object_store_bucket: Option<String>,
    pub objects_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub uploads_dir: PathBuf,
    /// `None` disables the periodic sweep; the startup sweep always runs.
    pub sweep_interval_hours: Option<u64>,

    pub pipeline: PipelineSettings,
    pub download: DownloadSettings,
    pub object_store: ObjectStoreSettings,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    /// `None` means one worker per CPU core.
    pub worker_count: Option<usize>,
    pub audio: AudioExtractorSettings,
    pub transcode_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 250,
            worker_count: None,
            audio: AudioExtractorSettings::default(),
            transcode_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ObjectStoreSettings {
    Http {
        url: String,
        bucket: String,
        timeout_sec: u64,
    },
    Fs {
        dir: PathBuf,
    },
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;
        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let uploads_dir = file
            .uploads_dir
            .map(PathBuf::from)
            .or_else(|| cli.uploads_dir.clone())
            .unwrap_or_else(|| db_dir.join("Uploads"));

        let sweep_interval_hours = file
            .sweep_interval_hours
            .or(cli.sweep_interval_hours)
            .filter(|hours| *hours > 0);

        let pipeline_file = file.pipeline.unwrap_or_default();
        let transcode_timeout = Duration::from_secs(pipeline_file.transcode_timeout_sec.unwrap_or(120));
        let pipeline = PipelineSettings {
            queue_capacity: pipeline_file.queue_capacity.unwrap_or(250),
            worker_count: pipeline_file.worker_count,
            audio: AudioExtractorSettings {
                max_duration: Duration::from_secs(
                    pipeline_file.audio_max_duration_min.unwrap_or(45) * 60,
                ),
                max_extract_size: pipeline_file.audio_max_extract_size_mb.unwrap_or(250)
                    * 1024
                    * 1024,
                transcode_timeout,
            },
            transcode_timeout,
        };

        let cache_file = file.download_cache.unwrap_or_default();
        let download = DownloadSettings {
            cache_ttl: Duration::from_secs(cache_file.ttl_sec.unwrap_or(120)),
            cache_budget_bytes: cache_file.budget_mb.unwrap_or(2048) * 1024 * 1024,
            cache_max_file_size: cache_file.max_file_size_mb.unwrap_or(15) * 1024 * 1024,
        };

        // [object_store] section takes precedence over CLI args; a URL from
        // either selects the HTTP backend.
        let store_file = file.object_store.unwrap_or_default();
        let url = store_file.url.or_else(|| cli.object_store_url.clone());
        let object_store = match url {
            Some(url) => ObjectStoreSettings::Http {
                url,
                bucket: store_file
                    .bucket
                    .or_else(|| cli.object_store_bucket.clone())
                    .unwrap_or_else(|| "fileshare".to_string()),
                timeout_sec: store_file.timeout_sec.unwrap_or(60),
            },
            None => ObjectStoreSettings::Fs {
                dir: store_file
                    .dir
                    .map(PathBuf::from)
                    .or_else(|| cli.objects_dir.clone())
                    .unwrap_or_else(|| db_dir.join("objects")),
            },
        };

        Ok(Self {
            db_dir,
            uploads_dir,
            sweep_interval_hours,
            pipeline,
            download,
            object_store,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_dir.join("fileshare.db")
    }
}
