use crate::media::{self, MediaInfo};
use crate::metadata::{ExtractOutcome, MetadataExtractor};
use crate::object_store::ObjectStore;
use crate::store::{content_type_for, AudioMetadata, FileKind, FileRecord, FileStore};
use anyhow::{bail, Context};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const ALLOWED_TAGS: &[&str] = &["title", "artist", "album", "album_artist"];

#[derive(Debug, Clone)]
pub struct AudioExtractorSettings {
    /// Files longer than this are rejected as not worth previewing.
    pub max_duration: Duration,
    /// Files larger than this skip extraction entirely.
    pub max_extract_size: u64,
    pub transcode_timeout: Duration,
}

impl Default for AudioExtractorSettings {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(45 * 60),
            max_extract_size: 250 * 1024 * 1024,
            transcode_timeout: Duration::from_secs(120),
        }
    }
}

/// Extracts tag metadata from audio files and derives a low-bitrate preview
/// plus, when present, the embedded cover art.
pub struct AudioExtractor {
    store: Arc<dyn FileStore>,
    objects: Arc<dyn ObjectStore>,
    settings: AudioExtractorSettings,
}

impl AudioExtractor {
    pub fn new(
        store: Arc<dyn FileStore>,
        objects: Arc<dyn ObjectStore>,
        settings: AudioExtractorSettings,
    ) -> Self {
        Self {
            store,
            objects,
            settings,
        }
    }

    /// Object key of a file's audio preview.
    pub fn preview_key(record: &FileRecord) -> String {
        format!("{}_prev.m4a", record.id.simple())
    }

    /// Object key of a file's cover art.
    pub fn cover_key(record: &FileRecord) -> String {
        format!("{}_cover.webp", record.id.simple())
    }

    async fn upload_preview(&self, record: &FileRecord, path: &Path) -> anyhow::Result<()> {
        let temp = temp_path(record, "m4a");
        let result = self.transcode_and_upload_preview(record, path, &temp).await;
        let _ = tokio::fs::remove_file(&temp).await;
        result
    }

    async fn transcode_and_upload_preview(
        &self,
        record: &FileRecord,
        path: &Path,
        temp: &Path,
    ) -> anyhow::Result<()> {
        media::transcode_audio_preview(path, temp, self.settings.transcode_timeout)
            .await
            .context("Preview transcode failed")?;

        let preview_size = tokio::fs::metadata(temp).await?.len();
        let source_size = tokio::fs::metadata(path).await?.len();
        let key = Self::preview_key(record);

        // Low-bitrate sources can re-encode to something larger than the
        // original; serve the original bytes as the preview in that case.
        if preview_size < source_size {
            self.objects.put_file(&key, temp, "audio/mp4").await?;
        } else {
            self.objects
                .put_file(&key, path, content_type_for(&record.name))
                .await?;
        }
        Ok(())
    }

    async fn upload_cover(&self, record: &FileRecord, path: &Path) -> anyhow::Result<()> {
        let temp = temp_path(record, "webp");
        let result = async {
            media::extract_cover_art(path, &temp, self.settings.transcode_timeout)
                .await
                .context("Cover extraction failed")?;
            self.objects
                .put_file(&Self::cover_key(record), &temp, "image/webp")
                .await
        }
        .await;
        let _ = tokio::fs::remove_file(&temp).await;
        result
    }
}

fn temp_path(record: &FileRecord, extension: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}.{}", record.id.simple(), extension))
}

/// Keep only the allow-listed tags; an empty artist falls back to the album
/// artist when one is present.
fn build_tag_metadata(info: &MediaInfo) -> AudioMetadata {
    let tag = |name: &str| -> String {
        debug_assert!(ALLOWED_TAGS.contains(&name));
        info.tags.get(name).cloned().unwrap_or_default()
    };

    let mut artist = tag("artist");
    if artist.is_empty() {
        artist = tag("album_artist");
    }

    AudioMetadata {
        title: tag("title"),
        album: tag("album"),
        artist,
        attached_pic: info.has_attached_pic,
    }
}

#[async_trait]
impl MetadataExtractor for AudioExtractor {
    fn kind(&self) -> FileKind {
        FileKind::Audio
    }

    async fn extract(&self, record: &FileRecord, path: &Path) -> anyhow::Result<ExtractOutcome> {
        let Some(hash) = record.hash else {
            bail!("File {} has no content hash", record.id);
        };
        if self.store.get_audio_metadata(hash)?.is_some() {
            return Ok(ExtractOutcome::Skipped("already extracted"));
        }

        let source_size = tokio::fs::metadata(path).await?.len();
        if source_size > self.settings.max_extract_size {
            return Ok(ExtractOutcome::Skipped("file too large"));
        }

        let info = media::probe_media(path, self.settings.transcode_timeout).await?;
        if info.error_count > 0 {
            debug!(file = %record.id, errors = info.error_count, "Rejecting undecodable audio");
            return Ok(ExtractOutcome::Skipped("decode errors"));
        }
        if info.duration_ms > self.settings.max_duration.as_millis() as i64 {
            return Ok(ExtractOutcome::Skipped("duration over limit"));
        }

        self.upload_preview(record, path).await?;

        if info.has_attached_pic {
            // Tag metadata is still worth keeping when only the cover fails.
            if let Err(e) = self.upload_cover(record, path).await {
                warn!(file = %record.id, "Failed to extract cover art: {e:#}");
            }
        }

        self.store.put_audio_metadata(hash, &build_tag_metadata(&info))?;
        Ok(ExtractOutcome::Extracted)
    }
}
