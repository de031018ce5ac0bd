use crate::media;
use crate::metadata::{ExtractOutcome, MetadataExtractor};
use crate::object_store::ObjectStore;
use crate::store::{FileKind, FileRecord, FileStore, ImageMetadata};
use anyhow::{bail, Context};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Derives a webp preview for uploaded images and records its size.
pub struct ImageExtractor {
    store: Arc<dyn FileStore>,
    objects: Arc<dyn ObjectStore>,
    transcode_timeout: Duration,
}

impl ImageExtractor {
    pub fn new(
        store: Arc<dyn FileStore>,
        objects: Arc<dyn ObjectStore>,
        transcode_timeout: Duration,
    ) -> Self {
        Self {
            store,
            objects,
            transcode_timeout,
        }
    }

    /// Object key of a file's image preview.
    pub fn preview_key(record: &FileRecord) -> String {
        format!("{}_prev.webp", record.id.simple())
    }
}

#[async_trait]
impl MetadataExtractor for ImageExtractor {
    fn kind(&self) -> FileKind {
        FileKind::Image
    }

    async fn extract(&self, record: &FileRecord, path: &Path) -> anyhow::Result<ExtractOutcome> {
        let Some(hash) = record.hash else {
            bail!("File {} has no content hash", record.id);
        };
        if self.store.get_image_metadata(hash)?.is_some() {
            return Ok(ExtractOutcome::Skipped("already extracted"));
        }

        let temp = std::env::temp_dir().join(format!("{}.webp", record.id.simple()));
        let result = async {
            media::transcode_image_preview(path, &temp, self.transcode_timeout)
                .await
                .context("Image preview transcode failed")?;
            let preview_size = tokio::fs::metadata(&temp).await?.len() as i64;
            self.objects
                .put_file(&Self::preview_key(record), &temp, "image/webp")
                .await?;
            Ok::<_, anyhow::Error>(preview_size)
        }
        .await;
        let _ = tokio::fs::remove_file(&temp).await;
        let preview_size = result?;

        self.store.put_image_metadata(hash, &ImageMetadata { preview_size })?;
        Ok(ExtractOutcome::Extracted)
    }
}
