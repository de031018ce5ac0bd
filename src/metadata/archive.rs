use crate::metadata::{ExtractOutcome, MetadataExtractor};
use crate::store::{ArchiveEntry, ArchiveMetadata, FileKind, FileRecord, FileStore};
use anyhow::{bail, Context};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Lists the entries of uploaded zip archives. Other archive formats are
/// stored as-is without a listing.
pub struct ArchiveExtractor {
    store: Arc<dyn FileStore>,
}

impl ArchiveExtractor {
    pub fn new(store: Arc<dyn FileStore>) -> Self {
        Self { store }
    }
}

/// Walk the archive's central directory. Entries that can't be opened
/// without a password mark the archive password-protected; their names and
/// sizes still come from the raw directory entry.
fn list_entries(path: &Path) -> anyhow::Result<ArchiveMetadata> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file).context("Failed to read zip archive")?;

    let mut meta = ArchiveMetadata::default();
    for index in 0..archive.len() {
        // The listed entry is owned before the fallback path takes its own
        // borrow of the archive.
        let listed = archive.by_index(index).map(|entry| ArchiveEntry {
            name: entry.name().to_string(),
            size: entry.size(),
        });
        match listed {
            Ok(entry) => meta.entries.push(entry),
            Err(_) => {
                meta.password = true;
                let entry = archive
                    .by_index_raw(index)
                    .context("Failed to read zip entry")?;
                meta.entries.push(ArchiveEntry {
                    name: entry.name().to_string(),
                    size: entry.size(),
                });
            }
        }
    }
    Ok(meta)
}

#[async_trait]
impl MetadataExtractor for ArchiveExtractor {
    fn kind(&self) -> FileKind {
        FileKind::Archive
    }

    async fn extract(&self, record: &FileRecord, path: &Path) -> anyhow::Result<ExtractOutcome> {
        let Some(hash) = record.hash else {
            bail!("File {} has no content hash", record.id);
        };
        if record.extension() != "zip" {
            return Ok(ExtractOutcome::Skipped("not a zip archive"));
        }
        if self.store.get_archive_metadata(hash)?.is_some() {
            return Ok(ExtractOutcome::Skipped("already extracted"));
        }

        let path = path.to_path_buf();
        let meta = tokio::task::spawn_blocking(move || list_entries(&path))
            .await
            .context("Archive listing task failed")??;

        debug!(
            file = %record.id,
            entries = meta.entries.len(),
            password = meta.password,
            "Listed archive"
        );
        self.store.put_archive_metadata(hash, &meta)?;
        Ok(ExtractOutcome::Extracted)
    }
}
