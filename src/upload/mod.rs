//! Upload ingestion: batches, streamed writes and dedup finalization.

mod finalizer;
mod hasher;

pub use finalizer::{DedupFinalizer, FinalizeError, Finalized};
pub use hasher::{buffer_size_for, write_and_hash, WrittenFile};

use crate::metadata::{MetadataPipeline, WorkItem};
use crate::metrics;
use crate::store::{FileKind, FileRecord, FileStore, UploadBatch};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("No upload batch with id {0}")]
    BatchNotFound(Uuid),
    #[error("Upload batch {0} is no longer accepting files")]
    BatchClosed(Uuid),
    #[error("No file with id {0}")]
    FileNotFound(Uuid),
    #[error("Failed to write upload: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl From<FinalizeError> for UploadError {
    fn from(e: FinalizeError) -> Self {
        match e {
            FinalizeError::NotFound(id) => UploadError::FileNotFound(id),
            FinalizeError::Store(e) => UploadError::Store(e),
        }
    }
}

/// Receives uploads: creates batches, streams file bytes to their
/// date-bucketed location while hashing them, resolves dedup and hands
/// canonical files to the metadata pipeline.
pub struct UploadService {
    store: Arc<dyn FileStore>,
    finalizer: DedupFinalizer,
    pipeline: Arc<MetadataPipeline>,
    uploads_root: PathBuf,
}

impl UploadService {
    pub fn new(
        store: Arc<dyn FileStore>,
        pipeline: Arc<MetadataPipeline>,
        uploads_root: PathBuf,
    ) -> Self {
        let finalizer = DedupFinalizer::new(store.clone(), uploads_root.clone());
        Self {
            store,
            finalizer,
            pipeline,
            uploads_root,
        }
    }

    /// Opens a new upload batch for a client.
    pub fn create_batch(&self, origin_ip: &str) -> Result<UploadBatch, UploadError> {
        let batch = UploadBatch::new(origin_ip.to_string());
        self.store.create_upload(&batch)?;
        info!(batch = %batch.id, origin_ip, "Opened upload batch");
        Ok(batch)
    }

    /// Streams one file into an open batch and finalizes it. Returns the
    /// finalized record, which may have become an alias of existing content.
    pub async fn store_file<R>(
        &self,
        batch_id: Uuid,
        name: &str,
        declared_size: u64,
        origin_ip: &str,
        reader: R,
    ) -> Result<FileRecord, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        let batch = self
            .store
            .get_upload(batch_id)?
            .ok_or(UploadError::BatchNotFound(batch_id))?;
        if !batch.can_add_files(origin_ip, Utc::now().timestamp()) {
            return Err(UploadError::BatchClosed(batch_id));
        }

        let mut record = FileRecord::new(
            batch_id,
            name.to_string(),
            declared_size as i64,
            origin_ip.to_string(),
        );
        record.disk_path = Some(record.relative_disk_path());
        self.store.create_file(&record)?;
        self.store.adjust_files_count(batch_id, 1)?;

        let location = record.disk_location(&self.uploads_root);
        let written = match write_and_hash(reader, &location, declared_size).await {
            Ok(written) => written,
            Err(e) => {
                // Unwind the record so the batch doesn't count a file that
                // never materialized.
                if let Err(unwind) = self.discard_record(&record) {
                    warn!(file = %record.id, "Failed to unwind aborted upload: {unwind:#}");
                }
                return Err(e.into());
            }
        };
        metrics::UPLOADED_BYTES_TOTAL.inc_by(written.bytes_written as f64);

        let finalized = self.finalizer.finalize(record.id, written.hash).await?;
        if finalized.newly_canonical && finalized.record.kind != FileKind::Unsupported {
            let item = WorkItem {
                record: finalized.record.clone(),
                path: location,
            };
            if self.pipeline.enqueue(item).await.is_err() {
                warn!(file = %finalized.record.id, "Metadata pipeline closed, skipping extraction");
            }
        }
        Ok(finalized.record)
    }

    /// Removes a file: its record, its bytes when no other record shares the
    /// content, and its batch when the batch becomes empty.
    pub async fn delete_file(&self, id: Uuid) -> Result<(), UploadError> {
        let record = self
            .store
            .get_file(id)?
            .ok_or(UploadError::FileNotFound(id))?;
        let outcome = self
            .store
            .delete_file(id)?
            .ok_or(UploadError::FileNotFound(id))?;

        if let crate::store::DeleteOutcome::RemoveBytes(Some(path)) = outcome {
            let absolute = self.uploads_root.join(&path);
            if let Err(e) = tokio::fs::remove_file(&absolute).await {
                warn!(path = %absolute.display(), "Failed to remove deleted file bytes: {e}");
            }
        }

        let remaining = self.store.adjust_files_count(record.upload_id, -1)?;
        if remaining <= 0 {
            self.store.delete_upload(record.upload_id)?;
            info!(batch = %record.upload_id, "Removed empty upload batch");
        }
        Ok(())
    }

    fn discard_record(&self, record: &FileRecord) -> anyhow::Result<()> {
        self.store.delete_file(record.id)?;
        let remaining = self.store.adjust_files_count(record.upload_id, -1)?;
        if remaining <= 0 {
            self.store.delete_upload(record.upload_id)?;
        }
        Ok(())
    }

    pub fn uploads_root(&self) -> &PathBuf {
        &self.uploads_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ExtractorRegistry;
    use crate::store::{FileStatus, SqliteFileStore};

    struct Fixture {
        store: Arc<dyn FileStore>,
        service: UploadService,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn FileStore> = Arc::new(SqliteFileStore::in_memory().unwrap());
        let pipeline = Arc::new(MetadataPipeline::start(
            Arc::new(ExtractorRegistry::new()),
            10,
            1,
        ));
        let dir = tempfile::tempdir().unwrap();
        let service = UploadService::new(store.clone(), pipeline, dir.path().to_path_buf());
        Fixture {
            store,
            service,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_store_file_in_batch() {
        let fixture = fixture();
        let batch = fixture.service.create_batch("10.0.0.1").unwrap();
        let payload = b"file content".to_vec();

        let record = fixture
            .service
            .store_file(batch.id, "notes.zip", payload.len() as u64, "10.0.0.1", payload.as_slice())
            .await
            .unwrap();

        assert_eq!(record.status, FileStatus::Uploaded);
        assert!(!record.is_alias);
        assert!(record.hash.is_some());
        assert!(record
            .disk_location(fixture.service.uploads_root())
            .exists());
        assert_eq!(
            fixture.store.get_upload(batch.id).unwrap().unwrap().files_count,
            1
        );
    }

    #[tokio::test]
    async fn test_unknown_batch() {
        let fixture = fixture();
        let result = fixture
            .service
            .store_file(Uuid::now_v7(), "a.bin", 1, "10.0.0.1", b"x".as_slice())
            .await;
        assert!(matches!(result, Err(UploadError::BatchNotFound(_))));
    }

    #[tokio::test]
    async fn test_batch_rejects_other_clients() {
        let fixture = fixture();
        let batch = fixture.service.create_batch("10.0.0.1").unwrap();

        let result = fixture
            .service
            .store_file(batch.id, "a.bin", 1, "10.0.0.2", b"x".as_slice())
            .await;
        assert!(matches!(result, Err(UploadError::BatchClosed(_))));
    }

    #[tokio::test]
    async fn test_identical_content_dedups_to_alias() {
        let fixture = fixture();
        let batch = fixture.service.create_batch("10.0.0.1").unwrap();
        let payload = b"identical bytes".to_vec();

        let first = fixture
            .service
            .store_file(batch.id, "one.mp3", payload.len() as u64, "10.0.0.1", payload.as_slice())
            .await
            .unwrap();
        let second = fixture
            .service
            .store_file(batch.id, "two.mp3", payload.len() as u64, "10.0.0.1", payload.as_slice())
            .await
            .unwrap();

        assert!(!first.is_alias);
        assert!(second.is_alias);
        assert_eq!(first.hash, second.hash);
        assert!(first.disk_location(fixture.service.uploads_root()).exists());
        assert!(!second
            .disk_location(fixture.service.uploads_root())
            .exists());
    }

    #[tokio::test]
    async fn test_delete_last_file_removes_batch() {
        let fixture = fixture();
        let batch = fixture.service.create_batch("10.0.0.1").unwrap();
        let record = fixture
            .service
            .store_file(batch.id, "one.bin", 4, "10.0.0.1", b"data".as_slice())
            .await
            .unwrap();
        let location = record.disk_location(fixture.service.uploads_root());
        assert!(location.exists());

        fixture.service.delete_file(record.id).await.unwrap();

        assert!(!location.exists());
        assert!(fixture.store.get_file(record.id).unwrap().is_none());
        assert!(fixture.store.get_upload(batch.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_alias_keeps_canonical_bytes() {
        let fixture = fixture();
        let batch = fixture.service.create_batch("10.0.0.1").unwrap();
        let payload = b"shared".to_vec();
        let first = fixture
            .service
            .store_file(batch.id, "one.bin", 6, "10.0.0.1", payload.as_slice())
            .await
            .unwrap();
        let second = fixture
            .service
            .store_file(batch.id, "two.bin", 6, "10.0.0.1", payload.as_slice())
            .await
            .unwrap();

        fixture.service.delete_file(second.id).await.unwrap();

        assert!(first.disk_location(fixture.service.uploads_root()).exists());
        assert!(fixture.store.get_file(first.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_finalize_is_idempotent_at_service_level() {
        let fixture = fixture();
        let batch = fixture.service.create_batch("10.0.0.1").unwrap();
        let record = fixture
            .service
            .store_file(batch.id, "one.bin", 4, "10.0.0.1", b"data".as_slice())
            .await
            .unwrap();
        let hash = record.hash.unwrap();

        // A retried completion must not flip the record or drop bytes.
        let finalizer =
            DedupFinalizer::new(fixture.store.clone(), fixture.service.uploads_root().clone());
        let again = finalizer.finalize(record.id, hash).await.unwrap();

        assert!(!again.newly_canonical);
        assert_eq!(again.record.id, record.id);
        assert!(record.disk_location(fixture.service.uploads_root()).exists());
    }

    #[tokio::test]
    async fn test_expired_batch_rejects_new_files() {
        let fixture = fixture();
        let batch = fixture.service.create_batch("10.0.0.1").unwrap();
        let now = Utc::now().timestamp();

        assert!(batch.can_add_files("10.0.0.1", now));
        assert!(!batch.can_add_files("10.0.0.1", now + crate::store::UPLOAD_WINDOW_SECS + 1));
    }
}
