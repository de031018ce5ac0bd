use crate::metrics;
use crate::store::{ContentHash, FileRecord, FileStore, FinalizeOutcome};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("No file with id {0}")]
    NotFound(Uuid),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// The finalized record, plus whether it just became the canonical copy of
/// its content. Only newly canonical files get metadata work enqueued.
#[derive(Debug, Clone)]
pub struct Finalized {
    pub record: FileRecord,
    pub newly_canonical: bool,
}

/// Decides, once the bytes of an upload are durably on disk, whether the
/// upload is the canonical copy of its content hash or an alias of an
/// existing one, and removes redundant bytes in the alias case.
///
/// The decision itself happens inside a single store transaction, so
/// concurrent finalizations of identical content always produce exactly one
/// canonical record.
pub struct DedupFinalizer {
    store: Arc<dyn FileStore>,
    uploads_root: PathBuf,
}

impl DedupFinalizer {
    pub fn new(store: Arc<dyn FileStore>, uploads_root: PathBuf) -> Self {
        Self {
            store,
            uploads_root,
        }
    }

    pub async fn finalize(&self, id: Uuid, hash: ContentHash) -> Result<Finalized, FinalizeError> {
        let outcome = self
            .store
            .finalize_file(id, hash)?
            .ok_or(FinalizeError::NotFound(id))?;

        match outcome {
            FinalizeOutcome::Canonical(record) => {
                metrics::record_dedup_resolution("canonical");
                debug!(file = %record.id, %hash, "Finalized as canonical");
                Ok(Finalized {
                    record,
                    newly_canonical: true,
                })
            }
            FinalizeOutcome::Alias {
                record,
                canonical,
                freed_path,
            } => {
                metrics::record_dedup_resolution("alias");
                if let Some(path) = freed_path {
                    let absolute = self.uploads_root.join(&path);
                    // The alias row is already committed; leftover bytes are
                    // also picked up by the reconciliation sweep.
                    if let Err(e) = tokio::fs::remove_file(&absolute).await {
                        warn!(path = %absolute.display(), "Failed to remove redundant bytes: {e}");
                    }
                }
                debug!(alias = %record.id, canonical = %canonical.id, %hash, "Deduplicated upload");
                Ok(Finalized {
                    record,
                    newly_canonical: false,
                })
            }
            FinalizeOutcome::AlreadyFinalized(record) => {
                metrics::record_dedup_resolution("repeat");
                Ok(Finalized {
                    record,
                    newly_canonical: false,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SqliteFileStore, UploadBatch};

    struct Fixture {
        store: Arc<dyn FileStore>,
        finalizer: DedupFinalizer,
        dir: tempfile::TempDir,
        batch: UploadBatch,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn FileStore> = Arc::new(SqliteFileStore::in_memory().unwrap());
        let batch = UploadBatch::new("127.0.0.1".into());
        store.create_upload(&batch).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let finalizer = DedupFinalizer::new(store.clone(), dir.path().to_path_buf());
        Fixture {
            store,
            finalizer,
            dir,
            batch,
        }
    }

    fn written_file(fixture: &Fixture, name: &str) -> FileRecord {
        let mut record =
            FileRecord::new(fixture.batch.id, name.to_string(), 100, "127.0.0.1".into());
        record.disk_path = Some(record.relative_disk_path());
        fixture.store.create_file(&record).unwrap();
        let location = record.disk_location(fixture.dir.path());
        std::fs::create_dir_all(location.parent().unwrap()).unwrap();
        std::fs::write(location, b"payload").unwrap();
        record
    }

    #[tokio::test]
    async fn test_first_upload_is_canonical_and_keeps_bytes() {
        let fixture = fixture();
        let record = written_file(&fixture, "track.mp3");

        let finalized = fixture
            .finalizer
            .finalize(record.id, ContentHash(1))
            .await
            .unwrap();

        assert!(finalized.newly_canonical);
        assert!(record.disk_location(fixture.dir.path()).exists());
    }

    #[tokio::test]
    async fn test_duplicate_upload_removes_redundant_bytes() {
        let fixture = fixture();
        let first = written_file(&fixture, "track.mp3");
        let second = written_file(&fixture, "copy.mp3");

        fixture
            .finalizer
            .finalize(first.id, ContentHash(1))
            .await
            .unwrap();
        let finalized = fixture
            .finalizer
            .finalize(second.id, ContentHash(1))
            .await
            .unwrap();

        assert!(!finalized.newly_canonical);
        assert!(finalized.record.is_alias);
        assert!(first.disk_location(fixture.dir.path()).exists());
        assert!(!second.disk_location(fixture.dir.path()).exists());
    }

    #[tokio::test]
    async fn test_repeated_finalize_does_not_reclaim_bytes() {
        let fixture = fixture();
        let record = written_file(&fixture, "track.mp3");

        fixture
            .finalizer
            .finalize(record.id, ContentHash(1))
            .await
            .unwrap();
        let again = fixture
            .finalizer
            .finalize(record.id, ContentHash(1))
            .await
            .unwrap();

        assert!(!again.newly_canonical);
        assert!(record.disk_location(fixture.dir.path()).exists());
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let fixture = fixture();
        let result = fixture.finalizer.finalize(Uuid::now_v7(), ContentHash(1)).await;
        assert!(matches!(result, Err(FinalizeError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_concurrent_finalize_yields_single_canonical() {
        let fixture = fixture();
        let records: Vec<FileRecord> = (0..8)
            .map(|i| written_file(&fixture, &format!("copy{i}.mp3")))
            .collect();

        let finalizer = Arc::new(fixture.finalizer);
        let mut handles = Vec::new();
        for record in &records {
            let finalizer = finalizer.clone();
            let id = record.id;
            handles.push(tokio::spawn(async move {
                finalizer.finalize(id, ContentHash(99)).await.unwrap()
            }));
        }

        let mut canonical_count = 0;
        for handle in handles {
            if handle.await.unwrap().newly_canonical {
                canonical_count += 1;
            }
        }
        assert_eq!(canonical_count, 1);

        let canonical = fixture
            .store
            .get_canonical_by_hash(ContentHash(99))
            .unwrap()
            .unwrap();
        assert!(canonical
            .disk_location(fixture.dir.path())
            .exists());
    }
}
