//! End-to-end tests for the upload / dedup / metadata / download flow.
//!
//! Everything here runs without ffmpeg: archives exercise the metadata
//! pipeline, audio and image transcoding are covered in unit tests.

mod common;

use common::{file_on_disk, zip_bytes, TestEnv};
use fileshare_server::download::{DownloadError, DownloadPayload};
use std::sync::Arc;
use std::time::Duration;

const CLIENT_IP: &str = "192.168.1.10";

async fn wait_for<F: Fn() -> bool>(condition: F, what: &str) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Timed out waiting for {what}");
}

#[tokio::test]
async fn test_upload_then_download_roundtrip() {
    let env = TestEnv::new();
    let batch = env.uploads.create_batch(CLIENT_IP).unwrap();
    let payload = b"some shared file".to_vec();

    let record = env
        .uploads
        .store_file(batch.id, "notes.bin", payload.len() as u64, CLIENT_IP, payload.as_slice())
        .await
        .unwrap();

    let downloads = env.downloads();
    let resolved = downloads.resolve(record.id, CLIENT_IP).await.unwrap();

    assert_eq!(resolved.file_name, "notes.bin");
    assert_eq!(resolved.content_type, "application/octet-stream");
    match resolved.payload {
        DownloadPayload::Cached(bytes) => assert_eq!(*bytes, payload),
        DownloadPayload::Stream { .. } => panic!("Small file should come from cache"),
    }
}

#[tokio::test]
async fn test_duplicate_uploads_share_bytes_and_metadata() {
    let env = TestEnv::new();
    let batch = env.uploads.create_batch(CLIENT_IP).unwrap();
    let payload = zip_bytes(&[("doc.txt", b"hello"), ("img/pic.raw", b"pixels")]);

    let first = env
        .uploads
        .store_file(batch.id, "bundle.zip", payload.len() as u64, CLIENT_IP, payload.as_slice())
        .await
        .unwrap();
    let second = env
        .uploads
        .store_file(batch.id, "again.zip", payload.len() as u64, CLIENT_IP, payload.as_slice())
        .await
        .unwrap();

    assert!(!first.is_alias);
    assert!(second.is_alias);
    assert!(file_on_disk(&env, &first));
    assert!(!file_on_disk(&env, &second));

    // Metadata is keyed by hash, so the alias sees it too.
    let hash = second.hash.unwrap();
    wait_for(
        || env.store.get_archive_metadata(hash).unwrap().is_some(),
        "archive metadata",
    )
    .await;
    let meta = env.store.get_archive_metadata(hash).unwrap().unwrap();
    assert_eq!(meta.entries.len(), 2);
    assert_eq!(meta.entries[0].name, "doc.txt");
    assert!(!meta.password);

    // The alias downloads the canonical bytes under its own name.
    let downloads = env.downloads();
    let resolved = downloads.resolve(second.id, CLIENT_IP).await.unwrap();
    assert_eq!(resolved.file_name, "again.zip");
    match resolved.payload {
        DownloadPayload::Cached(bytes) => assert_eq!(*bytes, payload),
        DownloadPayload::Stream { .. } => panic!("Small file should come from cache"),
    }
}

#[tokio::test]
async fn test_concurrent_identical_uploads_yield_one_canonical() {
    let env = TestEnv::new();
    let batch = env.uploads.create_batch(CLIENT_IP).unwrap();
    let payload = Arc::new(vec![42u8; 4096]);

    let uploads_root = env.uploads_root();
    let store = env.store.clone();
    let uploads = Arc::new(env.uploads);
    let mut handles = Vec::new();
    for i in 0..10 {
        let uploads = uploads.clone();
        let payload = payload.clone();
        let batch_id = batch.id;
        handles.push(tokio::spawn(async move {
            uploads
                .store_file(
                    batch_id,
                    &format!("copy{i}.bin"),
                    payload.len() as u64,
                    CLIENT_IP,
                    payload.as_slice(),
                )
                .await
                .unwrap()
        }));
    }

    let mut canonical = 0;
    let mut aliases = 0;
    for handle in handles {
        let record = handle.await.unwrap();
        if record.is_alias {
            aliases += 1;
        } else {
            canonical += 1;
        }
    }
    assert_eq!(canonical, 1);
    assert_eq!(aliases, 9);

    // Exactly one physical file remains.
    let on_disk: usize = store
        .list_all_files()
        .unwrap()
        .iter()
        .filter(|r| r.disk_location(&uploads_root).exists())
        .count();
    assert_eq!(on_disk, 1);
}

#[tokio::test]
async fn test_download_of_missing_bytes_reports_inconsistency() {
    let env = TestEnv::new();
    let batch = env.uploads.create_batch(CLIENT_IP).unwrap();
    let record = env
        .uploads
        .store_file(batch.id, "gone.bin", 5, CLIENT_IP, b"bytes".as_slice())
        .await
        .unwrap();
    std::fs::remove_file(record.disk_location(&env.uploads_root())).unwrap();

    let downloads = env.downloads();
    let result = downloads.resolve(record.id, CLIENT_IP).await;
    assert!(matches!(result, Err(DownloadError::Inconsistent(_))));
}

#[tokio::test]
async fn test_sweep_repairs_crashed_state() {
    let env = TestEnv::new();
    let batch = env.uploads.create_batch(CLIENT_IP).unwrap();
    let kept = env
        .uploads
        .store_file(batch.id, "keep.bin", 4, CLIENT_IP, b"keep".as_slice())
        .await
        .unwrap();

    // Orphaned bytes without a record, plus a drifted batch count.
    let day_dir = env.uploads_root().join("01-01-25");
    std::fs::create_dir_all(&day_dir).unwrap();
    let orphan = day_dir.join(format!("{}.bin", uuid::Uuid::now_v7().simple()));
    std::fs::write(&orphan, b"leftover").unwrap();
    env.store.set_files_count(batch.id, 9).unwrap();

    let report = env.sweep().run().await.unwrap();

    assert_eq!(report.orphan_files_deleted, 1);
    assert_eq!(report.batch_counts_repaired, 1);
    assert!(!orphan.exists());
    assert!(file_on_disk(&env, &kept));
    assert_eq!(
        env.store.get_upload(batch.id).unwrap().unwrap().files_count,
        1
    );
}

#[tokio::test]
async fn test_pipeline_shutdown_finishes_queued_work() {
    let env = TestEnv::new();
    let batch = env.uploads.create_batch(CLIENT_IP).unwrap();
    let payload = zip_bytes(&[("one.txt", b"1")]);

    let record = env
        .uploads
        .store_file(batch.id, "bundle.zip", payload.len() as u64, CLIENT_IP, payload.as_slice())
        .await
        .unwrap();

    env.pipeline.shutdown().await;

    // Work accepted before shutdown was drained, not dropped.
    let meta = env
        .store
        .get_archive_metadata(record.hash.unwrap())
        .unwrap();
    assert!(meta.is_some());

    // New uploads still succeed; only the extraction is skipped.
    let late = env
        .uploads
        .store_file(batch.id, "late.bin", 4, CLIENT_IP, b"late".as_slice())
        .await
        .unwrap();
    assert!(file_on_disk(&env, &late));
}

#[tokio::test]
async fn test_deleting_all_files_removes_batch() {
    let env = TestEnv::new();
    let batch = env.uploads.create_batch(CLIENT_IP).unwrap();
    let a = env
        .uploads
        .store_file(batch.id, "a.bin", 1, CLIENT_IP, b"a".as_slice())
        .await
        .unwrap();
    let b = env
        .uploads
        .store_file(batch.id, "b.bin", 1, CLIENT_IP, b"b".as_slice())
        .await
        .unwrap();

    env.uploads.delete_file(a.id).await.unwrap();
    assert!(env.store.get_upload(batch.id).unwrap().is_some());

    env.uploads.delete_file(b.id).await.unwrap();
    assert!(env.store.get_upload(batch.id).unwrap().is_none());
}
