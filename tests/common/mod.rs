//! Shared fixture wiring the full service stack against temp directories.

use fileshare_server::download::{DownloadService, DownloadSettings};
use fileshare_server::metadata::{ArchiveExtractor, ExtractorRegistry, MetadataPipeline};
use fileshare_server::store::{FileStore, SqliteFileStore};
use fileshare_server::sweep::ReconciliationSweep;
use fileshare_server::upload::UploadService;
use std::sync::Arc;
use tempfile::TempDir;

pub struct TestEnv {
    pub store: Arc<dyn FileStore>,
    pub uploads: UploadService,
    pub pipeline: Arc<MetadataPipeline>,
    dir: TempDir,
}

impl TestEnv {
    /// Stack with the archive extractor registered; audio and image
    /// extraction need ffmpeg and are covered by their own unit tests.
    pub fn new() -> Self {
        let store: Arc<dyn FileStore> = Arc::new(SqliteFileStore::in_memory().unwrap());
        let registry = ExtractorRegistry::new().register(Arc::new(ArchiveExtractor::new(
            store.clone(),
        )));
        let pipeline = Arc::new(MetadataPipeline::start(Arc::new(registry), 16, 2));

        let dir = TempDir::new().unwrap();
        let uploads = UploadService::new(
            store.clone(),
            pipeline.clone(),
            dir.path().join("Uploads"),
        );

        Self {
            store,
            uploads,
            pipeline,
            dir,
        }
    }

    pub fn uploads_root(&self) -> std::path::PathBuf {
        self.dir.path().join("Uploads")
    }

    pub fn downloads(&self) -> DownloadService {
        self.downloads_with(DownloadSettings::default())
    }

    pub fn downloads_with(&self, settings: DownloadSettings) -> DownloadService {
        DownloadService::new(self.store.clone(), self.uploads_root(), settings)
    }

    pub fn sweep(&self) -> ReconciliationSweep {
        ReconciliationSweep::new(self.store.clone(), self.uploads_root())
    }
}

/// A small zip archive with the given entries, as raw bytes.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    use std::io::Write;

    let mut cursor = std::io::Cursor::new(Vec::new());
    let mut writer = zip::ZipWriter::new(&mut cursor);
    for (name, content) in entries {
        writer
            .start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap();
    cursor.into_inner()
}

#[allow(dead_code)]
pub fn file_on_disk(env: &TestEnv, record: &fileshare_server::store::FileRecord) -> bool {
    record.disk_location(&env.uploads_root()).exists()
}
