mod models;
mod schema;
mod sqlite;

pub use models::{
    content_type_for, file_extension, ArchiveEntry, ArchiveMetadata, AudioMetadata, ContentHash,
    FileKind, FileRecord, FileStatus, ImageMetadata, UploadBatch, UPLOAD_WINDOW_SECS,
};
pub use sqlite::{DeleteOutcome, FileStore, FinalizeOutcome, SqliteFileStore};

#[cfg(feature = "mock")]
pub use sqlite::MockFileStore;
