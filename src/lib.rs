//! Fileshare Server Library
//!
//! Content-addressed file sharing: uploads are deduplicated by content
//! hash, metadata is extracted asynchronously per file kind, and downloads
//! are served through a stampede-protected in-memory cache. The hosting
//! layer wires these services to its transport of choice.

pub mod app;
pub mod config;
pub mod download;
pub mod media;
pub mod metadata;
pub mod metrics;
pub mod object_store;
pub mod store;
pub mod sweep;
pub mod upload;

// Re-export commonly used types for convenience
pub use app::App;
pub use config::{AppConfig, CliConfig, FileConfig};
pub use download::{DownloadError, DownloadService, ResolvedDownload};
pub use object_store::{FsObjectStore, HttpObjectStore, ObjectStore};
pub use store::{FileRecord, FileStore, SqliteFileStore, UploadBatch};
pub use sweep::ReconciliationSweep;
pub use upload::{UploadError, UploadService};
