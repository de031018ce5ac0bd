//! Download resolution: alias indirection, small-file caching and
//! stampede-protected reads.

mod cache;
mod counting;
mod keyed_lock;

pub use cache::ByteCache;
pub use counting::CountingReader;
pub use keyed_lock::{KeyedGuard, KeyedLocks};

use crate::metrics;
use crate::store::{content_type_for, FileRecord, FileStatus, FileStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("No file with id {0}")]
    NotFound(Uuid),
    #[error("File {0} is still uploading")]
    NotReady(Uuid),
    /// The database and the disk disagree; requires reconciliation, not a
    /// retry.
    #[error("Inconsistent state: {0}")]
    Inconsistent(String),
    #[error("Failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    /// Sliding expiry for cached downloads.
    pub cache_ttl: Duration,
    /// Total bytes the cache may hold.
    pub cache_budget_bytes: u64,
    /// Files larger than this stream from disk instead of being cached.
    pub cache_max_file_size: u64,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(120),
            cache_budget_bytes: 2 * 1024 * 1024 * 1024,
            cache_max_file_size: 15 * 1024 * 1024,
        }
    }
}

/// How the resolved bytes are delivered.
pub enum DownloadPayload {
    /// Whole file from the in-memory cache.
    Cached(Arc<Vec<u8>>),
    /// Streamed from disk with a size-tiered buffer.
    Stream {
        reader: CountingReader<tokio::fs::File>,
        buffer_size: usize,
    },
}

pub struct ResolvedDownload {
    pub payload: DownloadPayload,
    /// The requested record's own display name, even for aliases.
    pub file_name: String,
    pub content_type: &'static str,
    pub size: u64,
}

/// Resolves download requests. Aliases are followed to their canonical
/// record's bytes. Small files are served from an in-memory cache whose
/// misses are single-flighted per file, so concurrent requests for the same
/// content read the disk once.
pub struct DownloadService {
    store: Arc<dyn FileStore>,
    uploads_root: PathBuf,
    cache: ByteCache,
    locks: KeyedLocks<Uuid>,
    settings: DownloadSettings,
}

impl DownloadService {
    pub fn new(
        store: Arc<dyn FileStore>,
        uploads_root: PathBuf,
        settings: DownloadSettings,
    ) -> Self {
        let cache = ByteCache::new(settings.cache_ttl, settings.cache_budget_bytes);
        Self {
            store,
            uploads_root,
            cache,
            locks: KeyedLocks::new(),
            settings,
        }
    }

    pub async fn resolve(
        &self,
        id: Uuid,
        client_ip: &str,
    ) -> Result<ResolvedDownload, DownloadError> {
        let record = self
            .store
            .get_file(id)?
            .ok_or(DownloadError::NotFound(id))?;
        if record.status == FileStatus::Uploading {
            return Err(DownloadError::NotReady(id));
        }

        let canonical = self.canonical_for(&record)?;
        let disk_path = canonical.disk_path.as_ref().ok_or_else(|| {
            DownloadError::Inconsistent(format!("Canonical file {} has no disk path", canonical.id))
        })?;
        let location = self.uploads_root.join(disk_path);

        let size = match tokio::fs::metadata(&location).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DownloadError::Inconsistent(format!(
                    "Bytes missing on disk for uploaded file {}",
                    canonical.id
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let payload = if size > self.settings.cache_max_file_size {
            self.stream_payload(&location, size, client_ip).await?
        } else {
            self.cached_payload(canonical.id, &location, client_ip)
                .await?
        };

        Ok(ResolvedDownload {
            payload,
            file_name: record.name.clone(),
            content_type: content_type_for(&record.name),
            size,
        })
    }

    fn canonical_for(&self, record: &FileRecord) -> Result<FileRecord, DownloadError> {
        if !record.is_alias {
            return Ok(record.clone());
        }
        let hash = record.hash.ok_or_else(|| {
            DownloadError::Inconsistent(format!("Alias {} has no content hash", record.id))
        })?;
        self.store.get_canonical_by_hash(hash)?.ok_or_else(|| {
            DownloadError::Inconsistent(format!("Alias {} has no canonical file", record.id))
        })
    }

    async fn stream_payload(
        &self,
        location: &std::path::Path,
        size: u64,
        client_ip: &str,
    ) -> Result<DownloadPayload, DownloadError> {
        let file = match tokio::fs::File::open(location).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DownloadError::Inconsistent(format!(
                    "Bytes missing on disk at {}",
                    location.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let client_ip = client_ip.to_string();
        Ok(DownloadPayload::Stream {
            reader: CountingReader::new(file, move |n| {
                metrics::record_downloaded_bytes(&client_ip, n);
            }),
            buffer_size: crate::upload::buffer_size_for(size),
        })
    }

    async fn cached_payload(
        &self,
        canonical_id: Uuid,
        location: &std::path::Path,
        client_ip: &str,
    ) -> Result<DownloadPayload, DownloadError> {
        if let Some(bytes) = self.cache.get(canonical_id) {
            metrics::CACHE_HITS_TOTAL.inc();
            metrics::record_downloaded_bytes(client_ip, bytes.len() as u64);
            return Ok(DownloadPayload::Cached(bytes));
        }
        metrics::CACHE_MISSES_TOTAL.inc();

        let _guard = self.locks.acquire(canonical_id).await;
        // Another request may have populated the cache while we waited.
        if let Some(bytes) = self.cache.get(canonical_id) {
            metrics::CACHE_HITS_TOTAL.inc();
            metrics::record_downloaded_bytes(client_ip, bytes.len() as u64);
            return Ok(DownloadPayload::Cached(bytes));
        }

        let bytes = match tokio::fs::read(location).await {
            Ok(bytes) => Arc::new(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DownloadError::Inconsistent(format!(
                    "Bytes missing on disk at {}",
                    location.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        debug!(file = %canonical_id, size = bytes.len(), "Cached download");
        self.cache.insert(canonical_id, bytes.clone());
        metrics::record_downloaded_bytes(client_ip, bytes.len() as u64);
        Ok(DownloadPayload::Cached(bytes))
    }

    #[cfg(test)]
    fn cached_bytes(&self) -> u64 {
        self.cache.total_bytes()
    }
}
