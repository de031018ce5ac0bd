use crate::store::models::{
    ArchiveEntry, ArchiveMetadata, AudioMetadata, ContentHash, FileKind, FileRecord, FileStatus,
    ImageMetadata, UploadBatch,
};
use crate::store::schema::SCHEMA_SQL;
use anyhow::{anyhow, Context};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Result of resolving a finalized upload against existing content.
#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    /// First upload of this content; the record owns the bytes.
    Canonical(FileRecord),
    /// Content already present; the record became an alias and its
    /// just-written bytes at `freed_path` are redundant.
    Alias {
        record: FileRecord,
        canonical: FileRecord,
        freed_path: Option<String>,
    },
    /// The record was already finalized; nothing changed.
    AlreadyFinalized(FileRecord),
}

/// Result of deleting a file record.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    /// No other record shares this content; the physical bytes at this
    /// path should be removed.
    RemoveBytes(Option<String>),
    /// Other records still reference the same content hash.
    BytesRetained,
}

#[cfg_attr(feature = "mock", mockall::automock)]
pub trait FileStore: Send + Sync {
    fn create_upload(&self, batch: &UploadBatch) -> anyhow::Result<()>;
    fn get_upload(&self, id: Uuid) -> anyhow::Result<Option<UploadBatch>>;
    fn list_uploads(&self) -> anyhow::Result<Vec<UploadBatch>>;
    fn set_files_count(&self, id: Uuid, count: i64) -> anyhow::Result<()>;
    /// Adds `delta` to the batch's file count and returns the new value.
    fn adjust_files_count(&self, id: Uuid, delta: i64) -> anyhow::Result<i64>;
    fn delete_upload(&self, id: Uuid) -> anyhow::Result<()>;

    fn create_file(&self, record: &FileRecord) -> anyhow::Result<()>;
    fn get_file(&self, id: Uuid) -> anyhow::Result<Option<FileRecord>>;
    fn get_canonical_by_hash(&self, hash: ContentHash) -> anyhow::Result<Option<FileRecord>>;
    fn list_files_for_upload(&self, upload_id: Uuid) -> anyhow::Result<Vec<FileRecord>>;
    fn count_files_for_upload(&self, upload_id: Uuid) -> anyhow::Result<i64>;
    fn list_all_files(&self) -> anyhow::Result<Vec<FileRecord>>;
    fn any_file_at_path(&self, disk_path: &str) -> anyhow::Result<bool>;

    /// Resolves dedup for a freshly written upload in one transaction:
    /// re-checks for an existing canonical record with the same hash at
    /// commit time and marks this record canonical or alias accordingly.
    /// Returns `None` when no record with this id exists.
    fn finalize_file(
        &self,
        id: Uuid,
        hash: ContentHash,
    ) -> anyhow::Result<Option<FinalizeOutcome>>;

    /// Removes a file record. Returns `None` when no record exists.
    fn delete_file(&self, id: Uuid) -> anyhow::Result<Option<DeleteOutcome>>;

    fn put_audio_metadata(&self, hash: ContentHash, meta: &AudioMetadata) -> anyhow::Result<()>;
    fn get_audio_metadata(&self, hash: ContentHash) -> anyhow::Result<Option<AudioMetadata>>;
    fn put_archive_metadata(&self, hash: ContentHash, meta: &ArchiveMetadata)
        -> anyhow::Result<()>;
    fn get_archive_metadata(&self, hash: ContentHash) -> anyhow::Result<Option<ArchiveMetadata>>;
    fn put_image_metadata(&self, hash: ContentHash, meta: &ImageMetadata) -> anyhow::Result<()>;
    fn get_image_metadata(&self, hash: ContentHash) -> anyhow::Result<Option<ImageMetadata>>;

    /// Drops every row from every table. Used by the reconciliation sweep
    /// when the uploads directory turns out to be empty.
    fn purge_all(&self) -> anyhow::Result<()>;
}

pub struct SqliteFileStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteFileStore {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        let connection = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at {:?}", db_path))?;
        connection.pragma_update(None, "journal_mode", "WAL")?;
        connection.pragma_update(None, "synchronous", "NORMAL")?;
        Self::from_connection(connection)
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(connection: Connection) -> anyhow::Result<Self> {
        connection
            .execute_batch(SCHEMA_SQL)
            .context("Failed to initialize schema")?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Connection>> {
        self.connection
            .lock()
            .map_err(|_| anyhow!("Database connection lock poisoned"))
    }
}

fn row_to_upload(row: &Row<'_>) -> rusqlite::Result<UploadBatch> {
    let id: String = row.get("id")?;
    Ok(UploadBatch {
        id: parse_uuid(&id)?,
        created_at: row.get("created_at")?,
        origin_ip: row.get("origin_ip")?,
        files_count: row.get("files_count")?,
    })
}

fn row_to_file(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    let id: String = row.get("id")?;
    let upload_id: String = row.get("upload_id")?;
    let kind: String = row.get("kind")?;
    let status: String = row.get("status")?;
    let hash: Option<Vec<u8>> = row.get("hash")?;
    Ok(FileRecord {
        id: parse_uuid(&id)?,
        upload_id: parse_uuid(&upload_id)?,
        name: row.get("name")?,
        size: row.get("size")?,
        kind: FileKind::parse(&kind).ok_or(rusqlite::Error::InvalidQuery)?,
        status: FileStatus::parse(&status).ok_or(rusqlite::Error::InvalidQuery)?,
        created_at: row.get("created_at")?,
        hash: hash.as_deref().and_then(ContentHash::from_bytes),
        is_alias: row.get("is_alias")?,
        origin_ip: row.get("origin_ip")?,
        disk_path: row.get("disk_path")?,
    })
}

fn parse_uuid(s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|_| rusqlite::Error::InvalidQuery)
}

const FILE_COLUMNS: &str =
    "id, upload_id, name, size, kind, status, created_at, hash, is_alias, origin_ip, disk_path";

impl FileStore for SqliteFileStore {
    fn create_upload(&self, batch: &UploadBatch) -> anyhow::Result<()> {
        let connection = self.lock()?;
        connection
            .prepare_cached(
                "INSERT INTO uploads (id, created_at, origin_ip, files_count)
                 VALUES (?1, ?2, ?3, ?4)",
            )?
            .execute(params![
                batch.id.simple().to_string(),
                batch.created_at,
                batch.origin_ip,
                batch.files_count,
            ])?;
        Ok(())
    }

    fn get_upload(&self, id: Uuid) -> anyhow::Result<Option<UploadBatch>> {
        let connection = self.lock()?;
        let batch = connection
            .prepare_cached(
                "SELECT id, created_at, origin_ip, files_count FROM uploads WHERE id = ?1",
            )?
            .query_row(params![id.simple().to_string()], row_to_upload)
            .optional()?;
        Ok(batch)
    }

    fn list_uploads(&self) -> anyhow::Result<Vec<UploadBatch>> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare_cached("SELECT id, created_at, origin_ip, files_count FROM uploads")?;
        let batches = statement
            .query_map([], row_to_upload)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(batches)
    }

    fn set_files_count(&self, id: Uuid, count: i64) -> anyhow::Result<()> {
        let connection = self.lock()?;
        connection
            .prepare_cached("UPDATE uploads SET files_count = ?2 WHERE id = ?1")?
            .execute(params![id.simple().to_string(), count])?;
        Ok(())
    }

    fn adjust_files_count(&self, id: Uuid, delta: i64) -> anyhow::Result<i64> {
        let connection = self.lock()?;
        connection
            .prepare_cached("UPDATE uploads SET files_count = files_count + ?2 WHERE id = ?1")?
            .execute(params![id.simple().to_string(), delta])?;
        let count = connection
            .prepare_cached("SELECT files_count FROM uploads WHERE id = ?1")?
            .query_row(params![id.simple().to_string()], |row| row.get(0))
            .optional()?
            .unwrap_or(0);
        Ok(count)
    }

    fn delete_upload(&self, id: Uuid) -> anyhow::Result<()> {
        let connection = self.lock()?;
        connection
            .prepare_cached("DELETE FROM uploads WHERE id = ?1")?
            .execute(params![id.simple().to_string()])?;
        Ok(())
    }

    fn create_file(&self, record: &FileRecord) -> anyhow::Result<()> {
        let connection = self.lock()?;
        connection
            .prepare_cached(&format!(
                "INSERT INTO files ({FILE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ))?
            .execute(params![
                record.id.simple().to_string(),
                record.upload_id.simple().to_string(),
                record.name,
                record.size,
                record.kind.as_str(),
                record.status.as_str(),
                record.created_at,
                record.hash.map(|h| h.to_bytes().to_vec()),
                record.is_alias,
                record.origin_ip,
                record.disk_path,
            ])?;
        Ok(())
    }

    fn get_file(&self, id: Uuid) -> anyhow::Result<Option<FileRecord>> {
        let connection = self.lock()?;
        let record = connection
            .prepare_cached(&format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1"))?
            .query_row(params![id.simple().to_string()], row_to_file)
            .optional()?;
        Ok(record)
    }

    fn get_canonical_by_hash(&self, hash: ContentHash) -> anyhow::Result<Option<FileRecord>> {
        let connection = self.lock()?;
        let record = connection
            .prepare_cached(&format!(
                "SELECT {FILE_COLUMNS} FROM files
                 WHERE hash = ?1 AND is_alias = 0 AND status = 'uploaded'"
            ))?
            .query_row(params![hash.to_bytes().to_vec()], row_to_file)
            .optional()?;
        Ok(record)
    }

    fn list_files_for_upload(&self, upload_id: Uuid) -> anyhow::Result<Vec<FileRecord>> {
        let connection = self.lock()?;
        let mut statement = connection.prepare_cached(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE upload_id = ?1 ORDER BY created_at"
        ))?;
        let records = statement
            .query_map(params![upload_id.simple().to_string()], row_to_file)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn count_files_for_upload(&self, upload_id: Uuid) -> anyhow::Result<i64> {
        let connection = self.lock()?;
        let count = connection
            .prepare_cached("SELECT COUNT(*) FROM files WHERE upload_id = ?1")?
            .query_row(params![upload_id.simple().to_string()], |row| row.get(0))?;
        Ok(count)
    }

    fn list_all_files(&self) -> anyhow::Result<Vec<FileRecord>> {
        let connection = self.lock()?;
        let mut statement =
            connection.prepare_cached(&format!("SELECT {FILE_COLUMNS} FROM files"))?;
        let records = statement
            .query_map([], row_to_file)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn any_file_at_path(&self, disk_path: &str) -> anyhow::Result<bool> {
        let connection = self.lock()?;
        let found: Option<i64> = connection
            .prepare_cached("SELECT 1 FROM files WHERE disk_path = ?1 LIMIT 1")?
            .query_row(params![disk_path], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    fn finalize_file(
        &self,
        id: Uuid,
        hash: ContentHash,
    ) -> anyhow::Result<Option<FinalizeOutcome>> {
        let mut connection = self.lock()?;
        let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let record = tx
            .prepare_cached(&format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1"))?
            .query_row(params![id.simple().to_string()], row_to_file)
            .optional()?;
        let Some(mut record) = record else {
            return Ok(None);
        };
        if record.status == FileStatus::Uploaded {
            tx.commit()?;
            return Ok(Some(FinalizeOutcome::AlreadyFinalized(record)));
        }

        let canonical = tx
            .prepare_cached(&format!(
                "SELECT {FILE_COLUMNS} FROM files
                 WHERE hash = ?1 AND is_alias = 0 AND status = 'uploaded' AND id != ?2"
            ))?
            .query_row(
                params![hash.to_bytes().to_vec(), id.simple().to_string()],
                row_to_file,
            )
            .optional()?;

        let outcome = match canonical {
            None => {
                tx.prepare_cached(
                    "UPDATE files SET status = 'uploaded', hash = ?2, is_alias = 0 WHERE id = ?1",
                )?
                .execute(params![id.simple().to_string(), hash.to_bytes().to_vec()])?;
                record.status = FileStatus::Uploaded;
                record.hash = Some(hash);
                FinalizeOutcome::Canonical(record)
            }
            Some(canonical) => {
                tx.prepare_cached(
                    "UPDATE files
                     SET status = 'uploaded', hash = ?2, is_alias = 1, disk_path = NULL
                     WHERE id = ?1",
                )?
                .execute(params![id.simple().to_string(), hash.to_bytes().to_vec()])?;
                let freed_path = record.disk_path.take();
                record.status = FileStatus::Uploaded;
                record.hash = Some(hash);
                record.is_alias = true;
                FinalizeOutcome::Alias {
                    record,
                    canonical,
                    freed_path,
                }
            }
        };

        tx.commit()?;
        Ok(Some(outcome))
    }

    fn delete_file(&self, id: Uuid) -> anyhow::Result<Option<DeleteOutcome>> {
        let mut connection = self.lock()?;
        let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let record = tx
            .prepare_cached(&format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1"))?
            .query_row(params![id.simple().to_string()], row_to_file)
            .optional()?;
        let Some(record) = record else {
            return Ok(None);
        };

        let shared: i64 = match record.hash {
            Some(hash) => tx
                .prepare_cached("SELECT COUNT(*) FROM files WHERE hash = ?1 AND id != ?2")?
                .query_row(
                    params![hash.to_bytes().to_vec(), id.simple().to_string()],
                    |row| row.get(0),
                )?,
            None => 0,
        };

        tx.prepare_cached("DELETE FROM files WHERE id = ?1")?
            .execute(params![id.simple().to_string()])?;
        tx.commit()?;

        let outcome = if shared == 0 {
            DeleteOutcome::RemoveBytes(record.disk_path)
        } else {
            DeleteOutcome::BytesRetained
        };
        Ok(Some(outcome))
    }

    fn put_audio_metadata(&self, hash: ContentHash, meta: &AudioMetadata) -> anyhow::Result<()> {
        let connection = self.lock()?;
        connection
            .prepare_cached(
                "INSERT OR IGNORE INTO audio_metadata (hash, title, album, artist, attached_pic)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?
            .execute(params![
                hash.to_bytes().to_vec(),
                meta.title,
                meta.album,
                meta.artist,
                meta.attached_pic,
            ])?;
        Ok(())
    }

    fn get_audio_metadata(&self, hash: ContentHash) -> anyhow::Result<Option<AudioMetadata>> {
        let connection = self.lock()?;
        let meta = connection
            .prepare_cached(
                "SELECT title, album, artist, attached_pic FROM audio_metadata WHERE hash = ?1",
            )?
            .query_row(params![hash.to_bytes().to_vec()], |row| {
                Ok(AudioMetadata {
                    title: row.get("title")?,
                    album: row.get("album")?,
                    artist: row.get("artist")?,
                    attached_pic: row.get("attached_pic")?,
                })
            })
            .optional()?;
        Ok(meta)
    }

    fn put_archive_metadata(
        &self,
        hash: ContentHash,
        meta: &ArchiveMetadata,
    ) -> anyhow::Result<()> {
        let entries = serde_json::to_string(&meta.entries)?;
        let connection = self.lock()?;
        connection
            .prepare_cached(
                "INSERT OR IGNORE INTO archive_metadata (hash, entries, password)
                 VALUES (?1, ?2, ?3)",
            )?
            .execute(params![hash.to_bytes().to_vec(), entries, meta.password])?;
        Ok(())
    }

    fn get_archive_metadata(&self, hash: ContentHash) -> anyhow::Result<Option<ArchiveMetadata>> {
        let connection = self.lock()?;
        let row = connection
            .prepare_cached("SELECT entries, password FROM archive_metadata WHERE hash = ?1")?
            .query_row(params![hash.to_bytes().to_vec()], |row| {
                let entries: String = row.get("entries")?;
                let password: bool = row.get("password")?;
                Ok((entries, password))
            })
            .optional()?;
        match row {
            None => Ok(None),
            Some((entries, password)) => {
                let entries: Vec<ArchiveEntry> =
                    serde_json::from_str(&entries).context("Malformed archive entries")?;
                Ok(Some(ArchiveMetadata { entries, password }))
            }
        }
    }

    fn put_image_metadata(&self, hash: ContentHash, meta: &ImageMetadata) -> anyhow::Result<()> {
        let connection = self.lock()?;
        connection
            .prepare_cached(
                "INSERT OR IGNORE INTO image_metadata (hash, preview_size) VALUES (?1, ?2)",
            )?
            .execute(params![hash.to_bytes().to_vec(), meta.preview_size])?;
        Ok(())
    }

    fn get_image_metadata(&self, hash: ContentHash) -> anyhow::Result<Option<ImageMetadata>> {
        let connection = self.lock()?;
        let meta = connection
            .prepare_cached("SELECT preview_size FROM image_metadata WHERE hash = ?1")?
            .query_row(params![hash.to_bytes().to_vec()], |row| {
                Ok(ImageMetadata {
                    preview_size: row.get("preview_size")?,
                })
            })
            .optional()?;
        Ok(meta)
    }

    fn purge_all(&self) -> anyhow::Result<()> {
        let mut connection = self.lock()?;
        let tx = connection.transaction()?;
        tx.execute_batch(
            "DELETE FROM audio_metadata;
             DELETE FROM archive_metadata;
             DELETE FROM image_metadata;
             DELETE FROM files;
             DELETE FROM uploads;",
        )?;
        tx.commit()?;
        Ok(())
    }
}
