//! Data models for the file store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Window during which files may still be added to an upload batch.
pub const UPLOAD_WINDOW_SECS: i64 = 15 * 60;

/// 128-bit XXH3 content digest used as the deduplication key.
///
/// Fast and collision-resistant enough for dedup; not cryptographic.
/// Adversarial near-collisions are a documented limitation, not defended
/// against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(pub u128);

impl ContentHash {
    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(u128::from_be_bytes(arr)))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Top-level file type, derived from the file extension at upload time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Audio,
    Archive,
    Image,
    Unsupported,
}

const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "rar", "7z", "dmg"];
const AUDIO_EXTENSIONS: &[&str] = &[
    "wav", "flac", "mp3", "m4a", "opus", "ogg", "aac", "aif", "aiff",
];
const IMAGE_EXTENSIONS: &[&str] = &["png", "webp", "jpeg", "jpg"];

impl FileKind {
    /// Classify a file by its name's extension.
    pub fn from_name(name: &str) -> Self {
        let ext = file_extension(name);
        if ARCHIVE_EXTENSIONS.contains(&ext.as_str()) {
            FileKind::Archive
        } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            FileKind::Audio
        } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            FileKind::Image
        } else {
            FileKind::Unsupported
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Audio => "audio",
            FileKind::Archive => "archive",
            FileKind::Image => "image",
            FileKind::Unsupported => "unsupported",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "audio" => Some(FileKind::Audio),
            "archive" => Some(FileKind::Archive),
            "image" => Some(FileKind::Image),
            "unsupported" => Some(FileKind::Unsupported),
            _ => None,
        }
    }
}

/// Lifecycle status of an uploaded file.
///
/// A record is created in `Uploading` before bytes are durably written and
/// transitions exactly once to `Uploaded` at finalize time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Uploading,
    Uploaded,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Uploading => "uploading",
            FileStatus::Uploaded => "uploaded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploading" => Some(FileStatus::Uploading),
            "uploaded" => Some(FileStatus::Uploaded),
            _ => None,
        }
    }
}

/// A single uploaded file.
///
/// Exactly one non-alias record exists per distinct content hash; alias
/// records own no physical bytes and resolve through the canonical record.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub id: Uuid,
    pub upload_id: Uuid,
    pub name: String,
    pub size: i64,
    pub kind: FileKind,
    pub status: FileStatus,
    /// Unix seconds.
    pub created_at: i64,
    /// Set at finalize time, never changed afterwards.
    pub hash: Option<ContentHash>,
    pub is_alias: bool,
    pub origin_ip: String,
    /// Relative path of the physical bytes; `None` for aliases.
    pub disk_path: Option<String>,
}

impl FileRecord {
    /// Create a fresh record in `Uploading` status.
    pub fn new(upload_id: Uuid, name: String, size: i64, origin_ip: String) -> Self {
        let kind = FileKind::from_name(&name);
        Self {
            id: Uuid::now_v7(),
            upload_id,
            name,
            size,
            kind,
            status: FileStatus::Uploading,
            created_at: Utc::now().timestamp(),
            hash: None,
            is_alias: false,
            origin_ip,
            disk_path: None,
        }
    }

    /// Lowercased extension of the display name, without the dot.
    pub fn extension(&self) -> String {
        file_extension(&self.name)
    }

    /// Date-bucketed path for this record's bytes, relative to the uploads
    /// root: `<MM-dd-yy>/<id>.<ext>`. This is what `disk_path` stores.
    pub fn relative_disk_path(&self) -> String {
        let date = DateTime::<Utc>::from_timestamp(self.created_at, 0)
            .unwrap_or_else(Utc::now)
            .format("%m-%d-%y");
        format!("{}/{}.{}", date, self.id.simple(), self.extension())
    }

    pub fn disk_location(&self, uploads_root: &Path) -> PathBuf {
        uploads_root.join(self.relative_disk_path())
    }
}

/// Groups files uploaded together from one client session.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadBatch {
    pub id: Uuid,
    /// Unix seconds.
    pub created_at: i64,
    pub origin_ip: String,
    pub files_count: i64,
}

impl UploadBatch {
    pub fn new(origin_ip: String) -> Self {
        Self {
            id: Uuid::now_v7(),
            created_at: Utc::now().timestamp(),
            origin_ip,
            files_count: 0,
        }
    }

    /// Whether the given client may still add files to this batch.
    pub fn can_add_files(&self, origin_ip: &str, now: i64) -> bool {
        self.origin_ip == origin_ip && now < self.created_at + UPLOAD_WINDOW_SECS
    }
}

/// Audio tag metadata, keyed by content hash so aliases share it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioMetadata {
    pub title: String,
    pub album: String,
    pub artist: String,
    pub attached_pic: bool,
}

/// A single entry inside a zip archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
}

/// Archive listing metadata, keyed by content hash.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArchiveMetadata {
    pub entries: Vec<ArchiveEntry>,
    pub password: bool,
}

/// Image preview metadata, keyed by content hash.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMetadata {
    pub preview_size: i64,
}

/// Lowercased extension of a file name, without the dot.
pub fn file_extension(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase()
}

/// Best-effort MIME type from a file name, for download responses.
pub fn content_type_for(name: &str) -> &'static str {
    match file_extension(name).as_str() {
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        "aac" => "audio/aac",
        "aif" | "aiff" => "audio/aiff",
        "zip" => "application/zip",
        "rar" => "application/vnd.rar",
        "7z" => "application/x-7z-compressed",
        "png" => "image/png",
        "webp" => "image/webp",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_kind_from_name() {
        assert_eq!(FileKind::from_name("song.mp3"), FileKind::Audio);
        assert_eq!(FileKind::from_name("song.MP3"), FileKind::Audio);
        assert_eq!(FileKind::from_name("bundle.zip"), FileKind::Archive);
        assert_eq!(FileKind::from_name("bundle.RAR"), FileKind::Archive);
        assert_eq!(FileKind::from_name("photo.jpeg"), FileKind::Image);
        assert_eq!(FileKind::from_name("report.pdf"), FileKind::Unsupported);
        assert_eq!(FileKind::from_name("noext"), FileKind::Unsupported);
    }

    #[test]
    fn test_content_hash_roundtrip() {
        let hash = ContentHash(0x0123456789abcdef0123456789abcdef);
        let bytes = hash.to_bytes();
        assert_eq!(ContentHash::from_bytes(&bytes), Some(hash));
        assert_eq!(ContentHash::from_bytes(&bytes[..8]), None);
    }

    #[test]
    fn test_disk_location_is_date_bucketed() {
        let mut record = FileRecord::new(
            Uuid::now_v7(),
            "track.mp3".to_string(),
            1024,
            "127.0.0.1".to_string(),
        );
        // 2024-03-05 00:00:00 UTC
        record.created_at = 1709596800;

        let path = record.disk_location(Path::new("Uploads"));
        let expected = format!("Uploads/03-05-24/{}.mp3", record.id.simple());
        assert_eq!(path, PathBuf::from(expected));
    }

    #[test]
    fn test_upload_batch_window() {
        let batch = UploadBatch::new("10.0.0.1".to_string());
        let created = batch.created_at;

        assert!(batch.can_add_files("10.0.0.1", created + 60));
        assert!(!batch.can_add_files("10.0.0.2", created + 60));
        assert!(!batch.can_add_files("10.0.0.1", created + UPLOAD_WINDOW_SECS));
    }

    #[test]
    fn test_content_type_fallback() {
        assert_eq!(content_type_for("a.mp3"), "audio/mpeg");
        assert_eq!(content_type_for("a.zip"), "application/zip");
        assert_eq!(content_type_for("a.bin"), "application/octet-stream");
    }
}
