pub const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS uploads (
    id          TEXT PRIMARY KEY,
    created_at  INTEGER NOT NULL,
    origin_ip   TEXT NOT NULL,
    files_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS files (
    id          TEXT PRIMARY KEY,
    upload_id   TEXT NOT NULL,
    name        TEXT NOT NULL,
    size        INTEGER NOT NULL,
    kind        TEXT NOT NULL,
    status      TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    hash        BLOB,
    is_alias    INTEGER NOT NULL DEFAULT 0,
    origin_ip   TEXT NOT NULL,
    disk_path   TEXT,
    FOREIGN KEY (upload_id) REFERENCES uploads (id)
);

-- At most one canonical (non-alias) uploaded record per content hash.
CREATE UNIQUE INDEX IF NOT EXISTS idx_files_canonical_hash
    ON files (hash)
    WHERE is_alias = 0 AND hash IS NOT NULL AND status = 'uploaded';

CREATE INDEX IF NOT EXISTS idx_files_upload_id ON files (upload_id);
CREATE INDEX IF NOT EXISTS idx_files_disk_path ON files (disk_path);

CREATE TABLE IF NOT EXISTS audio_metadata (
    hash         BLOB PRIMARY KEY,
    title        TEXT NOT NULL DEFAULT '',
    album        TEXT NOT NULL DEFAULT '',
    artist       TEXT NOT NULL DEFAULT '',
    attached_pic INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS archive_metadata (
    hash     BLOB PRIMARY KEY,
    entries  TEXT NOT NULL,
    password INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS image_metadata (
    hash         BLOB PRIMARY KEY,
    preview_size INTEGER NOT NULL
);
";
