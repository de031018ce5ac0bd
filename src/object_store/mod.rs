//! Derived-asset storage (audio previews, cover art, image previews).
//!
//! Derived assets live outside the uploads directory, behind a small trait
//! so tests and single-node deployments can use a local directory while
//! production points at an S3-compatible HTTP gateway.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio_util::io::ReaderStream;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store the file at `path` under `key`, overwriting any existing object.
    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> Result<()>;

    /// Store raw bytes under `key`.
    async fn put_bytes(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;

    /// Fetch the object stored under `key`. `None` when no such object exists.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// A URL a client can fetch the object from. `None` when no such object
    /// exists; absence is an answer, not an error.
    async fn url_for(&self, key: &str) -> Result<Option<String>>;
}

/// Object store backed by an S3-compatible HTTP gateway.
pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
    bucket: String,
}

impl HttpObjectStore {
    /// # Arguments
    /// * `base_url` - Base URL of the gateway (e.g., "http://localhost:9000")
    /// * `bucket` - Bucket name all keys live under
    /// * `timeout_sec` - Request timeout in seconds
    pub fn new(base_url: String, bucket: String, timeout_sec: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_sec))
            .build()
            .context("Failed to create HTTP client")?;

        // Ensure base_url doesn't have trailing slash
        let base_url = base_url.trim_end_matches('/').to_string();

        Ok(Self {
            client,
            base_url,
            bucket,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.bucket, key)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> Result<()> {
        let file = File::open(path)
            .await
            .with_context(|| format!("Failed to open {:?}", path))?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let response = self
            .client
            .put(self.object_url(key))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .context("Failed to upload object")?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to store object {}: status {}", key, response.status());
        }
        Ok(())
    }

    async fn put_bytes(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let response = self
            .client
            .put(self.object_url(key))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .context("Failed to upload object")?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to store object {}: status {}", key, response.status());
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let response = self
            .client
            .get(self.object_url(key))
            .send()
            .await
            .context("Failed to fetch object")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            anyhow::bail!("Failed to fetch object {}: status {}", key, response.status());
        }
        let bytes = response.bytes().await.context("Failed to read object body")?;
        Ok(Some(bytes.to_vec()))
    }

    async fn url_for(&self, key: &str) -> Result<Option<String>> {
        let url = self.object_url(key);
        let response = self
            .client
            .head(&url)
            .send()
            .await
            .context("Failed to check object")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            anyhow::bail!("Failed to check object {}: status {}", key, response.status());
        }
        Ok(Some(url))
    }
}

/// Object store backed by a local directory. Used in tests and single-node
/// deployments.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        // Keys are flat; strip path separators so a key can't escape root.
        let safe: String = key
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.root.join(safe)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put_file(&self, key: &str, path: &Path, _content_type: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::copy(path, self.object_path(key))
            .await
            .with_context(|| format!("Failed to store object {}", key))?;
        Ok(())
    }

    async fn put_bytes(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.object_path(key), bytes)
            .await
            .with_context(|| format!("Failed to store object {}", key))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.object_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read object {}", key)),
        }
    }

    async fn url_for(&self, key: &str) -> Result<Option<String>> {
        let path = self.object_path(key);
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Ok(Some(format!("file://{}", path.display()))),
            Ok(false) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to check object {}", key)),
        }
    }
}
