use crate::store::ContentHash;
use std::io;
use std::path::Path;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use xxhash_rust::xxh3::Xxh3;

const SMALL_FILE_LIMIT: u64 = 1024 * 1024;
const MEDIUM_FILE_LIMIT: u64 = 100 * 1024 * 1024;

/// Copy buffer size tiered by the declared file size, so small uploads don't
/// pay for large buffers and large ones aren't throttled by small reads.
pub fn buffer_size_for(declared_size: u64) -> usize {
    if declared_size <= SMALL_FILE_LIMIT {
        16 * 1024
    } else if declared_size <= MEDIUM_FILE_LIMIT {
        80 * 1024
    } else {
        1024 * 1024
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrittenFile {
    pub hash: ContentHash,
    pub bytes_written: u64,
}

/// Streams `reader` to `dest` while computing the XXH3-128 digest in a single
/// pass. On any I/O failure the partial file is removed before the error is
/// returned.
pub async fn write_and_hash<R>(
    mut reader: R,
    dest: &Path,
    declared_size: u64,
) -> io::Result<WrittenFile>
where
    R: AsyncRead + Unpin,
{
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    match copy_and_hash(&mut reader, dest, declared_size).await {
        Ok(written) => Ok(written),
        Err(e) => {
            let _ = fs::remove_file(dest).await;
            Err(e)
        }
    }
}

async fn copy_and_hash<R>(reader: &mut R, dest: &Path, declared_size: u64) -> io::Result<WrittenFile>
where
    R: AsyncRead + Unpin,
{
    let mut file = fs::File::create(dest).await?;
    let mut hasher = Xxh3::new();
    let mut buffer = vec![0u8; buffer_size_for(declared_size)];
    let mut bytes_written = 0u64;

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        file.write_all(&buffer[..n]).await?;
        hasher.update(&buffer[..n]);
        bytes_written += n as u64;
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(WrittenFile {
        hash: ContentHash(hasher.digest128()),
        bytes_written,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use xxhash_rust::xxh3::xxh3_128;

    #[test]
    fn test_buffer_size_tiers() {
        assert_eq!(buffer_size_for(0), 16 * 1024);
        assert_eq!(buffer_size_for(1024 * 1024), 16 * 1024);
        assert_eq!(buffer_size_for(1024 * 1024 + 1), 80 * 1024);
        assert_eq!(buffer_size_for(100 * 1024 * 1024), 80 * 1024);
        assert_eq!(buffer_size_for(100 * 1024 * 1024 + 1), 1024 * 1024);
    }

    #[tokio::test]
    async fn test_write_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("05-01-25/content.bin");
        let payload = b"some file content".to_vec();

        let written = write_and_hash(payload.as_slice(), &dest, payload.len() as u64)
            .await
            .unwrap();

        assert_eq!(written.bytes_written, payload.len() as u64);
        assert_eq!(written.hash, ContentHash(xxh3_128(&payload)));
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_identical_content_hashes_equal() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![7u8; 200_000];

        let first = write_and_hash(payload.as_slice(), &dir.path().join("a.bin"), 200_000)
            .await
            .unwrap();
        let second = write_and_hash(payload.as_slice(), &dir.path().join("b.bin"), 200_000)
            .await
            .unwrap();

        assert_eq!(first.hash, second.hash);
    }
}
