//! Media probing and transcoding using ffmpeg/ffprobe.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Errors that can occur while probing or transcoding media.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("ffprobe failed: {0}")]
    ProbeFailed(String),

    #[error("ffmpeg failed: {0}")]
    TranscodeFailed(String),

    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid output: {0}")]
    InvalidOutput(String),
}

/// Media information extracted from ffprobe.
#[derive(Debug, Clone, Default)]
pub struct MediaInfo {
    /// Duration in milliseconds.
    pub duration_ms: i64,
    /// Number of decode errors ffprobe reported on stderr. Anything above
    /// zero means the file is corrupt or not what its extension claims.
    pub error_count: usize,
    /// Container-level tags, keys lowercased.
    pub tags: HashMap<String, String>,
    /// Whether any stream carries an attached picture (embedded cover art).
    pub has_attached_pic: bool,
}

/// ffprobe JSON output structure.
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    #[serde(default)]
    disposition: FfprobeDisposition,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeDisposition {
    #[serde(default)]
    attached_pic: i32,
}

/// Probe a media file for duration, tags and stream dispositions.
///
/// Runs ffprobe with `-v error` so decode problems show up on stderr and can
/// be counted, while the JSON report still lands on stdout.
pub async fn probe_media(path: &Path, timeout: Duration) -> Result<MediaInfo, MediaError> {
    let output = run_with_timeout(
        Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped()),
        timeout,
    )
    .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(MediaError::ProbeFailed(stderr.to_string()));
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let error_count = stderr.lines().filter(|l| !l.trim().is_empty()).count();

    let stdout = String::from_utf8_lossy(&output.stdout);
    let probe: FfprobeOutput = serde_json::from_str(&stdout)
        .map_err(|e| MediaError::InvalidOutput(format!("JSON parse error: {}", e)))?;

    let duration_secs: f64 = probe
        .format
        .duration
        .as_ref()
        .and_then(|d| d.parse().ok())
        .unwrap_or(0.0);

    let tags = probe
        .format
        .tags
        .into_iter()
        .map(|(k, v)| (k.to_lowercase(), v))
        .collect();

    let has_attached_pic = probe.streams.iter().any(|s| s.disposition.attached_pic == 1);

    Ok(MediaInfo {
        duration_ms: (duration_secs * 1000.0) as i64,
        error_count,
        tags,
        has_attached_pic,
    })
}

/// Transcode an audio file to a low-bitrate AAC preview in an mp4 container.
/// All source metadata is stripped.
pub async fn transcode_audio_preview(
    input_path: &Path,
    output_path: &Path,
    timeout: Duration,
) -> Result<(), MediaError> {
    run_ffmpeg(
        Command::new("ffmpeg")
            .arg("-i")
            .arg(input_path)
            .args([
                "-c:a",
                "aac",
                "-b:a",
                "80k",
                "-f",
                "ipod",
                "-vn",
                "-map_metadata",
                "-1",
                "-y",
            ])
            .arg(output_path),
        timeout,
    )
    .await
}

/// Extract the embedded cover art of an audio file as a single webp frame.
pub async fn extract_cover_art(
    input_path: &Path,
    output_path: &Path,
    timeout: Duration,
) -> Result<(), MediaError> {
    run_ffmpeg(
        Command::new("ffmpeg")
            .arg("-i")
            .arg(input_path)
            .args([
                "-c:v",
                "libwebp",
                "-pix_fmt",
                "yuva420p",
                "-frames:v",
                "1",
                "-an",
                "-y",
            ])
            .arg(output_path),
        timeout,
    )
    .await
}

/// Re-encode an image as a webp preview.
pub async fn transcode_image_preview(
    input_path: &Path,
    output_path: &Path,
    timeout: Duration,
) -> Result<(), MediaError> {
    run_ffmpeg(
        Command::new("ffmpeg")
            .arg("-i")
            .arg(input_path)
            .args(["-c:v", "libwebp", "-q:v", "75", "-y"])
            .arg(output_path),
        timeout,
    )
    .await
}

async fn run_ffmpeg(command: &mut Command, timeout: Duration) -> Result<(), MediaError> {
    let output = run_with_timeout(
        command.stdout(Stdio::piped()).stderr(Stdio::piped()),
        timeout,
    )
    .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(MediaError::TranscodeFailed(stderr.to_string()));
    }
    Ok(())
}

async fn run_with_timeout(
    command: &mut Command,
    timeout: Duration,
) -> Result<std::process::Output, MediaError> {
    let mut child = command.kill_on_drop(true).spawn()?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    match tokio::time::timeout(timeout, async {
        let mut out = Vec::new();
        let mut err = Vec::new();
        // Drain both pipes concurrently so a chatty stderr can't stall the
        // child on a full pipe buffer.
        let (stdout_read, stderr_read) = tokio::join!(
            async {
                match stdout {
                    Some(mut stdout) => {
                        tokio::io::AsyncReadExt::read_to_end(&mut stdout, &mut out).await
                    }
                    None => Ok(0),
                }
            },
            async {
                match stderr {
                    Some(mut stderr) => {
                        tokio::io::AsyncReadExt::read_to_end(&mut stderr, &mut err).await
                    }
                    None => Ok(0),
                }
            }
        );
        stdout_read?;
        stderr_read?;
        let status = child.wait().await?;
        Ok::<_, std::io::Error>(std::process::Output {
            status,
            stdout: out,
            stderr: err,
        })
    })
    .await
    {
        Ok(result) => Ok(result?),
        Err(_) => Err(MediaError::TimedOut(timeout)),
    }
}

/// Check if ffmpeg and ffprobe are available.
pub async fn check_ffmpeg_available() -> Result<(), MediaError> {
    for tool in ["ffprobe", "ffmpeg"] {
        let result = Command::new(tool)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match result {
            Ok(status) if status.success() => {}
            _ => {
                return Err(MediaError::ProbeFailed(format!(
                    "{tool} not found or not working"
                )))
            }
        }
    }
    Ok(())
}
