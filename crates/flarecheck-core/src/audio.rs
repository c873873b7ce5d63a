use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{error, info};

/// File name of the extracted track inside the scratch directory.
const AUDIO_FILE_NAME: &str = "audio.wav";

/// Extract the first audio track of `video_path` as 16 kHz mono PCM WAV into `dir`.
///
/// `dir` is owned by the caller; removing it removes the extracted track.
pub async fn extract_audio(video_path: &Path, dir: &Path) -> Result<PathBuf> {
    let output_path = dir.join(AUDIO_FILE_NAME);
    info!(?video_path, ?output_path, "extracting audio track with ffmpeg");

    let output = Command::new("ffmpeg")
        .arg("-y")
        .arg("-i")
        .arg(video_path)
        .args([
            "-vn",
            "-map", "0:a:0",
            "-acodec", "pcm_s16le",
            "-ar", "16000",
            "-ac", "1",
            "-v", "error",
        ])
        .arg(&output_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .context("failed to run ffmpeg, is ffmpeg installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(status = ?output.status.code(), %stderr, ?video_path, "audio extraction failed");
        bail!("ffmpeg exited with {}: {}", output.status, stderr.trim());
    }

    info!(?output_path, "audio track extracted");
    Ok(output_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_video_is_an_error() {
        let dir = tempfile::tempdir().unwrap();

        let result = extract_audio(&dir.path().join("missing.mp4"), dir.path()).await;

        assert!(result.is_err());
        assert!(!dir.path().join(AUDIO_FILE_NAME).exists());
    }
}
