//! Speech-to-text for a video's audio track.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

use crate::audio::extract_audio;

/// Turns a WAV file into text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    fn name(&self) -> &str;

    async fn transcribe(&self, wav_path: &Path) -> Result<String>;
}

/// Settings for a Whisper-compatible transcription endpoint.
#[derive(Debug, Clone)]
pub struct WhisperConfig {
    /// Base URL up to and including the API version, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// ISO-639-1 hint; `None` lets the server detect the language.
    pub language: Option<String>,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "whisper-1".to_string(),
            language: Some("ja".to_string()),
        }
    }
}

/// Transcriber backed by `POST {base_url}/audio/transcriptions`.
///
/// Built once at startup and shared by every request.
pub struct WhisperTranscriber {
    client: Client,
    config: WhisperConfig,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

impl WhisperTranscriber {
    pub fn new(config: WhisperConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    fn name(&self) -> &str {
        "whisper"
    }

    async fn transcribe(&self, wav_path: &Path) -> Result<String> {
        let audio = tokio::fs::read(wav_path)
            .await
            .with_context(|| format!("failed to read {}", wav_path.display()))?;
        debug!(bytes = audio.len(), model = %self.config.model, "sending audio for transcription");

        let file = Part::bytes(audio)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .context("invalid audio mime type")?;
        let mut form = Form::new()
            .part("file", file)
            .text("model", self.config.model.clone())
            .text("response_format", "json");
        if let Some(language) = &self.config.language {
            form = form.text("language", language.clone());
        }

        let mut request = self
            .client
            .post(format!("{}/audio/transcriptions", self.config.base_url))
            .multipart(form);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .context("transcription HTTP request failed")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("transcription service returned {}: {}", status, error_body);
        }

        let body: TranscriptionResponse = response
            .json()
            .await
            .context("failed to parse transcription response")?;

        Ok(body.text.trim().to_string())
    }
}

/// Extract the audio track of `video_path` into a scratch directory and transcribe it.
///
/// The scratch directory is removed on every exit path.
pub async fn transcribe_video(transcriber: &dyn Transcriber, video_path: &Path) -> Result<String> {
    let scratch = tempfile::Builder::new()
        .prefix("flarecheck-audio-")
        .tempdir()
        .context("failed to create scratch directory for audio")?;

    let wav_path = extract_audio(video_path, scratch.path()).await?;
    let text = transcriber.transcribe(&wav_path).await?;

    info!(
        transcriber = transcriber.name(),
        chars = text.chars().count(),
        "transcription complete"
    );
    Ok(text)
}
