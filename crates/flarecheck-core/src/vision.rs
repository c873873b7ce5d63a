//! Frame descriptions from a local Ollama vision model.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::Engine;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const DEFAULT_VISION_PROMPT: &str = "List the elements on the screen, paying special attention \
to those that do not comply with Japanese law and those that pose a risk of flame wars. In short sentences.";

#[derive(Debug, Clone)]
pub struct VisionConfig {
    pub base_url: String,
    pub model: String,
    pub prompt: String,
    /// Upper bound on one streamed generation, including the wait for `done`.
    pub timeout: Duration,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llava".to_string(),
            prompt: DEFAULT_VISION_PROMPT.to_string(),
            timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: Vec<String>,
    stream: bool,
}

/// One line of Ollama's streamed `/api/generate` output.
#[derive(Debug, Deserialize, PartialEq)]
pub struct GenerateChunk {
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub done: bool,
}

/// Splits a byte stream into newline-delimited JSON chunks.
///
/// Lines may straddle network reads; incomplete tails are buffered until the next push.
#[derive(Default)]
pub struct NdjsonDecoder {
    buf: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every complete chunk they finish.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<GenerateChunk>> {
        self.buf.extend_from_slice(bytes);
        let mut chunks = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(chunk) = parse_line(&line)? {
                chunks.push(chunk);
            }
        }
        Ok(chunks)
    }

    /// Parse whatever is left once the stream has closed.
    pub fn finish(&mut self) -> Result<Option<GenerateChunk>> {
        let line = std::mem::take(&mut self.buf);
        parse_line(&line)
    }
}

fn parse_line(line: &[u8]) -> Result<Option<GenerateChunk>> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let chunk = serde_json::from_slice(trimmed).with_context(|| {
        format!(
            "malformed line in generation stream: {}",
            String::from_utf8_lossy(trimmed)
        )
    })?;
    Ok(Some(chunk))
}

/// Concatenate `response` fragments until a chunk with `done: true`.
///
/// A stream that closes without `done` yields what was received so far.
pub async fn collect_generation<S, E>(stream: S) -> Result<String>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = NdjsonDecoder::new();
    let mut text = String::new();

    while let Some(bytes) = stream.next().await {
        let bytes = bytes.context("generation stream failed")?;
        for chunk in decoder.push(&bytes)? {
            text.push_str(&chunk.response);
            if chunk.done {
                return Ok(text);
            }
        }
    }

    if let Some(chunk) = decoder.finish()? {
        text.push_str(&chunk.response);
        if chunk.done {
            return Ok(text);
        }
    }

    warn!(chars = text.chars().count(), "generation stream closed before done marker");
    Ok(text)
}

/// Client for Ollama's `/api/generate` with image input.
pub struct VisionClient {
    client: Client,
    config: VisionConfig,
}

impl VisionClient {
    pub fn new(config: VisionConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Describe the image at `image_path`.
    pub async fn describe(&self, image_path: &Path) -> Result<String> {
        let image = tokio::fs::read(image_path)
            .await
            .with_context(|| format!("failed to read {}", image_path.display()))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&image);

        let body = GenerateRequest {
            model: &self.config.model,
            prompt: &self.config.prompt,
            images: vec![encoded],
            stream: true,
        };

        debug!(?image_path, model = %self.config.model, "sending frame to vision model");

        let generation = async {
            let response = self
                .client
                .post(format!("{}/api/generate", self.config.base_url))
                .json(&body)
                .send()
                .await
                .context("vision HTTP request failed")?;

            let status = response.status();
            if !status.is_success() {
                let error_body = response.text().await.unwrap_or_default();
                bail!("vision service returned {}: {}", status, error_body);
            }

            collect_generation(response.bytes_stream()).await
        };

        let text = tokio::time::timeout(self.config.timeout, generation)
            .await
            .map_err(|_| {
                anyhow!(
                    "vision model did not finish within {}s",
                    self.config.timeout.as_secs_f64()
                )
            })??;

        info!(?image_path, chars = text.chars().count(), "frame described");
        Ok(text)
    }
}
