//! HTTP API.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::multipart::Field;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use flarecheck_core::pipeline::{self, AnalysisContext, Assessment};
use flarecheck_core::PipelineError;

pub struct AppState {
    pub ctx: AnalysisContext,
    /// Parent of the per-request scratch directories.
    pub work_dir: PathBuf,
}

/// Error returned by a handler, rendered as `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Pipeline(e) if e.is_invalid_input() => StatusCode::BAD_REQUEST,
            ApiError::Pipeline(e) if e.is_upstream() => StatusCode::BAD_GATEWAY,
            ApiError::Pipeline(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Internal(_) => "internal error while processing the video".to_string(),
            other => other.to_string(),
        };

        if status.is_server_error() {
            let chain = self.into_anyhow();
            error!(%status, error = %format!("{chain:#}"), "request failed");
        } else {
            warn!(%status, error = %message, "request rejected");
        }

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl ApiError {
    /// Flatten into an anyhow error so `{:#}` prints the whole cause chain.
    fn into_anyhow(self) -> anyhow::Error {
        match self {
            ApiError::Internal(e) => e,
            other => anyhow::Error::new(other),
        }
    }
}

pub fn router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/api/health", get(|| async { "OK" }))
        .route("/api/process_video", post(process_video))
        .route("/api/analyze_images", post(analyze_images))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: Arc<AppState>, max_upload_bytes: usize) -> Result<()> {
    let app = router(state, max_upload_bytes);

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    info!(%addr, "listening");
    axum::serve(listener, app).await.context("server failed")?;
    Ok(())
}

/// Keep only the final path component of a client-supplied file name.
fn sanitize_file_name(name: Option<&str>) -> String {
    name.and_then(|n| n.rsplit(['/', '\\']).next())
        .map(str::trim)
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .unwrap_or("upload.mp4")
        .to_string()
}

async fn save_field(mut field: Field<'_>, path: &Path) -> Result<u64, ApiError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut written = 0u64;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read upload: {e}")))?
    {
        file.write_all(&chunk)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        written += chunk.len() as u64;
    }
    file.flush().await.context("failed to flush upload")?;
    Ok(written)
}

/// POST /api/process_video: multipart upload with a `file` field.
async fn process_video(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<Assessment>, ApiError> {
    // Removed once this handler and the frame sampler have both let go of it.
    let scratch = Arc::new(
        tempfile::Builder::new()
            .prefix("flarecheck-")
            .tempdir_in(&state.work_dir)
            .context("failed to create scratch directory")?,
    );

    let mut video_path = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let path = scratch.path().join(sanitize_file_name(field.file_name()));
        let bytes = save_field(field, &path).await?;
        info!(?path, bytes, "video upload saved");
        video_path = Some(path);
        break;
    }

    let video_path = video_path.ok_or_else(|| ApiError::BadRequest("no file uploaded".to_string()))?;
    let assessment = pipeline::process_video(&state.ctx, &video_path, scratch.clone()).await?;
    Ok(Json(assessment))
}

#[derive(Deserialize)]
struct AnalyzeImagesRequest {
    #[serde(default)]
    image_paths: Vec<PathBuf>,
    #[serde(default)]
    transcription: String,
}

/// POST /api/analyze_images: describe already-extracted frames.
async fn analyze_images(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AnalyzeImagesRequest>,
) -> Result<Json<Assessment>, ApiError> {
    let assessment =
        pipeline::analyze_images(&state.ctx, &req.image_paths, &req.transcription).await?;
    Ok(Json(assessment))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;
    use tracing_test::traced_test;

    use flarecheck_core::llm::{AssessorConfig, RiskAssessor};
    use flarecheck_core::sampler::SamplerOptions;
    use flarecheck_core::transcribe::Transcriber;
    use flarecheck_core::vision::{VisionClient, VisionConfig};

    use super::*;

    struct SilentTranscriber;

    #[async_trait]
    impl Transcriber for SilentTranscriber {
        fn name(&self) -> &str {
            "silent"
        }

        async fn transcribe(&self, _wav_path: &Path) -> anyhow::Result<String> {
            Ok(String::new())
        }
    }

    fn app(work_dir: &Path) -> Router {
        // Port 1 refuses connections, so any call that reaches a collaborator fails fast.
        let ctx = AnalysisContext {
            sampler: SamplerOptions::default(),
            transcriber: Arc::new(SilentTranscriber),
            vision: VisionClient::new(VisionConfig {
                base_url: "http://127.0.0.1:1".to_string(),
                ..VisionConfig::default()
            }),
            assessor: RiskAssessor::new(AssessorConfig {
                base_url: "http://127.0.0.1:1/v1".to_string(),
                ..AssessorConfig::default()
            }),
        };
        let state = Arc::new(AppState {
            ctx,
            work_dir: work_dir.to_path_buf(),
        });
        router(state, 1024 * 1024)
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn analyze_request(body: Value) -> Request<Body> {
        Request::post("/api/analyze_images")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn multipart_request(field_name: &str, file_name: &str, content: &[u8]) -> Request<Body> {
        let boundary = "XFLARECHECKBOUNDARY";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{field_name}\"; filename=\"{file_name}\"\r\nContent-Type: video/mp4\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        Request::post("/api/process_video")
            .header("content-type", format!("multipart/form-data; boundary={boundary}"))
            .body(Body::from(body))
            .unwrap()
    }

    #[test]
    fn file_names_lose_their_directories() {
        assert_eq!(sanitize_file_name(Some("clip.mp4")), "clip.mp4");
        assert_eq!(sanitize_file_name(Some("../../etc/passwd")), "passwd");
        assert_eq!(sanitize_file_name(Some("C:\\videos\\clip.mov")), "clip.mov");
        assert_eq!(sanitize_file_name(Some("..")), "upload.mp4");
        assert_eq!(sanitize_file_name(Some("dir/")), "upload.mp4");
        assert_eq!(sanitize_file_name(None), "upload.mp4");
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"OK");
    }

    #[tokio::test]
    #[traced_test]
    async fn analyze_without_transcript_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .oneshot(analyze_request(json!({ "image_paths": ["/tmp/a.jpg"] })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "no transcript was provided");
    }

    #[tokio::test]
    async fn analyze_without_paths_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .oneshot(analyze_request(json!({ "transcription": "hello" })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "no image paths were provided");
    }

    #[tokio::test]
    async fn analyze_with_missing_files_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .oneshot(analyze_request(json!({
                "transcription": "hello",
                "image_paths": ["/nonexistent/image_0000.jpg"]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "none of the given image paths exist");
    }

    #[tokio::test]
    #[traced_test]
    async fn unreachable_vision_service_is_bad_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let frame = dir.path().join("image_0000.jpg");
        std::fs::write(&frame, b"jpeg").unwrap();

        let response = app(dir.path())
            .oneshot(analyze_request(json!({
                "transcription": "hello",
                "image_paths": [frame]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let error = json_body(response).await["error"].as_str().unwrap().to_string();
        assert!(error.starts_with("image description failed"), "{error}");
        assert!(logs_contain("request failed"));
    }

    #[tokio::test]
    async fn upload_without_file_field_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .oneshot(multipart_request("other", "clip.mp4", b"data"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "no file uploaded");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn undecodable_upload_is_rejected_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .oneshot(multipart_request("file", "../clip.mp4", b"not really a video"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await["error"],
            "no frames could be decoded from the video"
        );
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
