//! Overall risk assessment from a chat-completion model.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const SYSTEM_PROMPT: &str = "Assess the risk that this video causes a flame war (public backlash).";

#[derive(Debug, Clone)]
pub struct AssessorConfig {
    /// Base URL of an OpenAI-compatible API, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl Default for AssessorConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o".to_string(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

/// Combine per-frame descriptions and the transcript into the user message.
pub fn build_summary_prompt(analysis_results: &[String], transcript: &str) -> String {
    format!(
        "The image descriptions are:\n{}\nThe audio transcript is:\n{}\n\
         Evaluate the overall risk of a flame war.",
        analysis_results.join("\n"),
        transcript
    )
}

/// Client for `POST {base_url}/chat/completions`.
pub struct RiskAssessor {
    client: Client,
    config: AssessorConfig,
}

impl RiskAssessor {
    pub fn new(config: AssessorConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub async fn assess(&self, analysis_results: &[String], transcript: &str) -> Result<String> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: build_summary_prompt(analysis_results, transcript),
                },
            ],
        };

        debug!(model = %self.config.model, frames = analysis_results.len(), "requesting risk assessment");

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .context("chat completion HTTP request failed")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("chat completion service returned {}: {}", status, error_body);
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .context("failed to parse chat completion response")?;

        let content = chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .context("chat completion response had no choices")?;

        info!(model = %self.config.model, chars = content.chars().count(), "risk assessment received");
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use super::*;

    type Captured = Arc<Mutex<Option<(Option<String>, Value)>>>;

    async fn fake_completions(
        State(seen): State<Captured>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        *seen.lock().unwrap() = Some((auth, body));
        Json(json!({
            "choices": [{ "message": { "role": "assistant", "content": "\n Low risk. \n" } }]
        }))
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/v1")
    }

    #[test]
    fn prompt_lists_results_then_transcript() {
        let prompt = build_summary_prompt(
            &["0s: a street".to_string(), "2s: a sign".to_string()],
            "hello",
        );
        assert_eq!(
            prompt,
            "The image descriptions are:\n0s: a street\n2s: a sign\n\
             The audio transcript is:\nhello\n\
             Evaluate the overall risk of a flame war."
        );
    }

    #[tokio::test]
    async fn assess_sends_system_and_user_messages() {
        let seen: Captured = Arc::new(Mutex::new(None));
        let app = Router::new()
            .route("/v1/chat/completions", post(fake_completions))
            .with_state(seen.clone());
        let base_url = serve(app).await;

        let assessor = RiskAssessor::new(AssessorConfig {
            base_url,
            api_key: Some("sk-test".to_string()),
            ..AssessorConfig::default()
        });
        let result = assessor
            .assess(&["0s: a crowd".to_string()], "some speech")
            .await
            .unwrap();

        assert_eq!(result, "Low risk.");
        let (auth, body) = seen.lock().unwrap().take().unwrap();
        assert_eq!(auth.as_deref(), Some("Bearer sk-test"));
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        let user = body["messages"][1]["content"].as_str().unwrap();
        assert!(user.contains("0s: a crowd"));
        assert!(user.contains("some speech"));
    }

    #[tokio::test]
    async fn empty_choices_is_an_error() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async { Json(json!({ "choices": [] })) }),
        );
        let base_url = serve(app).await;

        let assessor = RiskAssessor::new(AssessorConfig {
            base_url,
            ..AssessorConfig::default()
        });
        let err = assessor.assess(&[], "x").await.unwrap_err();

        assert!(err.to_string().contains("no choices"));
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (axum::http::StatusCode::TOO_MANY_REQUESTS, "slow down") }),
        );
        let base_url = serve(app).await;

        let assessor = RiskAssessor::new(AssessorConfig {
            base_url,
            ..AssessorConfig::default()
        });
        let err = assessor.assess(&[], "x").await.unwrap_err();

        assert!(err.to_string().contains("429"), "{err}");
    }
}
