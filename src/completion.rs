// ABOUTME: OpenAI-compatible chat-completions client (Groq by default)
// ABOUTME: One request per relayed message: fixed system turn, user text, configured sampling

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use warelay_core::config::CompletionConfig;
use warelay_core::{CompletionClient, CompletionError, CompletionRequest};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// HTTP client for `POST {base_url}/chat/completions`
#[derive(Clone)]
pub struct ChatCompletionsClient {
    http: reqwest::Client,
    config: CompletionConfig,
}

impl ChatCompletionsClient {
    pub fn new(config: CompletionConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if config.timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.timeout_secs));
        }
        let http = builder
            .build()
            .context("Failed to build completion HTTP client")?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &CompletionConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl CompletionClient for ChatCompletionsClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(CompletionError::MissingApiKey)?;

        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user_text,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            top_p: self.config.top_p,
            stream: false,
        };

        let started = std::time::Instant::now();
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CompletionError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CompletionError::Request(format!("invalid response body: {}", e)))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or(CompletionError::EmptyResponse)?;

        tracing::debug!(
            model = %self.config.model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            chars = text.len(),
            "Completion received"
        );
        Ok(text)
    }
}
