//! Worker backed by the Anthropic Messages API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Worker;
use crate::config::AnthropicSettings;
use crate::error::{ConfigError, WorkerError};

#[derive(Debug, Clone, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [Message<'a>; 1],
}

#[derive(Debug, Clone, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

/// Only `text` blocks carry a `text` field.
#[derive(Debug, Clone, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: String,
}

pub struct AnthropicWorker {
    api_key: String,
    model: String,
    max_tokens: u32,
    client: Client,
    base_url: String,
}

impl AnthropicWorker {
    pub fn from_settings(settings: &AnthropicSettings) -> Result<Self, ConfigError> {
        if settings.api_key.trim().is_empty() {
            return Err(ConfigError::WorkerSetup {
                worker: "anthropic".into(),
                reason: "no API key (set ANTHROPIC_API_KEY or [anthropic].api_key)".into(),
            });
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ConfigError::WorkerSetup {
                worker: "anthropic".into(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            client,
            base_url: settings.base_url.clone(),
        })
    }

    fn classify(status: StatusCode, body: String) -> WorkerError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                WorkerError::Fatal(format!("authentication required (status {})", status.as_u16()))
            }
            StatusCode::TOO_MANY_REQUESTS => WorkerError::Retryable(format!("rate limited: {body}")),
            s if s.is_server_error() => {
                WorkerError::Retryable(format!("API error (status {}): {body}", s.as_u16()))
            }
            s => WorkerError::Fatal(format!("API error (status {}): {body}", s.as_u16())),
        }
    }
}

#[async_trait]
impl Worker for AnthropicWorker {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn execute(&self, prompt: &str, timeout: Duration) -> Result<String, WorkerError> {
        let req = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: [Message {
                role: "user",
                content: prompt,
            }],
        };
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .timeout(timeout)
            .json(&req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    WorkerError::Retryable(format!("request timed out after {}s", timeout.as_secs()))
                } else {
                    WorkerError::Retryable(format!("network error: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(Self::classify(status, body));
        }

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| WorkerError::Retryable(format!("malformed response: {e}")))?;
        let text: String = body
            .content
            .iter()
            .filter(|b| b.content_type == "text")
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        debug!(stop_reason = ?body.stop_reason, chars = text.len(), "message received");
        if text.trim().is_empty() {
            return Err(WorkerError::Retryable("empty response".into()));
        }
        Ok(text)
    }
}
