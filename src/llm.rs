//! Azure OpenAI chat client
//!
//! Completion is exposed through the `CompletionService` trait so the
//! classifier and reconciliation loop can run against scripted stand-ins.
//! Uses a long-lived reqwest::Client for connection pooling.

use crate::error::{PipelineError, Stage};
use crate::pipeline::bounded;
use crate::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// One prompt sent to the model
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub json_mode: bool,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn text(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            json_mode: false,
            temperature: 0.0,
        }
    }

    pub fn json(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            json_mode: true,
            ..Self::text(system, user)
        }
    }
}

/// Capability interface for text completion
#[async_trait::async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// Completion service whose every call carries a deadline
pub struct TimedCompletion {
    inner: Arc<dyn CompletionService>,
    limit: Duration,
    stage: Stage,
}

impl TimedCompletion {
    pub fn new(inner: Arc<dyn CompletionService>, limit: Duration, stage: Stage) -> Self {
        Self { inner, limit, stage }
    }
}

#[async_trait::async_trait]
impl CompletionService for TimedCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        bounded(self.stage, self.limit, self.inner.complete(request)).await
    }
}

/// Reusable Azure OpenAI client (connection-pooled)
pub struct AzureOpenAiClient {
    client: Client,
    api_key: String,
    url: String,
}

impl AzureOpenAiClient {
    pub fn new(config: &crate::config::OpenAiConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            url: format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                config.endpoint.trim_end_matches('/'),
                config.deployment,
                config.api_version
            ),
        })
    }
}

#[async_trait::async_trait]
impl CompletionService for AzureOpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let body = ChatRequest {
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: request.system.clone(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: request.user.clone(),
                },
            ],
            temperature: request.temperature,
            response_format: request.json_mode.then(|| ResponseFormat {
                kind: "json_object".to_string(),
            }),
        };

        debug!(json_mode = request.json_mode, "Calling Azure OpenAI");

        let response = self
            .client
            .post(&self.url)
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!("Azure OpenAI request failed: {}", e);
                PipelineError::Llm(format!("request failed: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "Azure OpenAI error response: {}", error_text);
            return Err(PipelineError::Llm(format!("{}: {}", status, error_text)));
        }

        let chat: ChatResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Azure OpenAI response: {}", e);
            PipelineError::Llm(format!("parse error: {}", e))
        })?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| PipelineError::Llm("empty completion".to_string()))
    }
}

/// Strip a surrounding markdown code fence from a model reply
pub fn strip_code_fences(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let request = ChatRequest {
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: "Classify this table".to_string(),
            }],
            temperature: 0.0,
            response_format: Some(ResponseFormat {
                kind: "json_object".to_string(),
            }),
        };

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("Classify this table"));
        assert!(json.contains(r#""response_format":{"type":"json_object"}"#));

        let plain = ChatRequest {
            messages: vec![],
            temperature: 0.0,
            response_format: None,
        };
        assert!(!serde_json::to_string(&plain).unwrap().contains("response_format"));
    }

    #[test]
    fn test_response_parsing() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"[Income Statement]"}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(
            parsed.choices[0].message.content.as_deref(),
            Some("[Income Statement]")
        );
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1} "), "{\"a\":1}");
    }
}
