//! Azure Document Intelligence layout analyzer
//!
//! Submits the document, then polls the `Operation-Location` returned by
//! the service until the analysis settles.

use super::DocumentAnalyzer;
use crate::config::DocumentIntelligenceConfig;
use crate::error::{ExtractionFailure, PipelineError};
use crate::Result;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, error, warn};

const API_VERSION: &str = "2024-11-30";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_MAX_POLLS: u32 = 60;

pub struct AzureDocumentAnalyzer {
    client: Client,
    analyze_url: String,
    api_key: String,
    poll_interval: Duration,
    max_polls: u32,
}

impl AzureDocumentAnalyzer {
    pub fn new(config: &DocumentIntelligenceConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            client,
            analyze_url: format!(
                "{}/documentintelligence/documentModels/{}:analyze?api-version={}",
                config.endpoint.trim_end_matches('/'),
                config.model,
                API_VERSION
            ),
            api_key: config.api_key.clone(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_polls: DEFAULT_MAX_POLLS,
        })
    }

    pub fn with_polling(mut self, interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = interval;
        self.max_polls = max_polls.max(1);
        self
    }

    async fn poll(&self, operation_url: &str) -> Result<serde_json::Value> {
        for attempt in 1..=self.max_polls {
            tokio::time::sleep(self.poll_interval).await;

            let response = self
                .client
                .get(operation_url)
                .header("Ocp-Apim-Subscription-Key", &self.api_key)
                .send()
                .await
                .map_err(transport_error)?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(status_error(status, body));
            }

            let mut poll: serde_json::Value = response.json().await.map_err(|e| {
                malformed(format!("invalid poll response: {}", e))
            })?;

            let state = poll
                .get("status")
                .and_then(|s| s.as_str())
                .unwrap_or("")
                .to_string();

            match state.as_str() {
                "succeeded" => {
                    return match poll.get_mut("analyzeResult") {
                        Some(result) => Ok(result.take()),
                        None => Err(malformed("response has no analyzeResult".to_string())),
                    };
                }
                "failed" => {
                    let message = poll
                        .pointer("/error/message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("unknown error")
                        .to_string();
                    error!("Layout analysis failed: {}", message);
                    return Err(PipelineError::Extraction {
                        kind: ExtractionFailure::ServiceUnavailable,
                        detail: format!("analysis failed: {}", message),
                    });
                }
                other => debug!(attempt, status = other, "Layout analysis still running"),
            }
        }

        warn!(polls = self.max_polls, "Layout analysis did not finish");
        Err(PipelineError::Extraction {
            kind: ExtractionFailure::ServiceUnavailable,
            detail: format!("analysis not finished after {} polls", self.max_polls),
        })
    }
}

#[async_trait::async_trait]
impl DocumentAnalyzer for AzureDocumentAnalyzer {
    async fn analyze(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        debug!(size = bytes.len(), "Submitting document for layout analysis");

        let response = self
            .client
            .post(&self.analyze_url)
            .header("Ocp-Apim-Subscription-Key", &self.api_key)
            .header("Content-Type", "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let operation_url = response
            .headers()
            .get("Operation-Location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| malformed("no Operation-Location in response".to_string()))?
            .to_string();

        self.poll(&operation_url).await
    }
}

/// Map an HTTP status from the service to a failure kind
pub fn failure_for_status(status: StatusCode) -> ExtractionFailure {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ExtractionFailure::QuotaExceeded,
        StatusCode::BAD_REQUEST | StatusCode::UNSUPPORTED_MEDIA_TYPE => {
            ExtractionFailure::UnsupportedFormat
        }
        _ => ExtractionFailure::ServiceUnavailable,
    }
}

fn status_error(status: StatusCode, body: String) -> PipelineError {
    error!(%status, "Document intelligence error response: {}", body);
    PipelineError::Extraction {
        kind: failure_for_status(status),
        detail: format!("{}: {}", status, body),
    }
}

fn transport_error(e: reqwest::Error) -> PipelineError {
    error!("Document intelligence request failed: {}", e);
    PipelineError::Extraction {
        kind: ExtractionFailure::ServiceUnavailable,
        detail: e.to_string(),
    }
}

fn malformed(detail: String) -> PipelineError {
    PipelineError::Extraction {
        kind: ExtractionFailure::MalformedResponse,
        detail,
    }
}
