//! Description service interaction: one multipart POST per image.
//!
//! This module turns an encoded payload into a description string and is
//! intentionally thin. [`HttpDescriptionClient`] makes exactly one attempt;
//! the retry loop lives in [`describe_with_retry`] so the queue can run the
//! whole retrying call inside a single slot.
//!
//! ## Retry Strategy
//!
//! Timeouts, 5xx responses and malformed bodies are usually transient on a
//! local model server (still loading, overloaded). Exponential backoff
//! (`retry_backoff_ms * 2^(attempt-1)`) spaces attempts 1 s → 2 s → 4 s.
//! A 4xx response means the request itself is wrong, so retrying cannot
//! help and the loop stops at once. 408 and 429 are the exceptions: the
//! server timed out or is shedding load, so they are retried like a 5xx.

use crate::config::DescriberConfig;
use crate::error::{ClientError, ImageError};
use crate::pipeline::encode::EncodedImage;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Something that can describe an encoded image.
#[async_trait]
pub trait DescriptionService: Send + Sync {
    async fn describe(&self, payload: &EncodedImage) -> Result<String, ClientError>;
}

/// Success body of the description service.
#[derive(Debug, Deserialize)]
struct DescribeResponse {
    description: String,
}

/// HTTP client for the description service.
#[derive(Debug, Clone)]
pub struct HttpDescriptionClient {
    client: reqwest::Client,
    endpoint: String,
    form_field: String,
    timeout: Duration,
}

impl HttpDescriptionClient {
    pub fn new(client: reqwest::Client, config: &DescriberConfig) -> Self {
        Self {
            client,
            endpoint: config.endpoint.clone(),
            form_field: config.form_field.clone(),
            timeout: config.request_timeout(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, payload: &EncodedImage) -> Result<String, ClientError> {
        let bytes = payload.decode().map_err(|e| ClientError::BadRequest {
            status: 0,
            detail: format!("payload is not valid base64: {e}"),
        })?;
        let part = Part::bytes(bytes)
            .file_name(format!("image.{}", payload.extension()))
            .mime_str(&payload.mime_type)
            .map_err(|e| ClientError::BadRequest {
                status: 0,
                detail: format!("invalid MIME type '{}': {e}", payload.mime_type),
            })?;
        let form = Form::new().part(self.form_field.clone(), part);

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ClientError::ServiceError {
                status: e.status().map(|s| s.as_u16()),
                detail: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let body = response.text().await.map_err(|e| ClientError::ServiceError {
            status: Some(status.as_u16()),
            detail: e.to_string(),
        })?;
        parse_description(&body)
    }
}

#[async_trait]
impl DescriptionService for HttpDescriptionClient {
    async fn describe(&self, payload: &EncodedImage) -> Result<String, ClientError> {
        // The timeout covers the whole exchange; dropping the future aborts
        // the in-flight request.
        match tokio::time::timeout(self.timeout, self.post(payload)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout {
                ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

/// Map a non-success status to its retry class.
fn classify_status(status: StatusCode, body: &str) -> ClientError {
    let detail = truncate(body, 200);
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => ClientError::ServiceError {
            status: Some(status.as_u16()),
            detail,
        },
        s if s.is_client_error() => ClientError::BadRequest {
            status: s.as_u16(),
            detail,
        },
        s => ClientError::ServiceError {
            status: Some(s.as_u16()),
            detail,
        },
    }
}

/// Validate the body shape: a JSON object whose `description` is a string.
fn parse_description(body: &str) -> Result<String, ClientError> {
    serde_json::from_str::<DescribeResponse>(body)
        .map(|r| r.description)
        .map_err(|e| ClientError::InvalidResponseFormat {
            detail: e.to_string(),
        })
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}\u{2026}", &s[..idx]),
        None => s.to_string(),
    }
}

/// Retry settings for [`describe_with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Wait before the second attempt; doubles after that.
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DescriberConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    /// Wait before `attempt` (1-based); zero before the first.
    pub fn backoff_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(attempt - 2))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1000),
        }
    }
}

/// Describe `payload`, retrying transient failures with exponential backoff.
///
/// Non-retryable errors stop immediately. When every attempt fails the last
/// error is embedded in [`ImageError::DescriptionFailed`].
pub async fn describe_with_retry(
    service: &Arc<dyn DescriptionService>,
    payload: &EncodedImage,
    policy: RetryPolicy,
) -> Result<String, ImageError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match service.describe(payload).await {
            Ok(description) => {
                debug!("Description received on attempt {}", attempt);
                return Ok(description);
            }
            Err(e) if !e.is_retryable() => {
                warn!("Attempt {} failed, not retrying: {}", attempt, e);
                return Err(ImageError::DescriptionFailed {
                    attempts: attempt,
                    source: e,
                });
            }
            Err(e) if attempt >= max_attempts => {
                warn!("Attempt {}/{} failed: {}", attempt, max_attempts, e);
                return Err(ImageError::DescriptionFailed {
                    attempts: attempt,
                    source: e,
                });
            }
            Err(e) => {
                let backoff = policy.backoff_before(attempt + 1);
                warn!(
                    "Attempt {}/{} failed: {}; retrying after {}ms",
                    attempt,
                    max_attempts,
                    e,
                    backoff.as_millis()
                );
                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
