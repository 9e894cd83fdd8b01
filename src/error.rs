//! Error types for the edgequake-alttext library.
//!
//! Two tiers reflect two distinct failure modes:
//!
//! * [`AltTextError`] is **fatal**: the describer cannot be built or the input
//!   cannot be read at all (bad config, HTTP client construction failed,
//!   unreadable manifest).
//!
//! * [`ImageError`] is **non-fatal**: a single image failed (every conversion
//!   strategy refused it, or the description service kept failing). Returned
//!   for that image only; every other image in the batch carries on.
//!
//! [`ConversionError`] and [`ClientError`] are the component-level errors
//! that end up wrapped inside an [`ImageError`]. `ClientError` carries its
//! retry classification in the variant itself, so the retry loop never has
//! to guess from message text.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-alttext library.
#[derive(Debug, Error)]
pub enum AltTextError {
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The shared HTTP client could not be constructed.
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),

    /// A manifest or config file could not be read or parsed.
    #[error("Failed to read '{path}': {detail}")]
    ManifestRead { path: PathBuf, detail: String },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// One strategy in the conversion fallback chain refused an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyFailure {
    pub strategy: &'static str,
    pub detail: String,
}

impl std::fmt::Display for StrategyFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.strategy, self.detail)
    }
}

/// The image could not be turned into an encoded payload.
#[derive(Debug, Clone, Error)]
pub enum ConversionError {
    /// Preconditions failed before any strategy ran.
    #[error("Image '{locator}' cannot be converted: {reason}")]
    InvalidImage { locator: String, reason: String },

    /// Every strategy in the fallback chain failed.
    #[error("All conversion strategies failed for '{locator}': {}", format_failures(.failures))]
    Exhausted {
        locator: String,
        failures: Vec<StrategyFailure>,
    },
}

fn format_failures(failures: &[StrategyFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// A single call to the description service failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// 2xx response whose body is not `{"description": <string>}`.
    #[error("Invalid API response format: {detail}")]
    InvalidResponseFormat { detail: String },

    /// No response within the request timeout; the request was aborted.
    #[error("Description request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// 4xx-class rejection of the request itself.
    #[error("Invalid request (HTTP {status}): {detail}")]
    BadRequest { status: u16, detail: String },

    /// 5xx response or transport failure.
    #[error("Description service error{}: {detail}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    ServiceError { status: Option<u16>, detail: String },
}

impl ClientError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ClientError::BadRequest { .. })
    }
}

/// The task was dropped from the request queue before it was dispatched.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Queued request was discarded before dispatch")]
pub struct TaskDiscarded;

/// The task panicked while running in its queue slot.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Queued request panicked: {detail}")]
pub struct TaskPanicked {
    pub detail: String,
}

/// A non-fatal error for a single image.
#[derive(Debug, Clone, Error)]
pub enum ImageError {
    /// No conversion strategy produced a payload.
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// The description service failed on every attempt (or refused outright).
    #[error("Description failed after {attempts} attempt(s): {source}")]
    DescriptionFailed {
        attempts: u32,
        #[source]
        source: ClientError,
    },

    /// The queue was cleared while the request was still pending.
    #[error("Request discarded before dispatch")]
    Discarded,

    /// The request task panicked; its slot was recovered.
    #[error("Description task panicked: {0}")]
    Panicked(String),
}

impl From<TaskDiscarded> for ImageError {
    fn from(_: TaskDiscarded) -> Self {
        ImageError::Discarded
    }
}

impl From<TaskPanicked> for ImageError {
    fn from(e: TaskPanicked) -> Self {
        ImageError::Panicked(e.detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_request_is_not_retryable() {
        let e = ClientError::BadRequest {
            status: 400,
            detail: "Invalid image".into(),
        };
        assert!(!e.is_retryable());
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(ClientError::Timeout { ms: 30_000 }.is_retryable());
        assert!(ClientError::ServiceError {
            status: Some(503),
            detail: "overloaded".into()
        }
        .is_retryable());
        assert!(ClientError::InvalidResponseFormat {
            detail: "missing description".into()
        }
        .is_retryable());
    }

    #[test]
    fn service_error_display_with_status() {
        let e = ClientError::ServiceError {
            status: Some(502),
            detail: "bad gateway".into(),
        };
        assert!(e.to_string().contains("HTTP 502"), "got: {e}");
    }

    #[test]
    fn service_error_display_without_status() {
        let e = ClientError::ServiceError {
            status: None,
            detail: "connection refused".into(),
        };
        let msg = e.to_string();
        assert!(!msg.contains("HTTP"), "got: {msg}");
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn exhausted_lists_every_strategy() {
        let e = ConversionError::Exhausted {
            locator: "https://cdn.example.com/a.png".into(),
            failures: vec![
                StrategyFailure {
                    strategy: "render",
                    detail: "tainted".into(),
                },
                StrategyFailure {
                    strategy: "fetch",
                    detail: "HTTP 403".into(),
                },
            ],
        };
        let msg = e.to_string();
        assert!(msg.contains("render: tainted"));
        assert!(msg.contains("fetch: HTTP 403"));
    }

    #[test]
    fn description_failed_embeds_last_error() {
        let e = ImageError::DescriptionFailed {
            attempts: 3,
            source: ClientError::Timeout { ms: 1000 },
        };
        let msg = e.to_string();
        assert!(msg.contains("3 attempt"));
        assert!(msg.contains("1000ms"));
    }
}
