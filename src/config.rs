//! Configuration for the describe pipeline.
//!
//! Every knob lives in [`DescriberConfig`], built via its
//! [`DescriberConfigBuilder`] or loaded from a JSON file. Keeping the whole
//! surface in one serialisable struct means a host can log the exact
//! settings of a run, and the CLI can layer flags over a file.

use crate::error::AltTextError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Configuration for a [`crate::Describer`].
///
/// # Example
/// ```rust
/// use edgequake_alttext::DescriberConfig;
///
/// let config = DescriberConfig::builder()
///     .endpoint("http://127.0.0.1:8000/describe")
///     .max_concurrent(2)
///     .request_delay_ms(250)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_concurrent, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriberConfig {
    /// Description service endpoint. Default: `http://127.0.0.1:8000/describe`.
    pub endpoint: String,

    /// Multipart field that carries the image bytes. Default: `image`.
    pub form_field: String,

    /// Concurrency ceiling of the request queue. Default: 3.
    ///
    /// The description service is usually a single local model; more than a
    /// handful of simultaneous requests only lengthens every response.
    pub max_concurrent: usize,

    /// Pacing delay between dispatch steps in milliseconds. Default: 500.
    ///
    /// Applied after a task finishes whenever more work is queued, even when
    /// slots are free, so a backlog never bursts into the service at once.
    pub request_delay_ms: u64,

    /// Maximum attempts per description request. Default: 3.
    pub max_retries: u32,

    /// Base backoff in milliseconds, doubled per attempt. Default: 1000.
    ///
    /// 1 s → 2 s → 4 s between attempts.
    pub retry_backoff_ms: u64,

    /// Hard timeout for one description request in milliseconds. Default: 30000.
    pub request_timeout_ms: u64,

    /// Timeout for direct and proxied image fetches in milliseconds. Default: 15000.
    pub fetch_timeout_ms: u64,

    /// Payload ceiling in megabytes; larger images are skipped. Default: 5.
    pub max_image_size_mb: u64,

    /// JPEG quality used by the render strategy, 0.0–1.0. Default: 0.8.
    pub jpeg_quality: f32,

    /// Upper bound on the element → identity accelerator index. Default: 1024.
    pub element_index_capacity: usize,
}

impl Default for DescriberConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8000/describe".to_string(),
            form_field: "image".to_string(),
            max_concurrent: 3,
            request_delay_ms: 500,
            max_retries: 3,
            retry_backoff_ms: 1000,
            request_timeout_ms: 30_000,
            fetch_timeout_ms: 15_000,
            max_image_size_mb: 5,
            jpeg_quality: 0.8,
            element_index_capacity: 1024,
        }
    }
}

impl DescriberConfig {
    /// Create a new builder for `DescriberConfig`.
    pub fn builder() -> DescriberConfigBuilder {
        DescriberConfigBuilder {
            config: Self::default(),
        }
    }

    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, AltTextError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| AltTextError::ManifestRead {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| AltTextError::ManifestRead {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Builder seeded with this config, for layering overrides.
    pub fn to_builder(&self) -> DescriberConfigBuilder {
        DescriberConfigBuilder {
            config: self.clone(),
        }
    }

    /// Payload ceiling in bytes.
    pub fn max_payload_bytes(&self) -> u64 {
        self.max_image_size_mb.saturating_mul(BYTES_PER_MB)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// JPEG quality on the encoder's 1–100 scale.
    pub fn jpeg_quality_percent(&self) -> u8 {
        (self.jpeg_quality.clamp(0.01, 1.0) * 100.0).round() as u8
    }

    fn validate(&self) -> Result<(), AltTextError> {
        if self.endpoint.trim().is_empty() {
            return Err(AltTextError::InvalidConfig("endpoint must not be empty".into()));
        }
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(AltTextError::InvalidConfig(format!(
                "endpoint must be an HTTP/HTTPS URL, got '{}'",
                self.endpoint
            )));
        }
        if self.form_field.is_empty() {
            return Err(AltTextError::InvalidConfig("form field must not be empty".into()));
        }
        if self.max_concurrent == 0 {
            return Err(AltTextError::InvalidConfig(
                "max concurrent requests must be ≥ 1".into(),
            ));
        }
        if self.max_retries == 0 {
            return Err(AltTextError::InvalidConfig("max retries must be ≥ 1".into()));
        }
        if self.max_image_size_mb.checked_mul(BYTES_PER_MB).is_none() {
            return Err(AltTextError::InvalidConfig(format!(
                "max image size of {} MB does not fit in a byte count",
                self.max_image_size_mb
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(AltTextError::InvalidConfig("request timeout must be > 0".into()));
        }
        if !(self.jpeg_quality > 0.0 && self.jpeg_quality <= 1.0) {
            return Err(AltTextError::InvalidConfig(format!(
                "JPEG quality must be in (0, 1], got {}",
                self.jpeg_quality
            )));
        }
        Ok(())
    }
}

/// Builder for [`DescriberConfig`].
#[derive(Debug)]
pub struct DescriberConfigBuilder {
    config: DescriberConfig,
}

impl DescriberConfigBuilder {
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.config.endpoint = url.into();
        self
    }

    pub fn form_field(mut self, name: impl Into<String>) -> Self {
        self.config.form_field = name.into();
        self
    }

    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.config.max_concurrent = n.max(1);
        self
    }

    pub fn request_delay_ms(mut self, ms: u64) -> Self {
        self.config.request_delay_ms = ms;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n.max(1);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.request_timeout_ms = ms;
        self
    }

    pub fn fetch_timeout_ms(mut self, ms: u64) -> Self {
        self.config.fetch_timeout_ms = ms;
        self
    }

    pub fn max_image_size_mb(mut self, mb: u64) -> Self {
        self.config.max_image_size_mb = mb;
        self
    }

    pub fn jpeg_quality(mut self, q: f32) -> Self {
        self.config.jpeg_quality = q.clamp(0.01, 1.0);
        self
    }

    pub fn element_index_capacity(mut self, n: usize) -> Self {
        self.config.element_index_capacity = n;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<DescriberConfig, AltTextError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
