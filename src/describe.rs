//! The describer: one explicit context that owns the whole pipeline.
//!
//! A [`Describer`] holds exactly one tracker, one request queue, one
//! converter and one description service. Nothing is global, so a host can
//! run one per page and tests can run many side by side.
//!
//! ## Per-image flow
//!
//! ```text
//! processed? ── yes ─▶ alt still ours? ── yes ─▶ Skipped(AlreadyProcessed)
//!     │                      └─ no ─▶ re-apply stored text ─▶ Restored
//!     no
//! claim in-flight ── taken ─▶ Skipped(InFlight)
//!     │
//! convert ─▶ size check ── too big ─▶ Skipped(TooLarge)
//!     │
//! queue ─▶ describe (retry) ─▶ mark processed ─▶ write alt/title ─▶ Described
//! ```
//!
//! Every failure is returned for that image only. The in-flight claim is
//! released on every exit path. Once the payload is queued the claim travels
//! with the request: a caller that stops waiting does not release the image
//! while its request is still queued or running, and a request that
//! completes after its caller left still records the description.

use crate::candidate::CandidateImage;
use crate::config::DescriberConfig;
use crate::error::{AltTextError, ImageError};
use crate::identity::ImageIdentity;
use crate::pipeline::client::{
    describe_with_retry, DescriptionService, HttpDescriptionClient, RetryPolicy,
};
use crate::pipeline::convert::Converter;
use crate::pipeline::encode::EncodedImage;
use crate::pipeline::proxy::{spawn_background_proxy, PrivilegedFetcher, ProxyHandle};
use crate::progress::ProgressCallback;
use crate::queue::{QueueStats, RequestQueue};
use crate::tracker::{DedupTracker, TrackerStats};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Why an image was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// Already described on this page.
    AlreadyProcessed,
    /// Another caller is converting or describing the same image.
    InFlight,
    /// The encoded payload exceeds the configured ceiling.
    TooLarge { bytes: u64, limit: u64 },
}

/// Terminal result of processing one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    /// A fresh description was written back.
    Described(String),
    /// The stored description was written back again without a request.
    Restored(String),
    /// Nothing was sent.
    Skipped(SkipReason),
}

/// One image's outcome inside a batch.
#[derive(Debug)]
pub struct ImageOutcome {
    pub locator: String,
    pub result: Result<Outcome, ImageError>,
}

/// Aggregate result of [`Describer::process_batch`].
#[derive(Debug, Default)]
pub struct BatchReport {
    pub total: usize,
    pub described: usize,
    pub restored: usize,
    pub skipped: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub outcomes: Vec<ImageOutcome>,
}

/// Combined tracker and queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DescriberStats {
    pub tracker: TrackerStats,
    pub queue: QueueStats,
}

/// Pipeline context for one page.
pub struct Describer {
    config: DescriberConfig,
    tracker: Arc<DedupTracker>,
    queue: RequestQueue,
    converter: Converter,
    service: Arc<dyn DescriptionService>,
    retry: RetryPolicy,
    background_proxy: Option<ProxyHandle>,
    progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for Describer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Describer")
            .field("config", &self.config)
            .field("tracker", &self.tracker.get_stats())
            .field("queue", &self.queue.get_stats())
            .field("service", &"<dyn DescriptionService>")
            .finish()
    }
}

impl Describer {
    /// Build a describer that talks HTTP to `config.endpoint` and uses the
    /// built-in background proxy.
    ///
    /// Must be called inside a Tokio runtime: the proxy task is spawned here.
    pub fn new(config: DescriberConfig) -> Result<Self, AltTextError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AltTextError::HttpClient(e.to_string()))?;
        let proxy_client = reqwest::Client::builder()
            .referer(false)
            .build()
            .map_err(|e| AltTextError::HttpClient(e.to_string()))?;

        let proxy = spawn_background_proxy(proxy_client, config.fetch_timeout());
        let service: Arc<dyn DescriptionService> =
            Arc::new(HttpDescriptionClient::new(client.clone(), &config));

        let mut describer = Self::assemble(config, client, service, Arc::new(proxy.clone()))?;
        describer.background_proxy = Some(proxy);
        Ok(describer)
    }

    /// Build a describer around caller-supplied collaborators.
    pub fn with_parts(
        config: DescriberConfig,
        service: Arc<dyn DescriptionService>,
        proxy: Arc<dyn PrivilegedFetcher>,
    ) -> Result<Self, AltTextError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AltTextError::HttpClient(e.to_string()))?;
        Self::assemble(config, client, service, proxy)
    }

    fn assemble(
        config: DescriberConfig,
        client: reqwest::Client,
        service: Arc<dyn DescriptionService>,
        proxy: Arc<dyn PrivilegedFetcher>,
    ) -> Result<Self, AltTextError> {
        let config = config.to_builder().build()?;
        Ok(Self {
            tracker: Arc::new(DedupTracker::new(config.element_index_capacity)),
            queue: RequestQueue::new(config.max_concurrent, config.request_delay()),
            converter: Converter::new(client, proxy, &config),
            retry: RetryPolicy::from_config(&config),
            service,
            config,
            background_proxy: None,
            progress: None,
        })
    }

    /// Attach a progress callback.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn config(&self) -> &DescriberConfig {
        &self.config
    }

    pub fn tracker(&self) -> &DedupTracker {
        &self.tracker
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn stats(&self) -> DescriberStats {
        DescriberStats {
            tracker: self.tracker.get_stats(),
            queue: self.queue.get_stats(),
        }
    }

    /// Forget every record and drop pending requests. Test and debug use.
    pub fn reset(&self) {
        self.queue.clear();
        self.tracker.clear();
    }

    /// Page teardown: stop dispatching and stop the background proxy.
    pub fn shutdown(&self) {
        self.queue.shutdown();
        if let Some(proxy) = &self.background_proxy {
            proxy.shutdown();
        }
        info!("Describer shut down: {:?}", self.stats());
    }

    /// Process one candidate image.
    ///
    /// `Ok` covers described, restored and skipped images; `Err` is a
    /// terminal failure for this image only.
    pub async fn process_image(&self, image: &dyn CandidateImage) -> Result<Outcome, ImageError> {
        let locator = image.locator();

        if self.tracker.is_processed(image) {
            return Ok(self.revisit(image));
        }
        if !self.tracker.try_mark_in_flight(image) {
            // Lost a race with a caller that just finished.
            if self.tracker.is_processed(image) {
                return Ok(self.revisit(image));
            }
            debug!("Skipping {}: already in flight", locator);
            return Ok(self.skipped(locator, SkipReason::InFlight));
        }

        let claim = InFlightClaim {
            tracker: Arc::clone(&self.tracker),
            identity: image.identity(),
        };
        if let Some(cb) = &self.progress {
            cb.on_image_start(locator);
        }

        let payload = match self.converter.convert(image).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Conversion failed for {}: {}", locator, e);
                return Err(self.failed(locator, e.into()));
            }
        };

        let size = payload.approx_decoded_len();
        let limit = self.config.max_payload_bytes();
        if size > limit {
            warn!(
                "Skipping {}: payload {} bytes exceeds {} bytes",
                locator, size, limit
            );
            drop(claim);
            return Ok(self.skipped(locator, SkipReason::TooLarge { bytes: size, limit }));
        }

        let description = match self.submit(payload, claim).await {
            Ok(description) => description,
            Err(e) => {
                warn!("Description failed for {}: {}", locator, e);
                return Err(self.failed(locator, e));
            }
        };

        // The request already recorded the description with the tracker.
        image.write_description(&description);

        info!("Described {}", locator);
        if let Some(cb) = &self.progress {
            cb.on_image_complete(locator, &description);
        }
        Ok(Outcome::Described(description))
    }

    /// Process many images; one failure never stops the others.
    ///
    /// Every image is started at once; the queue paces the actual requests.
    /// Outcomes are returned in input order.
    pub async fn process_batch<I: CandidateImage>(&self, images: &[I]) -> BatchReport {
        let start = Instant::now();
        let total = images.len();
        info!("Starting batch of {} images", total);
        if let Some(cb) = &self.progress {
            cb.on_batch_start(total);
        }

        let outcomes: Vec<ImageOutcome> = join_all(images.iter().map(|image| async move {
            ImageOutcome {
                locator: image.locator().to_string(),
                result: self.process_image(image).await,
            }
        }))
        .await;

        let mut report = BatchReport {
            total,
            ..Default::default()
        };
        for outcome in &outcomes {
            match &outcome.result {
                Ok(Outcome::Described(_)) => report.described += 1,
                Ok(Outcome::Restored(_)) => report.restored += 1,
                Ok(Outcome::Skipped(_)) => report.skipped += 1,
                Err(_) => report.failed += 1,
            }
        }
        report.outcomes = outcomes;
        report.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            "Batch complete: {}/{} described, {} skipped, {} failed, {}ms",
            report.described, total, report.skipped, report.failed, report.duration_ms
        );
        if let Some(cb) = &self.progress {
            cb.on_batch_complete(total, report.described);
        }
        report
    }

    /// Run the retrying describe call inside one queue slot.
    ///
    /// The claim is owned by the queued job, so it is released when the job
    /// finishes or is discarded, not when this caller stops waiting.
    async fn submit(
        &self,
        payload: EncodedImage,
        claim: InFlightClaim,
    ) -> Result<String, ImageError> {
        let service = Arc::clone(&self.service);
        let policy = self.retry;
        self.queue
            .submit(move || async move {
                let result = describe_with_retry(&service, &payload, policy).await;
                if let Ok(description) = &result {
                    claim.complete(description);
                }
                result
            })
            .await
    }

    /// An already processed image: re-apply the stored text if it was changed.
    fn revisit(&self, image: &dyn CandidateImage) -> Outcome {
        if self.tracker.should_reprocess(image) {
            if let Some(record) = self.tracker.processed_record(image) {
                debug!("Re-applying stored description to {}", image.locator());
                image.write_description(&record.description);
                return Outcome::Restored(record.description);
            }
        }
        self.skipped(image.locator(), SkipReason::AlreadyProcessed)
    }

    fn skipped(&self, locator: &str, reason: SkipReason) -> Outcome {
        if let Some(cb) = &self.progress {
            cb.on_image_skipped(locator, reason);
        }
        Outcome::Skipped(reason)
    }

    fn failed(&self, locator: &str, error: ImageError) -> ImageError {
        if let Some(cb) = &self.progress {
            cb.on_image_error(locator, &error.to_string());
        }
        error
    }
}

/// Ownership of one image's in-flight mark. Dropping it releases the image.
struct InFlightClaim {
    tracker: Arc<DedupTracker>,
    identity: ImageIdentity,
}

impl InFlightClaim {
    /// Record the description; this also clears the in-flight mark.
    fn complete(self, description: &str) {
        self.tracker.mark_processed_identity(self.identity, description);
    }
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.tracker.clear_in_flight_identity(self.identity);
    }
}
