//! # edgequake-alttext
//!
//! Generate alt text for page images with a local vision-description service.
//!
//! ## Why this crate?
//!
//! Pages are full of images with missing or useless alt text. A local vision
//! model can describe them, but it is slow, it fails now and then, and the
//! same image shows up many times on one page. This crate turns each
//! candidate image into a payload, sends it to the service through a paced
//! queue with retries, and writes the answer back exactly once per image.
//!
//! ## Pipeline Overview
//!
//! ```text
//! candidate image
//!  │
//!  ├─ 1. Dedup     skip processed / in-flight images (tracker)
//!  ├─ 2. Convert   render → fetch → proxy, first success wins
//!  ├─ 3. Check     estimated payload size against the ceiling
//!  ├─ 4. Queue     FIFO, bounded concurrency, pacing delay
//!  ├─ 5. Describe  multipart POST, timeout, retry with backoff
//!  └─ 6. Write     alt + title, record as processed
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_alttext::{Describer, DescriberConfig, PageImage, CandidateImage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DescriberConfig::builder()
//!         .endpoint("http://127.0.0.1:8000/describe")
//!         .max_concurrent(2)
//!         .build()?;
//!     let describer = Describer::new(config)?;
//!
//!     let image = PageImage::new("https://example.com/chart.png", 800, 600);
//!     describer.process_image(&image).await?;
//!     println!("{:?}", image.alt_text());
//!
//!     describer.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `alttext` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-alttext = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod candidate;
pub mod config;
pub mod describe;
pub mod error;
pub mod identity;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod stream;
pub mod tracker;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use candidate::{read_manifest, CandidateImage, ManifestEntry, PageImage, Raster};
pub use config::{DescriberConfig, DescriberConfigBuilder};
pub use describe::{BatchReport, Describer, DescriberStats, ImageOutcome, Outcome, SkipReason};
pub use error::{
    AltTextError, ClientError, ConversionError, ImageError, TaskDiscarded, TaskPanicked,
};
pub use identity::{ElementArena, ElementKey, ImageIdentity};
pub use pipeline::client::{DescriptionService, HttpDescriptionClient, RetryPolicy};
pub use pipeline::encode::EncodedImage;
pub use pipeline::proxy::{
    spawn_background_proxy, PrivilegedFetcher, ProxyHandle, ProxyRequest, ProxyResponse,
};
pub use progress::{DescribeProgressCallback, NoopProgressCallback, ProgressCallback};
pub use queue::{QueueStats, RequestQueue};
pub use stream::{describe_stream, describe_stream_ordered, ImageResult, ImageStream};
pub use tracker::{DedupTracker, ProcessedRecord, TrackerStats};
