//! Progress-callback trait for per-image describe events.
//!
//! Attach an [`Arc<dyn DescribeProgressCallback>`] with
//! [`crate::Describer::with_progress`] to receive events as images move
//! through the pipeline. Hosts forward them wherever they like: a terminal
//! progress bar, a channel, a status overlay.
//!
//! # Example
//!
//! ```rust
//! use edgequake_alttext::DescribeProgressCallback;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct CountingCallback {
//!     described: AtomicUsize,
//! }
//!
//! impl DescribeProgressCallback for CountingCallback {
//!     fn on_image_complete(&self, locator: &str, description: &str) {
//!         self.described.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{locator}: {description}");
//!     }
//! }
//! ```

use crate::describe::SkipReason;
use std::sync::Arc;

/// Called by the describer as it processes each image.
///
/// Images are processed concurrently, so methods may be called from
/// different tasks at once; protect shared state accordingly. Every method
/// has a no-op default.
pub trait DescribeProgressCallback: Send + Sync {
    /// Called once before a batch starts.
    fn on_batch_start(&self, total_images: usize) {
        let _ = total_images;
    }

    /// Called when an image has been claimed and conversion begins.
    fn on_image_start(&self, locator: &str) {
        let _ = locator;
    }

    /// Called when a description was written back.
    fn on_image_complete(&self, locator: &str, description: &str) {
        let _ = (locator, description);
    }

    /// Called when an image needed no request.
    fn on_image_skipped(&self, locator: &str, reason: SkipReason) {
        let _ = (locator, reason);
    }

    /// Called when an image failed terminally.
    fn on_image_error(&self, locator: &str, error: &str) {
        let _ = (locator, error);
    }

    /// Called once after every image in a batch has an outcome.
    fn on_batch_complete(&self, total_images: usize, described: usize) {
        let _ = (total_images, described);
    }
}

/// A no-op implementation; the default when no callback is attached.
pub struct NoopProgressCallback;

impl DescribeProgressCallback for NoopProgressCallback {}

/// Convenience alias for the stored callback type.
pub type ProgressCallback = Arc<dyn DescribeProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        skips: AtomicUsize,
        errors: AtomicUsize,
    }

    impl DescribeProgressCallback for TrackingCallback {
        fn on_image_start(&self, _locator: &str) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_image_complete(&self, _locator: &str, _description: &str) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_image_skipped(&self, _locator: &str, _reason: SkipReason) {
            self.skips.fetch_add(1, Ordering::SeqCst);
        }

        fn on_image_error(&self, _locator: &str, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_batch_start(2);
        cb.on_image_start("a");
        cb.on_image_complete("a", "desc");
        cb.on_image_skipped("b", SkipReason::InFlight);
        cb.on_image_error("c", "boom");
        cb.on_batch_complete(2, 1);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let cb = TrackingCallback::default();
        cb.on_image_start("a");
        cb.on_image_complete("a", "a cat");
        cb.on_image_skipped(
            "b",
            SkipReason::TooLarge {
                bytes: 6_000_000,
                limit: 5_242_880,
            },
        );
        cb.on_image_start("c");
        cb.on_image_error("c", "timeout");

        assert_eq!(cb.starts.load(Ordering::SeqCst), 2);
        assert_eq!(cb.completes.load(Ordering::SeqCst), 1);
        assert_eq!(cb.skips.load(Ordering::SeqCst), 1);
        assert_eq!(cb.errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_batch_start(10);
        cb.on_image_complete("x", "y");
    }
}
