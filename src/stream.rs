//! Streaming API: emit per-image outcomes as they complete.
//!
//! [`crate::Describer::process_batch`] returns only after every image has an
//! outcome. [`describe_stream`] yields each `(locator, result)` pair as soon
//! as it is ready, so a host can update the page or a progress display
//! incrementally. Items arrive in completion order; use
//! [`describe_stream_ordered`] when input order matters.

use crate::candidate::CandidateImage;
use crate::describe::{Describer, Outcome};
use crate::error::ImageError;
use futures::stream::{self, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;
use tracing::info;

/// One streamed item: the image locator and its outcome.
pub type ImageResult = (String, Result<Outcome, ImageError>);

/// A boxed stream of per-image outcomes.
pub type ImageStream = Pin<Box<dyn Stream<Item = ImageResult> + Send>>;

/// Describe `images`, yielding outcomes in completion order.
///
/// All images are started together; the describer's queue still bounds how
/// many description requests are active.
///
/// # Example
/// ```rust,no_run
/// use edgequake_alttext::{describe_stream, CandidateImage, Describer, DescriberConfig, PageImage};
/// use futures::StreamExt;
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let describer = Arc::new(Describer::new(DescriberConfig::default())?);
/// let images: Vec<Arc<dyn CandidateImage>> =
///     vec![Arc::new(PageImage::new("https://example.com/cat.jpg", 640, 480))];
/// let mut stream = describe_stream(describer, images);
/// while let Some((locator, result)) = stream.next().await {
///     match result {
///         Ok(outcome) => println!("{locator}: {outcome:?}"),
///         Err(e) => eprintln!("{locator}: {e}"),
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub fn describe_stream(
    describer: Arc<Describer>,
    images: Vec<Arc<dyn CandidateImage>>,
) -> ImageStream {
    let width = images.len().max(1);
    info!("Streaming {} images", images.len());

    let s = stream::iter(images.into_iter().map(move |image| {
        let describer = Arc::clone(&describer);
        async move {
            let result = describer.process_image(image.as_ref()).await;
            (image.locator().to_string(), result)
        }
    }))
    .buffer_unordered(width);

    Box::pin(s)
}

/// Like [`describe_stream`], but yields outcomes in input order.
pub fn describe_stream_ordered(
    describer: Arc<Describer>,
    images: Vec<Arc<dyn CandidateImage>>,
) -> ImageStream {
    let width = images.len().max(1);

    let s = stream::iter(images.into_iter().map(move |image| {
        let describer = Arc::clone(&describer);
        async move {
            let result = describer.process_image(image.as_ref()).await;
            (image.locator().to_string(), result)
        }
    }))
    .buffered(width);

    Box::pin(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::PageImage;
    use crate::config::DescriberConfig;
    use crate::error::ClientError;
    use crate::pipeline::client::DescriptionService;
    use crate::pipeline::encode::EncodedImage;
    use crate::pipeline::proxy::{PrivilegedFetcher, ProxyRequest, ProxyResponse};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Answers slowly for PNG payloads and at once for everything else.
    struct SlowPng;

    #[async_trait]
    impl DescriptionService for SlowPng {
        async fn describe(&self, payload: &EncodedImage) -> Result<String, ClientError> {
            if payload.mime_type == "image/png" {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok(payload.mime_type.clone())
        }
    }

    struct NoProxy;

    #[async_trait]
    impl PrivilegedFetcher for NoProxy {
        async fn request(&self, _request: ProxyRequest) -> ProxyResponse {
            ProxyResponse::err("unavailable")
        }
    }

    fn describer() -> Arc<Describer> {
        let config = DescriberConfig::builder()
            .max_concurrent(2)
            .request_delay_ms(0)
            .build()
            .unwrap();
        Arc::new(Describer::with_parts(config, Arc::new(SlowPng), Arc::new(NoProxy)).unwrap())
    }

    fn images() -> Vec<Arc<dyn CandidateImage>> {
        vec![
            Arc::new(PageImage::new("data:image/png;base64,AAAA", 4, 4)),
            Arc::new(PageImage::new("data:image/gif;base64,AAAA", 4, 4)),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn unordered_stream_yields_fast_results_first() {
        let out: Vec<ImageResult> = describe_stream(describer(), images()).collect().await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].0, "data:image/gif;base64,AAAA");
        assert_eq!(out[1].1.as_ref().unwrap(), &Outcome::Described("image/png".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn ordered_stream_keeps_input_order() {
        let out: Vec<ImageResult> = describe_stream_ordered(describer(), images()).collect().await;
        let locators: Vec<_> = out.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(
            locators,
            vec!["data:image/png;base64,AAAA", "data:image/gif;base64,AAAA"]
        );
    }

    #[tokio::test]
    async fn empty_input_ends_immediately() {
        let out: Vec<ImageResult> = describe_stream(describer(), Vec::new()).collect().await;
        assert!(out.is_empty());
    }
}
