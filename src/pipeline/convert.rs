//! Converter: candidate image → encoded payload, via an ordered fallback chain.
//!
//! | Order | Strategy | Cost | Typical refusal |
//! |-------|----------|------|-----------------|
//! | 1 | `render` | CPU only | cross-origin taint, no raster |
//! | 2 | `fetch`  | one GET | 403, CORS-style refusal, HTML error page |
//! | 3 | `proxy`  | message round trip + GET | resource gone or not an image |
//!
//! A refusal is logged at debug level and the next strategy runs. Only when
//! all of them refuse does the image fail with [`ConversionError::Exhausted`].

use crate::candidate::CandidateImage;
use crate::config::DescriberConfig;
use crate::error::{ConversionError, StrategyFailure};
use crate::pipeline::encode::{is_data_url, EncodedImage};
use crate::pipeline::fetch::fetch_image;
use crate::pipeline::proxy::{PrivilegedFetcher, ProxyRequest};
use crate::pipeline::render::render_raster;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Turns candidate images into payloads.
pub struct Converter {
    client: reqwest::Client,
    proxy: Arc<dyn PrivilegedFetcher>,
    fetch_timeout: Duration,
    quality: u8,
}

impl std::fmt::Debug for Converter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converter")
            .field("proxy", &"<dyn PrivilegedFetcher>")
            .field("fetch_timeout", &self.fetch_timeout)
            .field("quality", &self.quality)
            .finish()
    }
}

impl Converter {
    pub fn new(
        client: reqwest::Client,
        proxy: Arc<dyn PrivilegedFetcher>,
        config: &DescriberConfig,
    ) -> Self {
        Self {
            client,
            proxy,
            fetch_timeout: config.fetch_timeout(),
            quality: config.jpeg_quality_percent(),
        }
    }

    /// Convert `image`, trying each strategy in order.
    pub async fn convert(&self, image: &dyn CandidateImage) -> Result<EncodedImage, ConversionError> {
        let locator = image.locator();
        let (width, height) = image.natural_size();

        if locator.trim().is_empty() {
            return Err(invalid(locator, "empty locator"));
        }
        if width == 0 || height == 0 {
            return Err(invalid(locator, &format!("zero natural size {width}x{height}")));
        }

        if is_data_url(locator) {
            return EncodedImage::parse_data_url(locator)
                .ok_or_else(|| invalid(locator, "malformed inline data URL"));
        }

        let mut failures = Vec::with_capacity(3);

        match render_raster(image.raster(), width, height, self.quality).await {
            Ok(payload) => return Ok(payload),
            Err(e) => failures.push(refusal("render", locator, e.to_string())),
        }

        match fetch_image(&self.client, locator, self.fetch_timeout).await {
            Ok(payload) => return Ok(payload),
            Err(e) => failures.push(refusal("fetch", locator, e)),
        }

        let reply = self
            .proxy
            .request(ProxyRequest::ConvertImage {
                url: locator.to_string(),
            })
            .await;
        match reply.into_payload() {
            Ok(payload) => return Ok(payload),
            Err(e) => failures.push(refusal("proxy", locator, e)),
        }

        Err(ConversionError::Exhausted {
            locator: locator.to_string(),
            failures,
        })
    }
}

fn invalid(locator: &str, reason: &str) -> ConversionError {
    ConversionError::InvalidImage {
        locator: locator.to_string(),
        reason: reason.to_string(),
    }
}

fn refusal(strategy: &'static str, locator: &str, detail: String) -> StrategyFailure {
    debug!("{} declined {}: {}", strategy, locator, detail);
    StrategyFailure { strategy, detail }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{PageImage, Raster};
    use crate::pipeline::proxy::ProxyResponse;
    use async_trait::async_trait;
    use image::{DynamicImage, Rgba, RgbaImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProxy {
        reply: ProxyResponse,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PrivilegedFetcher for FakeProxy {
        async fn request(&self, _request: ProxyRequest) -> ProxyResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone()
        }
    }

    fn converter(reply: ProxyResponse) -> (Converter, Arc<FakeProxy>) {
        let proxy = Arc::new(FakeProxy {
            reply,
            calls: AtomicUsize::new(0),
        });
        let config = DescriberConfig::builder().fetch_timeout_ms(500).build().unwrap();
        (
            Converter::new(reqwest::Client::new(), proxy.clone(), &config),
            proxy,
        )
    }

    #[tokio::test]
    async fn inline_data_is_returned_unchanged() {
        let (c, proxy) = converter(ProxyResponse::err("unused"));
        let img = PageImage::new("data:image/png;base64,iVBORw0KGgo=", 1, 1);
        let out = c.convert(&img).await.unwrap();
        assert_eq!(out.to_data_url(), "data:image/png;base64,iVBORw0KGgo=");
        assert_eq!(proxy.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn percent_encoded_inline_svg_is_converted_locally() {
        let (c, proxy) = converter(ProxyResponse::err("unused"));
        let img = PageImage::new("data:image/svg+xml,%3Csvg%20width%3D%221%22%2F%3E", 1, 1);
        let out = c.convert(&img).await.unwrap();
        assert_eq!(out.mime_type, "image/svg+xml");
        assert_eq!(out.decode().unwrap(), br#"<svg width="1"/>"#);
        assert_eq!(proxy.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn zero_size_is_rejected_up_front() {
        let (c, _) = converter(ProxyResponse::err("unused"));
        let img = PageImage::new("https://example.com/a.png", 0, 10);
        assert!(matches!(
            c.convert(&img).await,
            Err(ConversionError::InvalidImage { .. })
        ));
    }

    #[tokio::test]
    async fn readable_raster_wins_without_network() {
        let (c, proxy) = converter(ProxyResponse::err("unused"));
        let raster = Raster::Decoded(Arc::new(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            6,
            6,
            Rgba([10, 20, 30, 255]),
        ))));
        let img = PageImage::new("blob:https://example.com/1", 6, 6).with_raster(raster);
        let out = c.convert(&img).await.unwrap();
        assert_eq!(out.mime_type, "image/jpeg");
        assert_eq!(proxy.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn proxy_is_the_last_resort() {
        let (c, proxy) = converter(ProxyResponse::ok("data:image/webp;base64,UklGRg==".into()));
        // Tainted raster and a non-HTTP locator make the first two strategies refuse.
        let img = PageImage::new("blob:https://example.com/2", 6, 6).with_raster(Raster::Tainted);
        let out = c.convert(&img).await.unwrap();
        assert_eq!(out.mime_type, "image/webp");
        assert_eq!(proxy.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn all_refusals_are_reported_in_order() {
        let (c, _) = converter(ProxyResponse::err("HTTP 404"));
        let img = PageImage::new("blob:https://example.com/3", 6, 6);
        match c.convert(&img).await {
            Err(ConversionError::Exhausted { failures, .. }) => {
                let order: Vec<_> = failures.iter().map(|f| f.strategy).collect();
                assert_eq!(order, vec!["render", "fetch", "proxy"]);
                assert_eq!(failures[2].detail, "HTTP 404");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }
}
