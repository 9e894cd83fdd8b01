//! Direct fetch: GET the image over HTTP and encode the body.
//!
//! Next-cheapest after rendering. Servers that refuse cross-origin reads
//! refuse this too, which is why a proxy strategy follows it.

use crate::pipeline::encode::EncodedImage;
use std::time::Duration;
use tracing::{debug, info};

/// Check if the locator is fetchable over HTTP(S).
pub fn is_http_url(locator: &str) -> bool {
    locator.starts_with("http://") || locator.starts_with("https://")
}

/// Media type without parameters, lower-cased.
pub(crate) fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Fetch `url` and encode the body, requiring an `image/*` content type.
pub async fn fetch_image(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<EncodedImage, String> {
    if !is_http_url(url) {
        return Err(format!("unsupported scheme in '{url}'"));
    }
    info!("Fetching image from: {}", url);

    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                format!("timed out after {}ms", timeout.as_millis())
            } else {
                e.to_string()
            }
        })?;

    if !response.status().is_success() {
        return Err(format!("HTTP {}", response.status()));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(essence)
        .unwrap_or_default();
    if !content_type.starts_with("image/") {
        return Err(format!("not an image (content-type '{content_type}')"));
    }

    let bytes = response.bytes().await.map_err(|e| e.to_string())?;
    debug!("Fetched {} bytes of {} from {}", bytes.len(), content_type, url);

    Ok(EncodedImage::from_bytes(&bytes, content_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_http_url() {
        assert!(is_http_url("https://example.com/a.png"));
        assert!(is_http_url("http://example.com/a.png"));
        assert!(!is_http_url("blob:https://example.com/1234"));
        assert!(!is_http_url("data:image/png;base64,AAAA"));
        assert!(!is_http_url(""));
    }

    #[test]
    fn essence_strips_parameters() {
        assert_eq!(essence("Image/PNG; charset=binary"), "image/png");
        assert_eq!(essence("text/html"), "text/html");
    }

    #[tokio::test]
    async fn non_http_locator_is_refused_without_network() {
        let client = reqwest::Client::new();
        let err = fetch_image(&client, "blob:https://example.com/1", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.contains("unsupported scheme"));
    }
}
