//! Privileged proxy: last-resort fetch through a background service.
//!
//! The page context cannot read many cross-origin images; a background
//! context with wider privileges can. The two talk by message passing:
//!
//! ```text
//! converter ──{type: CONVERT_IMAGE, url}──▶ background
//!           ◀──{success: true, base64}────
//!           ◀──{success: false, error}────
//! ```
//!
//! [`spawn_background_proxy`] runs that background side as a tokio task fed
//! by an mpsc channel; each request is answered on its own oneshot. Hosts with
//! a real privileged context implement [`PrivilegedFetcher`] themselves.

use crate::pipeline::encode::EncodedImage;
use crate::pipeline::fetch::{essence, is_http_url};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Request sent to the privileged collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyRequest {
    ConvertImage { url: String },
}

/// Reply from the privileged collaborator.
///
/// On success `base64` holds a data URL; on failure `error` says why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProxyResponse {
    pub fn ok(data_url: String) -> Self {
        Self {
            success: true,
            base64: Some(data_url),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            base64: None,
            error: Some(error.into()),
        }
    }

    /// Turn the reply into a payload or a failure reason.
    pub fn into_payload(self) -> Result<EncodedImage, String> {
        if !self.success {
            return Err(self
                .error
                .unwrap_or_else(|| "proxy reported failure".to_string()));
        }
        let data_url = self
            .base64
            .ok_or_else(|| "proxy reply carried no data".to_string())?;
        EncodedImage::parse_data_url(&data_url)
            .ok_or_else(|| "proxy reply is not a base64 data URL".to_string())
    }
}

/// A collaborator that can retrieve images the page context cannot.
#[async_trait]
pub trait PrivilegedFetcher: Send + Sync {
    async fn request(&self, request: ProxyRequest) -> ProxyResponse;
}

type Envelope = (ProxyRequest, oneshot::Sender<ProxyResponse>);

/// Sending side of the background proxy.
#[derive(Debug, Clone)]
pub struct ProxyHandle {
    tx: mpsc::Sender<Envelope>,
    shutdown: CancellationToken,
}

impl ProxyHandle {
    /// Stop the background task; later requests fail.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl PrivilegedFetcher for ProxyHandle {
    async fn request(&self, request: ProxyRequest) -> ProxyResponse {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send((request, reply_tx)).await.is_err() {
            return ProxyResponse::err("background proxy is not running");
        }
        reply_rx
            .await
            .unwrap_or_else(|_| ProxyResponse::err("background proxy dropped the request"))
    }
}

/// Start the background proxy on the current runtime.
pub fn spawn_background_proxy(client: reqwest::Client, timeout: Duration) -> ProxyHandle {
    let (tx, mut rx) = mpsc::channel::<Envelope>(64);
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();

    tokio::spawn(async move {
        loop {
            let (request, reply) = tokio::select! {
                _ = token.cancelled() => break,
                next = rx.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            let client = client.clone();
            tokio::spawn(async move {
                let response = handle_request(&client, request, timeout).await;
                let _ = reply.send(response);
            });
        }
        debug!("Background proxy stopped");
    });

    ProxyHandle { tx, shutdown }
}

async fn handle_request(
    client: &reqwest::Client,
    request: ProxyRequest,
    timeout: Duration,
) -> ProxyResponse {
    let ProxyRequest::ConvertImage { url } = request;
    match fetch_any(client, &url, timeout).await {
        Ok(encoded) => ProxyResponse::ok(encoded.to_data_url()),
        Err(e) => {
            warn!("Background proxy could not convert {}: {}", url, e);
            ProxyResponse::err(e)
        }
    }
}

/// Fetch without the page's content-type restriction, sniffing when needed.
async fn fetch_any(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<EncodedImage, String> {
    if !is_http_url(url) {
        return Err(format!("unsupported scheme in '{url}'"));
    }
    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("HTTP {}", response.status()));
    }
    let declared = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(essence)
        .unwrap_or_default();
    let bytes = response.bytes().await.map_err(|e| e.to_string())?;

    let mime = if declared.starts_with("image/") {
        declared
    } else {
        sniff_mime(&bytes).ok_or_else(|| "response is not a decodable image".to_string())?
    };
    Ok(EncodedImage::from_bytes(&bytes, mime))
}

/// MIME type from the image's magic bytes.
fn sniff_mime(bytes: &[u8]) -> Option<String> {
    image::guess_format(bytes)
        .ok()
        .map(|format| format.to_mime_type().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialises_with_type_tag() {
        let req = ProxyRequest::ConvertImage {
            url: "https://cdn.example.com/a.png".into(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "CONVERT_IMAGE");
        assert_eq!(json["url"], "https://cdn.example.com/a.png");
    }

    #[test]
    fn failure_reply_round_trips_error() {
        let reply: ProxyResponse =
            serde_json::from_str(r#"{"success": false, "error": "HTTP 404"}"#).unwrap();
        assert_eq!(reply.into_payload().unwrap_err(), "HTTP 404");
    }

    #[test]
    fn success_reply_yields_payload() {
        let reply = ProxyResponse::ok("data:image/gif;base64,R0lGODlh".into());
        let payload = reply.into_payload().unwrap();
        assert_eq!(payload.mime_type, "image/gif");
    }

    #[test]
    fn success_without_data_is_a_failure() {
        let reply = ProxyResponse {
            success: true,
            base64: None,
            error: None,
        };
        assert!(reply.into_payload().is_err());
    }

    #[test]
    fn png_magic_is_sniffed() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        assert_eq!(sniff_mime(&png).as_deref(), Some("image/png"));
        assert_eq!(sniff_mime(b"<html>"), None);
    }

    #[tokio::test]
    async fn stopped_proxy_reports_failure() {
        let handle = spawn_background_proxy(reqwest::Client::new(), Duration::from_secs(1));
        handle.shutdown();
        // Give the background loop a chance to observe the cancellation.
        tokio::task::yield_now().await;
        let reply = handle
            .request(ProxyRequest::ConvertImage {
                url: "https://example.invalid/a.png".into(),
            })
            .await;
        assert!(!reply.success);
    }
}
