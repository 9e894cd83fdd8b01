//! Payload encoding: every strategy ends in the same base64 data-URL form.
//!
//! The description service only ever receives image bytes, but carrying the
//! payload as `data:<mime>;base64,<data>` between stages means an image whose
//! locator is already inline can skip conversion entirely, and the proxy
//! collaborator can answer with a single string. Inline locators that carry
//! percent-encoded bytes (`data:image/svg+xml,%3Csvg…`) are normalised to
//! base64 on the way in.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

static RE_DATA_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^data:(?P<mime>[A-Za-z0-9.+-]+/[A-Za-z0-9.+-]+)(?:;[^;,]+)*?(?P<base64>;base64)?,(?P<data>.*)$")
        .unwrap()
});

static RE_BASE64: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9+/]*={0,2}$").unwrap());

/// A base64 image payload plus its MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub mime_type: String,
    pub data: String,
}

impl EncodedImage {
    pub fn new(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// Base64-encode raw bytes.
    pub fn from_bytes(bytes: &[u8], mime_type: impl Into<String>) -> Self {
        Self::new(STANDARD.encode(bytes), mime_type)
    }

    /// Parse a `data:<mime>[;params][;base64],<data>` URL.
    ///
    /// A body without the `;base64` marker is percent-decoded and re-encoded,
    /// so the result is always base64. Returns `None` for anything else,
    /// including a base64 body with characters outside the alphabet.
    pub fn parse_data_url(url: &str) -> Option<Self> {
        let caps = RE_DATA_URL.captures(url.trim())?;
        let body = &caps["data"];
        if caps.name("base64").is_none() {
            let bytes = urlencoding::decode_binary(body.as_bytes());
            return Some(Self::from_bytes(&bytes, &caps["mime"]));
        }

        let unescaped = if body.contains('%') {
            String::from_utf8(urlencoding::decode_binary(body.as_bytes()).into_owned()).ok()?
        } else {
            body.to_string()
        };
        let data: String = unescaped.chars().filter(|c| !c.is_whitespace()).collect();
        if !RE_BASE64.is_match(&data) {
            return None;
        }
        Some(Self::new(data, &caps["mime"]))
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }

    /// Decoded size estimated from the base64 length.
    pub fn approx_decoded_len(&self) -> u64 {
        (self.data.len() as u64 * 3) / 4
    }

    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.data)
    }

    /// File extension hint for the multipart part name.
    pub fn extension(&self) -> &str {
        match self.mime_type.as_str() {
            "image/jpeg" | "image/jpg" => "jpg",
            "image/png" => "png",
            "image/gif" => "gif",
            "image/webp" => "webp",
            "image/svg+xml" => "svg",
            _ => "bin",
        }
    }
}

/// True when the locator already carries the image inline.
pub fn is_data_url(locator: &str) -> bool {
    locator.trim_start().starts_with("data:")
}

/// Encode a raster as JPEG at `quality` (1–100).
///
/// JPEG has no alpha channel, so the image is flattened to RGB first.
pub fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<EncodedImage, image::ImageError> {
    let rgb = img.to_rgb8();
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100)).encode_image(&rgb)?;

    let encoded = EncodedImage::from_bytes(&buf, "image/jpeg");
    debug!(
        "Encoded {}x{} raster → {} bytes base64",
        rgb.width(),
        rgb.height(),
        encoded.data.len()
    );
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn encode_small_image() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        let data = encode_jpeg(&img, 80).expect("encode should succeed");
        assert_eq!(data.mime_type, "image/jpeg");
        let decoded = data.decode().expect("valid base64");
        // JPEG SOI marker
        assert_eq!(&decoded[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn data_url_parses() {
        let e = EncodedImage::parse_data_url("data:image/png;base64,iVBORw0KGgo=").unwrap();
        assert_eq!(e.mime_type, "image/png");
        assert_eq!(e.data, "iVBORw0KGgo=");
        assert_eq!(e.to_data_url(), "data:image/png;base64,iVBORw0KGgo=");
    }

    #[test]
    fn data_url_with_parameters_parses() {
        let e = EncodedImage::parse_data_url("data:image/svg+xml;charset=utf-8;base64,PHN2Zz4=")
            .unwrap();
        assert_eq!(e.mime_type, "image/svg+xml");
        assert_eq!(e.extension(), "svg");
    }

    #[test]
    fn percent_encoded_data_url_is_normalised_to_base64() {
        let e = EncodedImage::parse_data_url("data:image/svg+xml,%3Csvg%3E%3C/svg%3E").unwrap();
        assert_eq!(e.mime_type, "image/svg+xml");
        assert_eq!(e.decode().unwrap(), b"<svg></svg>");

        let e = EncodedImage::parse_data_url("data:image/svg+xml;charset=utf-8,<svg/>").unwrap();
        assert_eq!(e.decode().unwrap(), b"<svg/>");
    }

    #[test]
    fn malformed_data_urls_are_rejected() {
        assert!(EncodedImage::parse_data_url("https://example.com/a.png").is_none());
        assert!(EncodedImage::parse_data_url("data:image/png;base64").is_none());
        assert!(EncodedImage::parse_data_url("data:image/png;base64,not*base64").is_none());
        assert!(EncodedImage::parse_data_url("data:,plain").is_none());
    }

    #[test]
    fn wrapped_base64_body_is_unwrapped() {
        let e = EncodedImage::parse_data_url("data:image/png;base64,iVBO\nRw0K\nGgo=").unwrap();
        assert_eq!(e.data, "iVBORw0KGgo=");
    }

    #[test]
    fn approx_size_matches_decoded_length() {
        let bytes = vec![7u8; 3000];
        let e = EncodedImage::from_bytes(&bytes, "image/png");
        assert_eq!(e.approx_decoded_len(), 3000);
    }
}
