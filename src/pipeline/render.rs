//! In-process rendering: re-encode the already-decoded raster.
//!
//! This is the cheapest strategy: no network round trip at all. It only works
//! when the host process can read the pixels back, which cross-origin policy
//! often forbids. A tainted or missing raster is an expected outcome that
//! sends the converter on to the next strategy.
//!
//! Resizing and JPEG encoding are CPU-bound, so they run inside
//! `spawn_blocking` to keep the async workers free.

use crate::candidate::Raster;
use crate::pipeline::encode::{encode_jpeg, EncodedImage};
use image::imageops::FilterType;
use image::DynamicImage;
use std::sync::Arc;
use tracing::debug;

/// Why the render strategy declined an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// No raster is loaded in this process.
    Unavailable,
    /// Cross-origin data taints the surface.
    Tainted,
    /// Resizing or encoding failed.
    Encode(String),
}

impl std::fmt::Display for RenderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderError::Unavailable => f.write_str("renderer unavailable"),
            RenderError::Tainted => f.write_str("surface tainted by cross-origin data"),
            RenderError::Encode(detail) => write!(f, "encoding failed: {detail}"),
        }
    }
}

/// Draw `raster` at its natural size and export it as JPEG.
pub async fn render_raster(
    raster: Raster,
    width: u32,
    height: u32,
    quality: u8,
) -> Result<EncodedImage, RenderError> {
    let img = match raster {
        Raster::Decoded(img) => img,
        Raster::Tainted => return Err(RenderError::Tainted),
        Raster::Unavailable => return Err(RenderError::Unavailable),
    };

    tokio::task::spawn_blocking(move || render_blocking(&img, width, height, quality))
        .await
        .map_err(|e| RenderError::Encode(format!("render task panicked: {e}")))?
}

/// Blocking implementation of rendering.
fn render_blocking(
    img: &Arc<DynamicImage>,
    width: u32,
    height: u32,
    quality: u8,
) -> Result<EncodedImage, RenderError> {
    if img.width() == width && img.height() == height {
        return encode_jpeg(img, quality).map_err(|e| RenderError::Encode(e.to_string()));
    }

    debug!(
        "Resizing raster {}x{} → {}x{}",
        img.width(),
        img.height(),
        width,
        height
    );
    let surface = img.resize_exact(width, height, FilterType::Triangle);
    encode_jpeg(&surface, quality).map_err(|e| RenderError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn raster(w: u32, h: u32) -> Raster {
        Raster::Decoded(Arc::new(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            w,
            h,
            Rgba([0, 128, 255, 255]),
        ))))
    }

    #[tokio::test]
    async fn decoded_raster_renders_to_jpeg() {
        let out = render_raster(raster(8, 8), 8, 8, 80).await.unwrap();
        assert_eq!(out.mime_type, "image/jpeg");
    }

    #[tokio::test]
    async fn raster_is_drawn_at_natural_size() {
        let out = render_raster(raster(4, 4), 16, 12, 80).await.unwrap();
        let bytes = out.decode().unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 12));
    }

    #[tokio::test]
    async fn tainted_and_missing_rasters_decline() {
        assert_eq!(
            render_raster(Raster::Tainted, 4, 4, 80).await,
            Err(RenderError::Tainted)
        );
        assert_eq!(
            render_raster(Raster::Unavailable, 4, 4, 80).await,
            Err(RenderError::Unavailable)
        );
    }
}
