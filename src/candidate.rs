//! Candidate images: what the detection side hands to the pipeline.
//!
//! The pipeline only needs to read a locator, natural size and the current
//! alt text, optionally see the already-decoded raster, and write the
//! description back. [`CandidateImage`] captures exactly that; [`PageImage`]
//! is the in-memory implementation used by the CLI and by hosts that do not
//! bring their own element type.

use crate::error::AltTextError;
use crate::identity::{ElementKey, ImageIdentity};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// What the in-process renderer can see of an image.
#[derive(Debug, Clone, Default)]
pub enum Raster {
    /// The pixels are not loaded in this process.
    #[default]
    Unavailable,
    /// Loaded, but cross-origin policy forbids reading the pixels back.
    Tainted,
    /// Decoded pixels, readable.
    Decoded(Arc<DynamicImage>),
}

/// An image the detection collaborator considers worth describing.
pub trait CandidateImage: Send + Sync {
    /// Resource locator (`https://…`, `data:…`).
    fn locator(&self) -> &str;

    /// Natural pixel dimensions `(width, height)`.
    fn natural_size(&self) -> (u32, u32);

    /// Current accessible text, if any.
    fn alt_text(&self) -> Option<String>;

    /// Write the description into the accessible-text and tooltip fields.
    fn write_description(&self, description: &str);

    /// The live element's key, when the host tracks elements.
    fn element_key(&self) -> Option<ElementKey> {
        None
    }

    fn raster(&self) -> Raster {
        Raster::Unavailable
    }

    fn identity(&self) -> ImageIdentity {
        let (w, h) = self.natural_size();
        ImageIdentity::new(self.locator(), w, h)
    }
}

#[derive(Debug, Default)]
struct TextFields {
    alt: Option<String>,
    title: Option<String>,
}

/// In-memory candidate image.
#[derive(Debug)]
pub struct PageImage {
    locator: String,
    width: u32,
    height: u32,
    key: Option<ElementKey>,
    raster: Raster,
    text: Mutex<TextFields>,
}

impl PageImage {
    pub fn new(locator: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            locator: locator.into(),
            width,
            height,
            key: None,
            raster: Raster::Unavailable,
            text: Mutex::new(TextFields::default()),
        }
    }

    pub fn with_alt(self, alt: impl Into<String>) -> Self {
        self.fields().alt = Some(alt.into());
        self
    }

    pub fn with_element_key(mut self, key: ElementKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_raster(mut self, raster: Raster) -> Self {
        self.raster = raster;
        self
    }

    pub fn title(&self) -> Option<String> {
        self.fields().title.clone()
    }

    /// Overwrite the alt text as some other script on the page would.
    pub fn set_alt(&self, alt: Option<String>) {
        self.fields().alt = alt;
    }

    fn fields(&self) -> MutexGuard<'_, TextFields> {
        self.text.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CandidateImage for PageImage {
    fn locator(&self) -> &str {
        &self.locator
    }

    fn natural_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn alt_text(&self) -> Option<String> {
        self.fields().alt.clone()
    }

    fn write_description(&self, description: &str) {
        let mut fields = self.fields();
        fields.alt = Some(description.to_string());
        fields.title = Some(description.to_string());
    }

    fn element_key(&self) -> Option<ElementKey> {
        self.key
    }

    fn raster(&self) -> Raster {
        self.raster.clone()
    }
}

impl<T: CandidateImage + ?Sized> CandidateImage for Arc<T> {
    fn locator(&self) -> &str {
        (**self).locator()
    }

    fn natural_size(&self) -> (u32, u32) {
        (**self).natural_size()
    }

    fn alt_text(&self) -> Option<String> {
        (**self).alt_text()
    }

    fn write_description(&self, description: &str) {
        (**self).write_description(description)
    }

    fn element_key(&self) -> Option<ElementKey> {
        (**self).element_key()
    }

    fn raster(&self) -> Raster {
        (**self).raster()
    }

    fn identity(&self) -> ImageIdentity {
        (**self).identity()
    }
}

/// One entry of a JSON manifest produced by a detection pass.
///
/// ```json
/// [{"src": "https://example.com/a.jpg", "width": 640, "height": 480}]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub src: String,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
}

impl From<ManifestEntry> for PageImage {
    fn from(entry: ManifestEntry) -> Self {
        let image = PageImage::new(entry.src, entry.width, entry.height);
        match entry.alt {
            Some(alt) => image.with_alt(alt),
            None => image,
        }
    }
}

/// Read a JSON manifest (`[ManifestEntry, …]`) from disk.
pub async fn read_manifest(path: impl AsRef<Path>) -> Result<Vec<ManifestEntry>, AltTextError> {
    let path = path.as_ref();
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| AltTextError::ManifestRead {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
    serde_json::from_str(&raw).map_err(|e| AltTextError::ManifestRead {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}
