use image::{DynamicImage, ImageFormat};
use qr_guard_common::event::DecodeError;
use std::fmt;
use std::path::Path;

use crate::frame::decode_image;

/// A still image handed in for one-shot scanning (file pick or drop).
#[derive(Clone)]
pub struct ImageUpload {
    pub name: String,
    data: Vec<u8>,
}

impl ImageUpload {
    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    pub async fn from_path(path: &Path) -> Result<Self, DecodeError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| DecodeError::Read(format!("{}: {e}", path.display())))?;
        Ok(Self::from_bytes(path.display().to_string(), data))
    }

    /// Image format sniffed from the content's magic bytes.
    pub fn format(&self) -> Option<ImageFormat> {
        image::guess_format(&self.data).ok()
    }

    /// Rejects content that is not an image, without decoding any pixels.
    pub fn check_image(&self) -> Result<ImageFormat, DecodeError> {
        self.format().ok_or(DecodeError::NotAnImage)
    }

    /// Decode the full image. Call [`check_image`](Self::check_image) first.
    pub fn load(&self) -> Result<DynamicImage, DecodeError> {
        decode_image(&self.data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for ImageUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageUpload")
            .field("name", &self.name)
            .field("bytes", &self.data.len())
            .finish()
    }
}
