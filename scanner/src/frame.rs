use image::{DynamicImage, GrayImage};
use std::io::Cursor;

use qr_guard_common::event::DecodeError;

/// A still image handed from a frame source to the decoder.
///
/// Frames are 8-bit luma buffers; colour is irrelevant to QR decoding.
/// They are produced, decoded once and dropped.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: GrayImage,
    /// Position in the source's sequence (0 for one-shot uploads).
    pub seq: u64,
}

impl Frame {
    pub fn new(image: GrayImage, seq: u64) -> Self {
        Self { image, seq }
    }

    /// Build a frame from a raw luma buffer. Returns `None` when the buffer
    /// length does not match `width * height`.
    pub fn from_luma(width: u32, height: u32, luma: Vec<u8>, seq: u64) -> Option<Self> {
        GrayImage::from_raw(width, height, luma).map(|image| Self { image, seq })
    }

    /// Decode a compressed image (JPEG from the camera, any supported format
    /// from an upload) into a frame.
    pub fn from_encoded(data: &[u8], seq: u64) -> Result<Self, DecodeError> {
        let img = decode_image(data)?;
        Ok(Self::new(img.to_luma8(), seq))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

pub(crate) fn decode_image(data: &[u8]) -> Result<DynamicImage, DecodeError> {
    image::ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| DecodeError::UnreadableImage(e.to_string()))?
        .decode()
        .map_err(|e| DecodeError::UnreadableImage(e.to_string()))
}
