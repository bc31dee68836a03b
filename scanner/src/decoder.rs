use image::imageops::FilterType;
use image::DynamicImage;
use qr_guard_common::event::DecodeError;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::frame::Frame;
use crate::source::upload::ImageUpload;

/// Longer-edge limit applied to uploaded images before decoding.
pub const DEFAULT_MAX_UPLOAD_DIMENSION: u32 = 1024;

/// The pixel-level QR decoder. Opaque to the rest of the scanner: it either
/// finds a code in the frame or it does not, and it is allowed to panic on
/// input it cannot handle.
pub trait DecodePrimitive {
    fn decode(&self, frame: &Frame) -> Option<String>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

/// [`DecodePrimitive`] backed by `rqrr`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RqrrDecoder;

impl DecodePrimitive for RqrrDecoder {
    fn decode(&self, frame: &Frame) -> Option<String> {
        let img = &frame.image;
        let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(
            img.width() as usize,
            img.height() as usize,
            |x, y| img.get_pixel(x as u32, y as u32).0[0],
        );
        prepared
            .detect_grids()
            .into_iter()
            .find_map(|grid| grid.decode().ok().map(|(_, content)| content))
    }

    fn name(&self) -> &str {
        "rqrr"
    }
}

/// A successfully decoded code. Compared by payload, and by `decoded_at`
/// against the debounce window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCode {
    pub payload: String,
    pub decoded_at: Instant,
}

/// Wraps a [`DecodePrimitive`] so that every failure mode comes out as
/// "no code", never as a panic.
pub struct DecoderAdapter<D = RqrrDecoder> {
    primitive: D,
    max_upload_dimension: u32,
}

impl<D: DecodePrimitive> DecoderAdapter<D> {
    pub fn new(primitive: D, max_upload_dimension: u32) -> Self {
        Self {
            primitive,
            max_upload_dimension: max_upload_dimension.max(1),
        }
    }

    /// Decode one frame. Empty payloads and primitive panics are `None`.
    pub fn decode(&self, frame: &Frame, now: Instant) -> Option<DecodedCode> {
        let result = catch_unwind(AssertUnwindSafe(|| self.primitive.decode(frame)));
        match result {
            Ok(Some(payload)) if !payload.is_empty() => {
                debug!(seq = frame.seq, decoder = self.primitive.name(), "code found");
                Some(DecodedCode {
                    payload,
                    decoded_at: now,
                })
            }
            Ok(_) => None,
            Err(_) => {
                warn!(
                    seq = frame.seq,
                    width = frame.width(),
                    height = frame.height(),
                    decoder = self.primitive.name(),
                    "decoder panicked, treating frame as empty"
                );
                None
            }
        }
    }

    /// Decode an uploaded still. The content must be an image; it is scaled
    /// down so its longer edge fits `max_upload_dimension` before decoding.
    pub fn decode_upload(
        &self,
        upload: &ImageUpload,
        now: Instant,
    ) -> Result<DecodedCode, DecodeError> {
        upload.check_image()?;
        let img = downscale(upload.load()?, self.max_upload_dimension);
        debug!(
            name = upload.name,
            width = img.width(),
            height = img.height(),
            "decoding uploaded image"
        );
        let frame = Frame::new(img.to_luma8(), 0);
        self.decode(&frame, now).ok_or(DecodeError::NoCodeFound)
    }
}

/// Shrink `img` so that its longer edge is at most `max_dimension`,
/// keeping the aspect ratio. Smaller images are returned untouched.
pub fn downscale(img: DynamicImage, max_dimension: u32) -> DynamicImage {
    if img.width().max(img.height()) <= max_dimension {
        return img;
    }
    img.resize(max_dimension, max_dimension, FilterType::Triangle)
}
