pub mod camera;
pub mod upload;

use std::future::Future;

use qr_guard_common::event::CameraError;

use crate::frame::Frame;

/// A live producer of frames owning one capture resource.
///
/// Implementations hold at most one open capture. `acquire` releases any
/// previous capture before opening a new one, and `release` must give the
/// resource back before it returns.
pub trait FrameSource {
    /// Open the capture and wait until it produces frames.
    fn acquire(&mut self) -> impl Future<Output = Result<(), CameraError>>;

    /// The newest frame not yet handed out, or `None` when the source has
    /// nothing new. Errors mean the capture died and must be reacquired.
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError>;

    fn release(&mut self);

    fn is_acquired(&self) -> bool;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}
