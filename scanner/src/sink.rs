use qr_guard_common::event::{CameraError, ScanEvent, ScanId};
use tokio::sync::mpsc;
use tracing::debug;

/// Receives the scan loop's results. Rendering is entirely the sink's business.
pub trait PresentationSink {
    fn emit(&self, event: ScanEvent);
}

/// Forwards events to a separate rendering task.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ScanEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ScanEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PresentationSink for ChannelSink {
    fn emit(&self, event: ScanEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!(scan = %e.0.scan(), "presentation layer gone, dropping event");
        }
    }
}

/// What the result view currently shows, rebuilt from the event stream.
///
/// Verdicts may arrive out of submission order; the view shows whichever
/// scan event it received last. Dismissing the view discards every later
/// event belonging to a scan that had already started when it was dismissed.
#[derive(Debug, Default)]
pub struct ResultView {
    shown: Option<ScanEvent>,
    camera_error: Option<CameraError>,
    latest_seen: Option<ScanId>,
    dismissed_through: Option<ScanId>,
}

impl ResultView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event. Returns `false` when the event was discarded as stale.
    pub fn apply(&mut self, event: ScanEvent) -> bool {
        let scan = event.scan();
        if self.dismissed_through.is_some_and(|d| scan <= d) {
            debug!(%scan, "discarding update for dismissed result view");
            return false;
        }
        self.latest_seen = self.latest_seen.max(Some(scan));

        match event {
            ScanEvent::CameraError { error, .. } => {
                self.camera_error = Some(error);
            }
            other => {
                self.shown = Some(other);
            }
        }
        true
    }

    /// Close the result view.
    pub fn dismiss(&mut self) {
        self.shown = None;
        self.dismissed_through = self.latest_seen;
    }

    /// Clear the camera prompt, e.g. when the user retries.
    pub fn clear_camera_error(&mut self) {
        self.camera_error = None;
    }

    pub fn current(&self) -> Option<&ScanEvent> {
        self.shown.as_ref()
    }

    pub fn camera_error(&self) -> Option<&CameraError> {
        self.camera_error.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.shown.is_some()
    }
}
