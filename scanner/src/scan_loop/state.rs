use std::fmt;
use std::time::Duration;

use crate::decoder::DecodedCode;

/// Minimum time before an identical payload is accepted again.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// No capture open; waiting to be started, or a one-shot file scan.
    Idle,
    /// Waiting for the frame source to come up.
    Starting,
    /// Capture open and ticking.
    Running,
    /// Torn down explicitly, after losing the capture, or after a failed retry.
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoopState::Idle => "IDLE",
            LoopState::Starting => "STARTING",
            LoopState::Running => "RUNNING",
            LoopState::Stopped => "STOPPED",
        })
    }
}

/// Mutable session state, owned by the scan loop alone.
#[derive(Debug, Default, Clone)]
pub struct ScanSessionState {
    pub active: bool,
    pub last_accepted: Option<DecodedCode>,
}

impl ScanSessionState {
    /// A code is accepted when nothing was accepted yet, when its payload
    /// differs from the last accepted one, or when more than `window` has
    /// passed since that payload was accepted.
    pub fn should_accept(&self, code: &DecodedCode, window: Duration) -> bool {
        match &self.last_accepted {
            None => true,
            Some(last) => {
                last.payload != code.payload
                    || code.decoded_at.saturating_duration_since(last.decoded_at) > window
            }
        }
    }

    /// Record `code` as accepted if the debounce policy lets it through.
    pub fn try_accept(&mut self, code: DecodedCode, window: Duration) -> bool {
        if !self.should_accept(&code, window) {
            return false;
        }
        self.last_accepted = Some(code);
        true
    }

    pub fn reset(&mut self) {
        self.active = false;
        self.last_accepted = None;
    }
}
