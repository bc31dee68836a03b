//! Values the scanner core hands to its presentation layer.

use std::fmt;

/// Monotonic identifier of one scan attempt (one accepted decode, or one
/// camera acquisition failure). Presentation keys its rendering on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScanId(pub u64);

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One event per completed scan step, emitted by the scan loop.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// A code was accepted and its safety check is in flight.
    Loading { scan: ScanId, payload: String },
    Verdict {
        scan: ScanId,
        payload: String,
        verdict: SafetyVerdict,
    },
    Error {
        scan: ScanId,
        payload: Option<String>,
        error: ScanFailure,
    },
    CameraError { scan: ScanId, error: CameraError },
}

impl ScanEvent {
    pub fn scan(&self) -> ScanId {
        match self {
            ScanEvent::Loading { scan, .. }
            | ScanEvent::Verdict { scan, .. }
            | ScanEvent::Error { scan, .. }
            | ScanEvent::CameraError { scan, .. } => *scan,
        }
    }

    pub fn payload(&self) -> Option<&str> {
        match self {
            ScanEvent::Loading { payload, .. } | ScanEvent::Verdict { payload, .. } => {
                Some(payload)
            }
            ScanEvent::Error { payload, .. } => payload.as_deref(),
            ScanEvent::CameraError { .. } => None,
        }
    }
}

/// Normalized answer of the safety API for one payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyVerdict {
    pub is_safe: bool,
    pub threat: ThreatType,
    /// The parsed response body as received.
    pub raw: serde_json::Value,
}

impl SafetyVerdict {
    pub fn threat_type(&self) -> &str {
        self.threat.as_str()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreatType {
    Malware,
    Phishing,
    Suspicious,
    Unknown,
    Other(String),
}

impl ThreatType {
    /// Parse the API's threat label. `None` and blank labels are `Unknown`.
    pub fn from_label(label: Option<&str>) -> Self {
        let Some(label) = label.map(str::trim).filter(|l| !l.is_empty()) else {
            return ThreatType::Unknown;
        };
        match label.to_ascii_uppercase().as_str() {
            "MALWARE" => ThreatType::Malware,
            "PHISHING" => ThreatType::Phishing,
            "SUSPICIOUS" => ThreatType::Suspicious,
            "UNKNOWN" => ThreatType::Unknown,
            _ => ThreatType::Other(label.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ThreatType::Malware => "MALWARE",
            ThreatType::Phishing => "PHISHING",
            ThreatType::Suspicious => "SUSPICIOUS",
            ThreatType::Unknown => "unknown",
            ThreatType::Other(label) => label,
        }
    }

    /// User-facing explanation shown next to an unsafe verdict.
    pub fn description(&self) -> String {
        match self {
            ThreatType::Malware => "Malware was found at this URL".into(),
            ThreatType::Phishing => "This URL is suspected to be a phishing site".into(),
            ThreatType::Suspicious => "Suspicious activity was detected at this URL".into(),
            other => format!("Threat type: {}", other.as_str()),
        }
    }
}

impl fmt::Display for ThreatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationErrorKind {
    NetworkFailure,
    HttpStatusFailure,
    MalformedResponse,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VerificationError {
    #[error("could not reach the safety API: {0}")]
    NetworkFailure(String),
    #[error("safety API responded with HTTP status {status}")]
    HttpStatusFailure { status: u16 },
    #[error("safety API response was malformed: {0}")]
    MalformedResponse(String),
}

impl VerificationError {
    pub fn kind(&self) -> VerificationErrorKind {
        match self {
            VerificationError::NetworkFailure(_) => VerificationErrorKind::NetworkFailure,
            VerificationError::HttpStatusFailure { .. } => {
                VerificationErrorKind::HttpStatusFailure
            }
            VerificationError::MalformedResponse(_) => VerificationErrorKind::MalformedResponse,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("the uploaded file is not an image")]
    NotAnImage,
    #[error("the image could not be read: {0}")]
    UnreadableImage(String),
    #[error("no QR code was found in the image")]
    NoCodeFound,
    #[error("failed to read file: {0}")]
    Read(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraErrorCause {
    PermissionDenied,
    NoDevice,
    Aborted,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CameraError {
    #[error("camera access was denied")]
    PermissionDenied,
    #[error("no usable camera was found")]
    NoDevice,
    #[error("camera initialization was interrupted")]
    Aborted,
    #[error("camera failure: {0}")]
    Other(String),
}

impl CameraError {
    pub fn cause(&self) -> CameraErrorCause {
        match self {
            CameraError::PermissionDenied => CameraErrorCause::PermissionDenied,
            CameraError::NoDevice => CameraErrorCause::NoDevice,
            CameraError::Aborted => CameraErrorCause::Aborted,
            CameraError::Other(_) => CameraErrorCause::Other,
        }
    }

    /// Recovery hint shown alongside the retry prompt.
    pub fn hint(&self) -> &'static str {
        match self {
            CameraError::PermissionDenied => "allow access to the camera",
            CameraError::NoDevice => "no camera is available, check the camera address",
            CameraError::Aborted => "camera start-up was interrupted, try again",
            CameraError::Other(_) => "please try again",
        }
    }
}

/// Failure reported for a scan attempt that produced no verdict.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScanFailure {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Verification(#[from] VerificationError),
}
