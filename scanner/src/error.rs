use qr_guard_common::config::ConfigError;
use qr_guard_common::event::CameraError;

/// Startup failures of the scanner binary.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid safety API base URL {0}")]
    InvalidBaseUrl(String),
    #[error("failed to build HTTP client: {0}")]
    HttpClient(reqwest::Error),
    #[error("camera setup failed: {0}")]
    Camera(#[from] CameraError),
}
