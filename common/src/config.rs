use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub safety_api: SafetyApiConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SafetyApiConfig {
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_api_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_first_frame_timeout")]
    pub first_frame_timeout_secs: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout_secs: default_connect_timeout(),
            first_frame_timeout_secs: default_first_frame_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,
    #[serde(default = "default_max_upload_dimension")]
    pub max_upload_dimension: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            file: None,
            tick_interval_ms: default_tick_interval(),
            debounce_ms: default_debounce(),
            max_upload_dimension: default_max_upload_dimension(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the scanner cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = self.safety_api.base_url.trim();
        if base.is_empty() {
            return Err(ConfigError::Invalid("safety_api.base_url is empty".into()));
        }
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "safety_api.base_url must be an http(s) URL, got {base}"
            )));
        }
        if self.safety_api.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid("safety_api.api_key is empty".into()));
        }
        if self.scan.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("scan.tick_interval_ms must be > 0".into()));
        }
        if self.scan.max_upload_dimension == 0 {
            return Err(ConfigError::Invalid(
                "scan.max_upload_dimension must be > 0".into(),
            ));
        }
        match self.scan.mode.as_str() {
            "camera" => {
                if self.camera.url.trim().is_empty() {
                    return Err(ConfigError::Invalid(
                        "camera.url is required in camera mode".into(),
                    ));
                }
            }
            "file" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unknown scan.mode '{other}', expected 'camera' or 'file'"
                )))
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_api_timeout_ms() -> u64 {
    5000
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_first_frame_timeout() -> u64 {
    10
}
fn default_mode() -> String {
    "camera".into()
}
fn default_tick_interval() -> u64 {
    33
}
fn default_debounce() -> u64 {
    3000
}
fn default_max_upload_dimension() -> u32 {
    1024
}
fn default_log_level() -> String {
    "info".into()
}
