use qr_guard_common::config::SafetyApiConfig;
use qr_guard_common::event::{SafetyVerdict, ThreatType, VerificationError};
use reqwest::header::ACCEPT;
use reqwest::Url;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::ScanError;

/// Checks a decoded payload against a URL reputation service.
///
/// Calls are independent of each other and have no effect beyond the
/// outbound request, so the same payload may be checked any number of times.
pub trait SafetyCheck {
    fn verify(
        &self,
        payload: &str,
    ) -> impl Future<Output = Result<SafetyVerdict, VerificationError>>;
}

/// HTTP client for the safety API:
/// `GET {base_url}?key={api_key}&url={payload}`.
pub struct SafetyClient {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
}

impl SafetyClient {
    pub fn new(config: &SafetyApiConfig) -> Result<Self, ScanError> {
        let base_url = Url::parse(config.base_url.trim())
            .map_err(|e| ScanError::InvalidBaseUrl(format!("{}: {e}", config.base_url)))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(ScanError::HttpClient)?;
        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
        })
    }

    /// Request URL for `payload`, with both query values percent-encoded.
    pub fn request_url(&self, payload: &str) -> Url {
        with_query(&self.base_url, &self.api_key, payload)
    }

    fn redacted_url(&self, payload: &str) -> Url {
        with_query(&self.base_url, "***", payload)
    }
}

fn with_query(base: &Url, key: &str, payload: &str) -> Url {
    let mut url = base.clone();
    url.query_pairs_mut()
        .append_pair("key", key)
        .append_pair("url", payload);
    url
}

impl SafetyCheck for SafetyClient {
    async fn verify(&self, payload: &str) -> Result<SafetyVerdict, VerificationError> {
        debug!(url = %self.redacted_url(payload), "requesting safety verdict");

        let response = self
            .client
            .get(self.request_url(payload))
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(network_failure)?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), payload, "safety API returned an error status");
            return Err(VerificationError::HttpStatusFailure {
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(network_failure)?;
        let verdict = parse_verdict(&body)?;
        info!(
            payload,
            is_safe = verdict.is_safe,
            threat = verdict.threat_type(),
            "safety verdict received"
        );
        Ok(verdict)
    }
}

fn network_failure(e: reqwest::Error) -> VerificationError {
    let cause = if e.is_timeout() {
        format!("request timed out: {e}")
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        e.to_string()
    };
    VerificationError::NetworkFailure(cause)
}

/// Normalize a safety API response body into a verdict.
///
/// Only `{"message": "SUCCESS", "result": {...}}` with a recognizable `safe`
/// flag is a verdict; anything else is a malformed response, never "unsafe".
pub fn parse_verdict(body: &str) -> Result<SafetyVerdict, VerificationError> {
    let raw: Value = serde_json::from_str(body)
        .map_err(|e| VerificationError::MalformedResponse(format!("invalid JSON: {e}")))?;

    let message = raw.get("message").and_then(Value::as_str);
    if message != Some("SUCCESS") {
        return Err(VerificationError::MalformedResponse(format!(
            "unexpected message {}",
            message.unwrap_or("<missing>")
        )));
    }

    let result = raw
        .get("result")
        .filter(|r| r.is_object())
        .ok_or_else(|| VerificationError::MalformedResponse("missing result".into()))?;

    let is_safe = normalize_safe_flag(result.get("safe")).ok_or_else(|| {
        VerificationError::MalformedResponse(format!(
            "unrecognized safe flag {}",
            result.get("safe").map_or("<missing>".into(), Value::to_string)
        ))
    })?;
    let threat = ThreatType::from_label(result.get("threat").and_then(Value::as_str));

    Ok(SafetyVerdict {
        is_safe,
        threat,
        raw,
    })
}

/// The API has sent the flag both as "1"/"0" strings and as bare values.
fn normalize_safe_flag(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        },
        Value::Number(n) => match n.as_i64()? {
            1 => Some(true),
            0 => Some(false),
            _ => None,
        },
        _ => None,
    }
}
