use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;

/// Response header carrying the resource's entity tag.
pub const ETAG_HEADER: &str = "etag";
/// Request header carrying a write precondition.
pub const IF_MATCH_HEADER: &str = "if-match";
/// Response header carrying a backpressure hint.
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// An opaque remote call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteRequest {
    pub method: String,
    /// Path relative to the transport's base URL
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl RemoteRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn json_body(mut self, body: &serde_json::Value) -> Result<Self, RemoteError> {
        self.body = serde_json::to_vec(body)
            .map_err(|e| RemoteError::Validation(format!("Failed to serialize body: {}", e)))?;
        self.headers
            .insert("content-type".to_string(), "application/json".to_string());
        Ok(self)
    }
}

/// The answer to a [`RemoteRequest`]. Header names are lower-cased.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl RemoteResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn etag(&self) -> Option<String> {
        self.header(ETAG_HEADER).map(str::to_string)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.header(RETRY_AFTER_HEADER).and_then(parse_retry_after)
    }

    /// Turn a non-success status into the matching [`RemoteError`].
    pub fn error_for_status(&self, resource_key: &str) -> Result<(), RemoteError> {
        let message = String::from_utf8_lossy(&self.body).into_owned();
        match RemoteError::from_status(
            self.status,
            resource_key,
            self.etag(),
            self.retry_after(),
            message,
        ) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn json(&self) -> Result<serde_json::Value, RemoteError> {
        if self.body.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_slice(&self.body)
            .map_err(|e| RemoteError::Internal(format!("Invalid JSON response: {}", e)))
    }
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// Opaque transport boundary to the remote service.
///
/// Network-level failures (timeouts, connection errors) come back as `Err`;
/// any HTTP status, including errors, comes back as `Ok(response)`.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn call(&self, request: RemoteRequest) -> Result<RemoteResponse, RemoteError>;
}

/// Supplier of bearer credentials.
///
/// The control layer caches nothing about the token: it asks for one on every
/// call and asks for a refresh when the remote reports it expired.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn token(&self, scopes: &[String]) -> Result<String, RemoteError>;

    /// Drop whatever the source has cached so the next `token` is fresh.
    async fn refresh(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after(" 0 "), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn test_parse_retry_after_past_date() {
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_error_for_status() {
        let mut response = RemoteResponse {
            status: 503,
            ..Default::default()
        };
        response
            .headers
            .insert(RETRY_AFTER_HEADER.to_string(), "2".to_string());

        let err = response.error_for_status("wb").unwrap_err();
        assert!(matches!(err, RemoteError::Unavailable { .. }));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));

        response.status = 200;
        assert!(response.error_for_status("wb").is_ok());
    }
}
