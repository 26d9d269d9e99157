use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad class of a [`RemoteError`], used for routing and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Access,
    Concurrency,
    Admission,
    Transport,
    Server,
    Credential,
    Exhausted,
    Cancelled,
}

/// Errors that can occur while talking to a remote document or workbook.
///
/// Local decisions (`CircuitOpen`, `AdmissionDenied`) are kept apart from
/// rejections the remote actually returned, so callers can tell
/// "we declined to call" from "the call failed".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Lease invalid: {0}")]
    LeaseInvalid(String),

    #[error("Version mismatch on {resource_key}")]
    VersionMismatch {
        resource_key: String,
        /// Entity tag the remote reported as current, if any
        current: Option<String>,
    },

    #[error("Resource busy: {message}")]
    ResourceBusy {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Rate limited by remote")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Credential expired: {0}")]
    CredentialExpired(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server fault (status {status}): {message}")]
    ServerFault {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Service unavailable: {message}")]
    Unavailable {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Admission denied for {bucket}")]
    AdmissionDenied { bucket: String, retry_after: Duration },

    #[error("Circuit open for {resource_key}")]
    CircuitOpen {
        resource_key: String,
        retry_after: Duration,
    },

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<RemoteError>,
    },

    #[error("Deadline exceeded after {attempts} attempts")]
    DeadlineExceeded { attempts: u32 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RemoteError {
    /// Map an HTTP status code (plus the response's entity tag and
    /// retry-after hint) to an error. Returns `None` for 2xx/3xx statuses.
    pub fn from_status(
        status: u16,
        resource_key: &str,
        etag: Option<String>,
        retry_after: Option<Duration>,
        message: impl Into<String>,
    ) -> Option<Self> {
        let message = message.into();
        let err = match status {
            s if s < 400 => return None,
            400 | 422 => Self::Validation(message),
            401 => Self::CredentialExpired(message),
            403 => Self::PermissionDenied(message),
            404 => Self::NotFound(message),
            409 | 423 => Self::ResourceBusy {
                message,
                retry_after,
            },
            410 => Self::LeaseInvalid(message),
            412 => Self::VersionMismatch {
                resource_key: resource_key.to_string(),
                current: etag,
            },
            429 => Self::RateLimited { retry_after },
            503 => Self::Unavailable {
                message,
                retry_after,
            },
            504 => Self::Timeout(message),
            s if s >= 500 => Self::ServerFault {
                status: s,
                message,
                retry_after,
            },
            _ => Self::Validation(format!("unexpected status {}: {}", status, message)),
        };
        Some(err)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::PermissionDenied(_) | Self::NotFound(_) | Self::Validation(_) => {
                ErrorKind::Access
            }
            Self::LeaseInvalid(_) | Self::VersionMismatch { .. } | Self::ResourceBusy { .. } => {
                ErrorKind::Concurrency
            }
            Self::RateLimited { .. }
            | Self::AdmissionDenied { .. }
            | Self::CircuitOpen { .. } => ErrorKind::Admission,
            Self::Timeout(_) | Self::Network(_) => ErrorKind::Transport,
            Self::ServerFault { .. } | Self::Unavailable { .. } => ErrorKind::Server,
            Self::CredentialExpired(_) => ErrorKind::Credential,
            Self::RetriesExhausted { .. } => ErrorKind::Exhausted,
            Self::DeadlineExceeded { .. } => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Server,
        }
    }

    /// Whether another attempt could succeed without caller intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Configuration(_)
            | Self::PermissionDenied(_)
            | Self::NotFound(_)
            | Self::Validation(_)
            | Self::RetriesExhausted { .. }
            | Self::DeadlineExceeded { .. }
            | Self::Internal(_) => false,
            _ => true,
        }
    }

    /// Suggested wait before the next attempt, when one is known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ResourceBusy { retry_after, .. }
            | Self::RateLimited { retry_after }
            | Self::ServerFault { retry_after, .. }
            | Self::Unavailable { retry_after, .. } => *retry_after,
            Self::AdmissionDenied { retry_after, .. } | Self::CircuitOpen { retry_after, .. } => {
                Some(*retry_after)
            }
            Self::RetriesExhausted { last, .. } => last.retry_after(),
            _ => None,
        }
    }

    /// Whether the failure says something about the health of the remote
    /// resource (and so should count against its circuit). Throttling is
    /// answered with a pause instead.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::Network(_)
                | Self::ServerFault { .. }
                | Self::Unavailable { .. }
        )
    }

    /// True for errors produced locally without calling the remote.
    pub fn is_local_rejection(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::AdmissionDenied { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let busy = RemoteError::from_status(423, "wb", None, None, "locked").unwrap();
        assert!(matches!(busy, RemoteError::ResourceBusy { .. }));

        let conflict =
            RemoteError::from_status(412, "wb", Some("\"v2\"".into()), None, "").unwrap();
        assert_eq!(
            conflict,
            RemoteError::VersionMismatch {
                resource_key: "wb".into(),
                current: Some("\"v2\"".into()),
            }
        );

        let throttled =
            RemoteError::from_status(429, "wb", None, Some(Duration::from_secs(3)), "").unwrap();
        assert_eq!(throttled.retry_after(), Some(Duration::from_secs(3)));

        assert!(matches!(
            RemoteError::from_status(502, "wb", None, None, "bad gateway"),
            Some(RemoteError::ServerFault { status: 502, .. })
        ));
        assert!(RemoteError::from_status(204, "wb", None, None, "").is_none());
    }

    #[test]
    fn test_access_errors_not_retryable() {
        for status in [400, 403, 404] {
            let err = RemoteError::from_status(status, "wb", None, None, "").unwrap();
            assert_eq!(err.kind(), ErrorKind::Access);
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_local_rejection_is_distinct() {
        let open = RemoteError::CircuitOpen {
            resource_key: "wb".into(),
            retry_after: Duration::from_secs(5),
        };
        let remote = RemoteError::Unavailable {
            message: "down".into(),
            retry_after: None,
        };
        assert!(open.is_local_rejection());
        assert!(!remote.is_local_rejection());
        assert_eq!(open.retry_after(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_throttling_is_not_a_fault() {
        let throttled = RemoteError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert!(!throttled.is_fault());
        assert!(throttled.is_retryable());

        assert!(RemoteError::Timeout("slow".into()).is_fault());
        assert!(RemoteError::from_status(503, "wb", None, None, "").unwrap().is_fault());
        assert!(!RemoteError::from_status(409, "wb", None, None, "").unwrap().is_fault());
    }
}
