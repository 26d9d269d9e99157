use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docx_remote_core::{LeaseBackend, LeaseGrant, RemoteError, RemoteRequest, RemoteTransport};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::SESSION_HEADER;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    persist_changes: bool,
}

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    id: String,
}

/// Session lifecycle over HTTP.
///
/// The remote does not report session lifetimes, so every grant and refresh
/// is assumed to last `session_ttl`.
pub struct HttpSessionBackend {
    transport: Arc<dyn RemoteTransport>,
    session_ttl: Duration,
}

impl HttpSessionBackend {
    pub fn new(transport: Arc<dyn RemoteTransport>, session_ttl: Duration) -> Self {
        Self {
            transport,
            session_ttl,
        }
    }

    fn session_path(resource_key: &str, action: &str) -> String {
        format!("{}/{}", resource_key.trim_end_matches('/'), action)
    }
}

#[async_trait]
impl LeaseBackend for HttpSessionBackend {
    #[instrument(skip(self), level = "debug")]
    async fn create(&self, resource_key: &str, persist: bool) -> Result<LeaseGrant, RemoteError> {
        let body = serde_json::to_value(CreateSessionRequest {
            persist_changes: persist,
        })
        .map_err(|e| RemoteError::Internal(format!("Failed to encode session request: {}", e)))?;
        let request = RemoteRequest::new("POST", Self::session_path(resource_key, "createSession"))
            .json_body(&body)?;

        let response = self.transport.call(request).await?;
        response.error_for_status(resource_key)?;

        let created: CreateSessionResponse = serde_json::from_slice(&response.body)
            .map_err(|e| RemoteError::Internal(format!("Invalid createSession response: {}", e)))?;

        debug!("Created session {} on {}", created.id, resource_key);
        Ok(LeaseGrant {
            id: created.id,
            ttl: self.session_ttl,
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn refresh(&self, resource_key: &str, lease_id: &str) -> Result<Duration, RemoteError> {
        let request = RemoteRequest::new("POST", Self::session_path(resource_key, "refreshSession"))
            .header(SESSION_HEADER, lease_id);

        let response = self.transport.call(request).await?;
        match response.error_for_status(resource_key) {
            Ok(()) => Ok(self.session_ttl),
            // The remote forgot the session
            Err(RemoteError::NotFound(message)) => Err(RemoteError::LeaseInvalid(message)),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn close(&self, resource_key: &str, lease_id: &str) -> Result<(), RemoteError> {
        let request = RemoteRequest::new("POST", Self::session_path(resource_key, "closeSession"))
            .header(SESSION_HEADER, lease_id);

        let response = self.transport.call(request).await?;
        match response.error_for_status(resource_key) {
            Ok(()) => Ok(()),
            // Already gone is as good as closed
            Err(RemoteError::NotFound(_)) | Err(RemoteError::LeaseInvalid(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for HttpSessionBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSessionBackend")
            .field("session_ttl", &self.session_ttl)
            .finish_non_exhaustive()
    }
}
