use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use docx_remote_core::{
    parse_retry_after, BatchExecutor, Lease, Operation, OperationOutcome, OperationSuccess,
    RemoteError, RemoteRequest, RemoteResponse, RemoteTransport, ETAG_HEADER, IF_MATCH_HEADER,
    RETRY_AFTER_HEADER,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use super::SESSION_HEADER;

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    requests: Vec<BatchRequestEntry<'a>>,
}

#[derive(Debug, Serialize)]
struct BatchRequestEntry<'a> {
    id: String,
    method: &'a str,
    url: String,
    headers: HashMap<&'static str, String>,
    #[serde(skip_serializing_if = "is_null")]
    body: &'a Value,
}

fn is_null(body: &&Value) -> bool {
    body.is_null()
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    responses: Vec<BatchResponseEntry>,
}

#[derive(Debug, Deserialize)]
struct BatchResponseEntry {
    id: String,
    status: u16,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Value,
}

impl BatchResponseEntry {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn into_outcome(self, target: &str) -> OperationOutcome {
        let etag = self.header(ETAG_HEADER).map(str::to_string);
        let retry_after = self.header(RETRY_AFTER_HEADER).and_then(parse_retry_after);
        let message = match &self.body {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        match RemoteError::from_status(self.status, target, etag.clone(), retry_after, message) {
            Some(err) => Err(err),
            None => Ok(OperationSuccess {
                body: self.body,
                etag,
            }),
        }
    }
}

/// Operation submission over HTTP: a JSON `$batch` envelope for batches and
/// plain requests for single operations.
///
/// Operation targets are resolved relative to the lease's resource, and each
/// request carries the session header and, when set, `If-Match`.
pub struct HttpBatchExecutor {
    transport: Arc<dyn RemoteTransport>,
    batch_path: String,
}

impl HttpBatchExecutor {
    pub fn new(transport: Arc<dyn RemoteTransport>) -> Self {
        Self {
            transport,
            batch_path: "$batch".to_string(),
        }
    }

    /// Use a different batch endpoint path.
    pub fn with_batch_path(mut self, batch_path: impl Into<String>) -> Self {
        self.batch_path = batch_path.into();
        self
    }

    fn url(lease: &Lease, operation: &Operation) -> String {
        format!(
            "{}/{}",
            lease.resource_key.trim_end_matches('/'),
            operation.target.trim_start_matches('/')
        )
    }

    fn headers(lease: &Lease, operation: &Operation) -> HashMap<&'static str, String> {
        let mut headers = HashMap::new();
        headers.insert(SESSION_HEADER, lease.id.clone());
        headers.insert("content-type", "application/json".to_string());
        if let Some(token) = &operation.precondition_token {
            headers.insert(IF_MATCH_HEADER, token.clone());
        }
        headers
    }

    fn success(response: &RemoteResponse) -> Result<OperationSuccess, RemoteError> {
        Ok(OperationSuccess {
            body: response.json()?,
            etag: response.etag(),
        })
    }
}

#[async_trait]
impl BatchExecutor for HttpBatchExecutor {
    #[instrument(skip(self, lease, operations), fields(resource_key = %lease.resource_key, count = operations.len()), level = "debug")]
    async fn execute_batch(
        &self,
        lease: &Lease,
        operations: &[Operation],
    ) -> Result<Vec<OperationOutcome>, RemoteError> {
        let envelope = BatchRequest {
            requests: operations
                .iter()
                .enumerate()
                .map(|(i, op)| BatchRequestEntry {
                    id: i.to_string(),
                    method: &op.method,
                    url: Self::url(lease, op),
                    headers: Self::headers(lease, op),
                    body: &op.payload,
                })
                .collect(),
        };
        let body = serde_json::to_value(&envelope)
            .map_err(|e| RemoteError::Internal(format!("Failed to encode batch: {}", e)))?;
        let request = RemoteRequest::new("POST", self.batch_path.clone())
            .header(SESSION_HEADER, lease.id.clone())
            .json_body(&body)?;

        let response = self.transport.call(request).await?;
        response.error_for_status(&lease.resource_key)?;

        let parsed: BatchResponse = serde_json::from_slice(&response.body)
            .map_err(|e| RemoteError::Internal(format!("Invalid batch response: {}", e)))?;

        let mut by_index: HashMap<usize, BatchResponseEntry> = parsed
            .responses
            .into_iter()
            .filter_map(|entry| entry.id.parse::<usize>().ok().map(|i| (i, entry)))
            .collect();

        let outcomes: Vec<OperationOutcome> = operations
            .iter()
            .enumerate()
            .map(|(i, op)| match by_index.remove(&i) {
                Some(entry) => entry.into_outcome(&op.target),
                None => Err(RemoteError::Internal(format!(
                    "batch response has no entry for operation {}",
                    op.id
                ))),
            })
            .collect();

        debug!(
            "Batch of {} on {}: {} succeeded",
            operations.len(),
            lease.resource_key,
            outcomes.iter().filter(|o| o.is_ok()).count()
        );
        Ok(outcomes)
    }

    #[instrument(skip(self, lease, operation), fields(resource_key = %lease.resource_key, id = %operation.id), level = "debug")]
    async fn execute_one(&self, lease: &Lease, operation: &Operation) -> OperationOutcome {
        let mut request = RemoteRequest::new(operation.method.clone(), Self::url(lease, operation));
        for (name, value) in Self::headers(lease, operation) {
            request = request.header(name, value);
        }
        if !operation.payload.is_null() {
            request = request.json_body(&operation.payload)?;
        }

        let response = self.transport.call(request).await?;
        response.error_for_status(&operation.target)?;
        Self::success(&response)
    }
}

impl std::fmt::Debug for HttpBatchExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBatchExecutor")
            .field("batch_path", &self.batch_path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpTransport;
    use docx_remote_core::LeaseGrant;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::Instant;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn lease() -> Lease {
        Lease::from_grant(
            "wb",
            LeaseGrant {
                id: "s-1".into(),
                ttl: Duration::from_secs(300),
            },
            true,
            Instant::now(),
        )
    }

    async fn executor(server: &MockServer) -> HttpBatchExecutor {
        let transport = HttpTransport::new(server.uri(), Duration::from_secs(5)).unwrap();
        HttpBatchExecutor::new(Arc::new(transport))
    }

    #[tokio::test]
    async fn test_batch_maps_mixed_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/$batch"))
            .and(header(SESSION_HEADER, "s-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "responses": [
                    { "id": "1", "status": 412, "headers": { "ETag": "\"v9\"" } },
                    { "id": "0", "status": 200, "headers": { "ETag": "\"v2\"" }, "body": { "ok": true } },
                    { "id": "2", "status": 503, "headers": { "Retry-After": "5" } }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let operations = vec![
            Operation::new("A1", json!({ "values": [[1]] })),
            Operation::new("A2", json!({ "values": [[2]] })).with_precondition("\"v1\""),
            Operation::new("A3", json!({ "values": [[3]] })),
        ];
        let outcomes = executor(&server)
            .await
            .execute_batch(&lease(), &operations)
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 3);
        let first = outcomes[0].as_ref().unwrap();
        assert_eq!(first.etag.as_deref(), Some("\"v2\""));
        assert_eq!(first.body, json!({ "ok": true }));
        assert_eq!(
            outcomes[1],
            Err(RemoteError::VersionMismatch {
                resource_key: "A2".into(),
                current: Some("\"v9\"".into()),
            })
        );
        let unavailable = outcomes[2].as_ref().unwrap_err();
        assert_eq!(unavailable.retry_after(), Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_batch_missing_entry_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "responses": [] })))
            .mount(&server)
            .await;

        let outcomes = executor(&server)
            .await
            .execute_batch(&lease(), &[Operation::new("A1", Value::Null)])
            .await
            .unwrap();
        assert!(matches!(outcomes[0], Err(RemoteError::Internal(_))));
    }

    #[tokio::test]
    async fn test_whole_batch_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(410).set_body_string("session expired"))
            .mount(&server)
            .await;

        let err = executor(&server)
            .await
            .execute_batch(&lease(), &[Operation::new("A1", Value::Null)])
            .await
            .unwrap_err();
        assert_eq!(err, RemoteError::LeaseInvalid("session expired".into()));
    }

    #[tokio::test]
    async fn test_execute_one_sends_precondition() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/wb/A1"))
            .and(header("if-match", "\"v1\""))
            .and(header(SESSION_HEADER, "s-1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"v2\"")
                    .set_body_json(json!({ "address": "A1" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let op = Operation::new("A1", json!({ "values": [[1]] })).with_precondition("\"v1\"");
        let success = executor(&server)
            .await
            .execute_one(&lease(), &op)
            .await
            .unwrap();
        assert_eq!(success.etag.as_deref(), Some("\"v2\""));
    }
}
