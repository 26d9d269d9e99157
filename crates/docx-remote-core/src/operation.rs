use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::lease::Lease;

/// A caller-supplied unit of remote work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Caller-chosen identifier, echoed back in results
    #[serde(default = "new_operation_id")]
    pub id: String,
    /// Sub-resource the operation addresses (e.g. a worksheet range)
    pub target: String,
    /// HTTP-style verb
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Entity tag the write is conditioned on
    #[serde(default)]
    pub precondition_token: Option<String>,
}

fn new_operation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_method() -> String {
    "PATCH".to_string()
}

impl Operation {
    pub fn new(target: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: new_operation_id(),
            target: target.into(),
            method: default_method(),
            payload,
            precondition_token: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_precondition(mut self, token: impl Into<String>) -> Self {
        self.precondition_token = Some(token.into());
        self
    }

    /// Rough wire size of the operation inside a batch envelope.
    pub fn estimated_size(&self) -> usize {
        let payload = serde_json::to_vec(&self.payload)
            .map(|v| v.len())
            .unwrap_or(0);
        payload
            + self.id.len()
            + self.target.len()
            + self.method.len()
            + self.precondition_token.as_ref().map_or(0, String::len)
    }
}

/// What a successful operation returned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationSuccess {
    #[serde(default)]
    pub body: serde_json::Value,
    /// Entity tag of the target after the operation
    #[serde(default)]
    pub etag: Option<String>,
}

/// Per-operation status inside a batch response.
pub type OperationOutcome = Result<OperationSuccess, RemoteError>;

/// Remote execution of operations under a held lease.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    /// Submit several operations as one remote batch call.
    ///
    /// `Err` means the batch call itself failed. `Ok` carries one outcome per
    /// operation, in the order given.
    async fn execute_batch(
        &self,
        lease: &Lease,
        operations: &[Operation],
    ) -> Result<Vec<OperationOutcome>, RemoteError>;

    /// Submit a single operation outside of a batch envelope.
    async fn execute_one(&self, lease: &Lease, operation: &Operation) -> OperationOutcome;
}

/// Which path produced an operation's final outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedVia {
    Batch,
    Individual,
}

/// Final outcome of one submitted operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResult {
    /// Position in the submitted list
    pub index: usize,
    pub id: String,
    pub resolved_via: ResolvedVia,
    pub outcome: OperationOutcome,
}

impl OperationResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn to_json(&self) -> serde_json::Value {
        match &self.outcome {
            Ok(success) => serde_json::json!({
                "index": self.index,
                "id": self.id,
                "resolved_via": self.resolved_via,
                "status": "succeeded",
                "etag": success.etag,
                "body": success.body,
            }),
            Err(err) => serde_json::json!({
                "index": self.index,
                "id": self.id,
                "resolved_via": self.resolved_via,
                "status": "failed",
                "kind": err.kind(),
                "retryable": err.is_retryable(),
                "error": err.to_string(),
            }),
        }
    }
}

/// Merged result of a bulk submission, in submission order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub results: Vec<OperationResult>,
    pub success_count: usize,
    pub failure_count: usize,
}

impl BatchReport {
    /// Build a report from results in any order.
    pub fn from_results(mut results: Vec<OperationResult>) -> Self {
        results.sort_by_key(|r| r.index);
        let success_count = results.iter().filter(|r| r.is_success()).count();
        let failure_count = results.len() - success_count;
        Self {
            results,
            success_count,
            failure_count,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success_count": self.success_count,
            "failure_count": self.failure_count,
            "results": self.results.iter().map(OperationResult::to_json).collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_defaults_from_json() {
        let op: Operation =
            serde_json::from_value(json!({"target": "Sheet1!A1", "payload": {"values": [[1]]}}))
                .unwrap();
        assert_eq!(op.method, "PATCH");
        assert!(!op.id.is_empty());
        assert!(op.precondition_token.is_none());
        assert!(op.estimated_size() > "Sheet1!A1".len());
    }

    #[test]
    fn test_report_sorts_and_counts() {
        let results = vec![
            OperationResult {
                index: 1,
                id: "b".into(),
                resolved_via: ResolvedVia::Individual,
                outcome: Err(RemoteError::NotFound("gone".into())),
            },
            OperationResult {
                index: 0,
                id: "a".into(),
                resolved_via: ResolvedVia::Batch,
                outcome: Ok(OperationSuccess::default()),
            },
        ];
        let report = BatchReport::from_results(results);
        assert_eq!(report.results[0].id, "a");
        assert_eq!(report.success_count, 1);
        assert_eq!(report.failure_count, 1);
        assert_eq!(report.to_json()["results"][1]["kind"], "access");
    }
}
