use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::RemoteError;
use crate::lease::{Lease, LeaseBackend, LeaseGrant};
use crate::operation::{BatchExecutor, Operation, OperationOutcome, OperationSuccess};

/// Scripted failures for an [`InMemoryRemote`].
///
/// Each list is consumed front to back: the n-th matching call fails with the
/// n-th error, and calls beyond the list succeed.
#[derive(Debug, Clone)]
pub struct FaultPolicy {
    /// Lifetime granted to new and refreshed sessions
    pub lease_ttl: Duration,
    /// Latency of a session creation call
    pub create_delay: Duration,
    pub create_failures: Vec<RemoteError>,
    pub refresh_failures: Vec<RemoteError>,
    pub close_failures: Vec<RemoteError>,
    /// Failures of the whole batch call
    pub batch_failures: Vec<RemoteError>,
    /// Failures of individual operations, by operation id, applied both
    /// inside batches and to individual submissions
    pub operation_failures: HashMap<String, Vec<RemoteError>>,
}

impl Default for FaultPolicy {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(300),
            create_delay: Duration::ZERO,
            create_failures: Vec::new(),
            refresh_failures: Vec::new(),
            close_failures: Vec::new(),
            batch_failures: Vec::new(),
            operation_failures: HashMap::new(),
        }
    }
}

impl FaultPolicy {
    pub fn fail_operation(mut self, id: impl Into<String>, errors: Vec<RemoteError>) -> Self {
        self.operation_failures.insert(id.into(), errors);
        self
    }
}

#[derive(Debug, Default)]
struct Scripts {
    create: VecDeque<RemoteError>,
    refresh: VecDeque<RemoteError>,
    close: VecDeque<RemoteError>,
    batch: VecDeque<RemoteError>,
    operations: HashMap<String, VecDeque<RemoteError>>,
}

#[derive(Debug, Default)]
struct RemoteState {
    sessions: HashSet<String>,
    /// target -> current version number
    versions: HashMap<String, u64>,
    next_session: u64,
}

/// In-process stand-in for a remote document service.
///
/// Tracks sessions and per-target versions, enforces `If-Match` style
/// preconditions, and fails calls according to its [`FaultPolicy`].
#[derive(Debug)]
pub struct InMemoryRemote {
    policy: FaultPolicy,
    scripts: Mutex<Scripts>,
    state: Mutex<RemoteState>,
    create_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    close_calls: AtomicUsize,
    batch_calls: AtomicUsize,
    single_calls: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
}

impl InMemoryRemote {
    pub fn new(policy: FaultPolicy) -> Self {
        let scripts = Scripts {
            create: policy.create_failures.iter().cloned().collect(),
            refresh: policy.refresh_failures.iter().cloned().collect(),
            close: policy.close_failures.iter().cloned().collect(),
            batch: policy.batch_failures.iter().cloned().collect(),
            operations: policy
                .operation_failures
                .iter()
                .map(|(id, errs)| (id.clone(), errs.iter().cloned().collect()))
                .collect(),
        };
        Self {
            policy,
            scripts: Mutex::new(scripts),
            state: Mutex::new(RemoteState::default()),
            create_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
            single_calls: AtomicUsize::new(0),
            batch_sizes: Mutex::new(Vec::new()),
        }
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn single_calls(&self) -> usize {
        self.single_calls.load(Ordering::SeqCst)
    }

    /// Sizes of the batches received, in arrival order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }

    /// Whether the remote still considers a session open.
    pub fn has_session(&self, lease_id: &str) -> bool {
        self.state.lock().unwrap().sessions.contains(lease_id)
    }

    /// Drop a session on the remote side, as if it timed out there.
    pub fn drop_session(&self, lease_id: &str) {
        self.state.lock().unwrap().sessions.remove(lease_id);
    }

    /// Current entity tag of a target.
    pub fn current_version(&self, target: &str) -> String {
        let state = self.state.lock().unwrap();
        Self::etag(*state.versions.get(target).unwrap_or(&0))
    }

    /// Modify a target behind the caller's back.
    pub fn bump_version(&self, target: &str) -> String {
        let mut state = self.state.lock().unwrap();
        let version = state.versions.entry(target.to_string()).or_insert(0);
        *version += 1;
        Self::etag(*version)
    }

    /// Apply a conditional write to a target, as the remote would.
    pub fn write(&self, target: &str, precondition: Option<&str>) -> OperationOutcome {
        let mut state = self.state.lock().unwrap();
        let version = state.versions.entry(target.to_string()).or_insert(0);
        if let Some(expected) = precondition {
            if expected != Self::etag(*version) {
                return Err(RemoteError::VersionMismatch {
                    resource_key: target.to_string(),
                    current: Some(Self::etag(*version)),
                });
            }
        }
        *version += 1;
        Ok(OperationSuccess {
            body: serde_json::json!({ "target": target, "version": *version }),
            etag: Some(Self::etag(*version)),
        })
    }

    fn etag(version: u64) -> String {
        format!("\"v{}\"", version)
    }

    fn next_failure(queue: &mut VecDeque<RemoteError>) -> Option<RemoteError> {
        queue.pop_front()
    }

    fn check_session(&self, lease: &Lease) -> Result<(), RemoteError> {
        if self.has_session(&lease.id) {
            Ok(())
        } else {
            Err(RemoteError::LeaseInvalid(format!(
                "session {} is not open",
                lease.id
            )))
        }
    }

    fn apply(&self, operation: &Operation) -> OperationOutcome {
        let scripted = {
            let mut scripts = self.scripts.lock().unwrap();
            scripts
                .operations
                .get_mut(&operation.id)
                .and_then(Self::next_failure)
        };
        if let Some(err) = scripted {
            debug!("Injected failure for operation {}: {}", operation.id, err);
            return Err(err);
        }
        self.write(&operation.target, operation.precondition_token.as_deref())
    }
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new(FaultPolicy::default())
    }
}

#[async_trait]
impl LeaseBackend for InMemoryRemote {
    async fn create(&self, resource_key: &str, _persist: bool) -> Result<LeaseGrant, RemoteError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if !self.policy.create_delay.is_zero() {
            tokio::time::sleep(self.policy.create_delay).await;
        }
        if let Some(err) = Self::next_failure(&mut self.scripts.lock().unwrap().create) {
            return Err(err);
        }

        let mut state = self.state.lock().unwrap();
        state.next_session += 1;
        let id = format!("{}-session-{}", resource_key, state.next_session);
        state.sessions.insert(id.clone());
        debug!("Created in-memory session {}", id);
        Ok(LeaseGrant {
            id,
            ttl: self.policy.lease_ttl,
        })
    }

    async fn refresh(&self, _resource_key: &str, lease_id: &str) -> Result<Duration, RemoteError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = Self::next_failure(&mut self.scripts.lock().unwrap().refresh) {
            return Err(err);
        }
        if !self.has_session(lease_id) {
            return Err(RemoteError::LeaseInvalid(format!(
                "session {} is not open",
                lease_id
            )));
        }
        Ok(self.policy.lease_ttl)
    }

    async fn close(&self, _resource_key: &str, lease_id: &str) -> Result<(), RemoteError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = Self::next_failure(&mut self.scripts.lock().unwrap().close) {
            return Err(err);
        }
        self.drop_session(lease_id);
        Ok(())
    }
}

#[async_trait]
impl BatchExecutor for InMemoryRemote {
    async fn execute_batch(
        &self,
        lease: &Lease,
        operations: &[Operation],
    ) -> Result<Vec<OperationOutcome>, RemoteError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(operations.len());
        if let Some(err) = Self::next_failure(&mut self.scripts.lock().unwrap().batch) {
            return Err(err);
        }
        self.check_session(lease)?;
        Ok(operations.iter().map(|op| self.apply(op)).collect())
    }

    async fn execute_one(&self, lease: &Lease, operation: &Operation) -> OperationOutcome {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        self.check_session(lease)?;
        self.apply(operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_sessions_and_preconditions() {
        let remote = InMemoryRemote::default();
        let grant = assert_ok!(remote.create("wb", true).await);
        assert!(remote.has_session(&grant.id));

        let first = assert_ok!(remote.write("A1", Some("\"v0\"")));
        assert_eq!(first.etag.as_deref(), Some("\"v1\""));

        // Stale token is rejected
        let stale = assert_err!(remote.write("A1", Some("\"v0\"")));
        assert!(matches!(stale, RemoteError::VersionMismatch { .. }));

        assert_ok!(remote.close("wb", &grant.id).await);
        assert!(!remote.has_session(&grant.id));
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed_in_order() {
        let policy = FaultPolicy {
            create_failures: vec![RemoteError::Timeout("slow".into())],
            ..Default::default()
        };
        let remote = InMemoryRemote::new(policy);

        assert_err!(remote.create("wb", false).await);
        assert_ok!(remote.create("wb", false).await);
        assert_eq!(remote.create_calls(), 2);
    }
}
