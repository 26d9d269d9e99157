//! Bulk submission: packing, bounded-parallel execution and individual
//! resubmission of retryable per-operation failures.

use std::sync::Arc;
use std::time::Duration;

use docx_remote_core::{
    BatchExecutor, BatchReport, Operation, OperationOutcome, OperationResult, OperationSuccess,
    RemoteError, ResolvedVia,
};
use futures::stream::{self, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::lease_manager::LeaseManager;
use crate::retry::{ExecuteOptions, RetryAction, RetryClass};
use crate::version_cache::VersionCache;

/// Configuration for batch submission.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Operations per remote batch call
    pub max_count: usize,
    /// Estimated bytes per remote batch call
    pub max_bytes: usize,
    /// Batch calls in flight at once
    pub parallelism: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_count: 20,
            max_bytes: 4 * 1024 * 1024,
            parallelism: 4,
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), RemoteError> {
        if self.max_count == 0 || self.max_bytes == 0 {
            return Err(RemoteError::Configuration(
                "batch bounds must be at least 1".to_string(),
            ));
        }
        if self.parallelism == 0 {
            return Err(RemoteError::Configuration(
                "batch parallelism must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Operations sent together in one remote batch call, each tagged with its
/// position in the submitted list.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchGroup {
    pub operations: Vec<(usize, Operation)>,
    pub estimated_byte_size: usize,
}

impl BatchGroup {
    fn new() -> Self {
        Self {
            operations: Vec::new(),
            estimated_byte_size: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Greedy, order-preserving packing.
///
/// A new group starts whenever the next operation would push the current one
/// past `max_count` operations or `max_bytes` estimated bytes. An operation
/// larger than `max_bytes` on its own is sent alone.
pub fn pack(operations: Vec<Operation>, max_count: usize, max_bytes: usize) -> Vec<BatchGroup> {
    let max_count = max_count.max(1);
    let mut groups = Vec::new();
    let mut current = BatchGroup::new();

    for (index, operation) in operations.into_iter().enumerate() {
        let size = operation.estimated_size();
        let full = current.len() + 1 > max_count
            || current.estimated_byte_size.saturating_add(size) > max_bytes;
        if full && !current.is_empty() {
            groups.push(std::mem::replace(&mut current, BatchGroup::new()));
        }
        current.estimated_byte_size += size;
        current.operations.push((index, operation));
    }

    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Runs operation lists against one resource under the full lease, admission,
/// circuit and retry contract.
pub struct BatchScheduler {
    config: BatchConfig,
    leases: Arc<LeaseManager>,
    executor: Arc<dyn BatchExecutor>,
    versions: Arc<VersionCache>,
}

impl BatchScheduler {
    pub fn new(
        config: BatchConfig,
        leases: Arc<LeaseManager>,
        executor: Arc<dyn BatchExecutor>,
        versions: Arc<VersionCache>,
    ) -> Self {
        Self {
            config,
            leases,
            executor,
            versions,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Pack, execute and merge. The report has exactly one result per
    /// submitted operation, in submission order.
    #[instrument(skip(self, operations), fields(count = operations.len()), level = "debug")]
    pub async fn submit(
        &self,
        resource_key: &str,
        persist: bool,
        operations: Vec<Operation>,
        options: ExecuteOptions,
    ) -> BatchReport {
        let total = operations.len();
        let groups = pack(operations, self.config.max_count, self.config.max_bytes);
        info!(
            "Submitting {} operations on {} in {} batches",
            total,
            resource_key,
            groups.len()
        );

        let results = self
            .execute(resource_key, persist, groups, self.config.parallelism, options)
            .await;
        let report = BatchReport::from_results(results);
        debug!(
            "Batch submission on {} finished: {} succeeded, {} failed",
            resource_key, report.success_count, report.failure_count
        );
        report
    }

    /// Run up to `parallelism` groups at once. Results come back unordered.
    pub async fn execute(
        &self,
        resource_key: &str,
        persist: bool,
        groups: Vec<BatchGroup>,
        parallelism: usize,
        options: ExecuteOptions,
    ) -> Vec<OperationResult> {
        stream::iter(
            groups
                .into_iter()
                .map(|group| self.run_group(resource_key, persist, group, options)),
        )
        .buffer_unordered(parallelism.max(1))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    async fn run_group(
        &self,
        resource_key: &str,
        persist: bool,
        mut group: BatchGroup,
        options: ExecuteOptions,
    ) -> Vec<OperationResult> {
        for (_, operation) in group.operations.iter_mut() {
            if operation.precondition_token.is_none() {
                operation.precondition_token =
                    self.versions.get(resource_key, &operation.target).await;
            }
        }

        let operations: Vec<Operation> = group
            .operations
            .iter()
            .map(|(_, op)| op.clone())
            .collect();
        let operations = &operations;
        let executor = &self.executor;

        let batch = self
            .leases
            .execute_with_lease(resource_key, persist, options, move |lease| async move {
                let outcomes = executor.execute_batch(&lease, operations).await?;
                if outcomes.len() != operations.len() {
                    return Err(RemoteError::Internal(format!(
                        "batch response carried {} results for {} operations",
                        outcomes.len(),
                        operations.len()
                    )));
                }
                Ok(outcomes)
            })
            .await;

        let outcomes = match batch {
            Ok(outcomes) => outcomes,
            Err(e) => {
                warn!(
                    "Batch of {} operations on {} failed: {}",
                    group.len(),
                    resource_key,
                    e
                );
                return group
                    .operations
                    .into_iter()
                    .map(|(index, op)| OperationResult {
                        index,
                        id: op.id,
                        resolved_via: ResolvedVia::Batch,
                        outcome: Err(e.clone()),
                    })
                    .collect();
            }
        };

        let mut results = Vec::with_capacity(group.len());
        let mut resubmit = Vec::new();
        for ((index, operation), outcome) in group.operations.into_iter().zip(outcomes) {
            match outcome {
                // Resubmitting with the remote's current tag would overwrite
                // newer state. Callers recover through `with_precondition`.
                Err(e @ RemoteError::VersionMismatch { .. }) => {
                    self.versions.invalidate(resource_key, &operation.target).await;
                    results.push(OperationResult {
                        index,
                        id: operation.id,
                        resolved_via: ResolvedVia::Batch,
                        outcome: Err(e),
                    });
                }
                Err(e) if e.is_retryable() => resubmit.push((index, operation, e)),
                outcome => {
                    self.record(resource_key, &operation, &outcome).await;
                    results.push(OperationResult {
                        index,
                        id: operation.id,
                        resolved_via: ResolvedVia::Batch,
                        outcome,
                    });
                }
            }
        }

        if resubmit.is_empty() {
            return results;
        }

        debug!(
            "Resubmitting {} of {} operations on {} individually",
            resubmit.len(),
            results.len() + resubmit.len(),
            resource_key
        );
        self.pause_before_resubmit(resource_key, &resubmit, options)
            .await;

        // Sequential, so one caller's operations keep their order. The batch
        // attempt and the pause above count as the first try and backoff.
        for (index, operation, error) in resubmit {
            let options = options.after_failure(RetryClass::of(&error));
            let outcome = self
                .resubmit(resource_key, persist, &operation, options)
                .await;
            self.record(resource_key, &operation, &outcome).await;
            results.push(OperationResult {
                index,
                id: operation.id,
                resolved_via: ResolvedVia::Individual,
                outcome,
            });
        }
        results
    }

    /// Wait out the longest backoff the batch failures ask for, once.
    async fn pause_before_resubmit(
        &self,
        resource_key: &str,
        failures: &[(usize, Operation, RemoteError)],
        options: ExecuteOptions,
    ) {
        let orchestrator = self.leases.orchestrator();
        if let Some(hint) = failures.iter().filter_map(|(_, _, e)| e.retry_after()).max() {
            orchestrator
                .admission()
                .apply_pause(resource_key, Instant::now() + hint);
        }

        let delay = failures
            .iter()
            .filter_map(|(_, _, e)| match orchestrator.classify(e) {
                RetryAction::RetryAfter(delay) => Some(delay),
                _ => None,
            })
            .max()
            .unwrap_or(Duration::ZERO);
        if delay.is_zero() {
            return;
        }

        let wake = Instant::now() + delay;
        let wake = options.deadline.map_or(wake, |deadline| wake.min(deadline));
        tokio::time::sleep_until(wake).await;
    }

    async fn resubmit(
        &self,
        resource_key: &str,
        persist: bool,
        operation: &Operation,
        options: ExecuteOptions,
    ) -> OperationOutcome {
        let executor = &self.executor;
        self.leases
            .execute_with_lease(resource_key, persist, options, move |lease| async move {
                match executor.execute_one(&lease, operation).await {
                    // The precondition will not change between attempts
                    Err(e @ RemoteError::VersionMismatch { .. }) => Ok(Err(e)),
                    other => other.map(Ok),
                }
            })
            .await
            .and_then(|outcome| outcome)
    }

    async fn record(&self, resource_key: &str, operation: &Operation, outcome: &OperationOutcome) {
        match outcome {
            Ok(OperationSuccess {
                etag: Some(etag), ..
            }) => {
                self.versions
                    .set(resource_key, &operation.target, etag.clone())
                    .await;
            }
            Err(RemoteError::VersionMismatch { .. }) => {
                self.versions.invalidate(resource_key, &operation.target).await;
            }
            _ => {}
        }
    }
}

impl std::fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
