//! Caller-facing facade over the control components.

use std::future::Future;
use std::sync::Arc;

use docx_remote_core::{
    BatchExecutor, BatchReport, CredentialSource, EventDispatcher, Lease, LeaseBackend, Operation,
    RemoteError,
};
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use crate::admission::{AdmissionConfig, AdmissionController};
use crate::batch::{BatchConfig, BatchScheduler};
use crate::failure_gate::{CircuitConfig, FailureGate};
use crate::lease_manager::{LeaseConfig, LeaseManager};
use crate::retry::{ExecuteOptions, RetryOrchestrator, RetryPolicy};
use crate::version_cache::{VersionCache, VersionCacheConfig};

/// Configuration of every control component.
#[derive(Debug, Clone, Default)]
pub struct ControlConfig {
    pub lease: LeaseConfig,
    pub versions: VersionCacheConfig,
    pub admission: AdmissionConfig,
    pub circuit: CircuitConfig,
    pub retry: RetryPolicy,
    pub batch: BatchConfig,
}

impl ControlConfig {
    pub fn validate(&self) -> Result<(), RemoteError> {
        self.lease.validate()?;
        self.admission.validate()?;
        self.circuit.validate()?;
        self.retry.validate()?;
        self.batch.validate()?;
        if self.versions.max_capacity == 0 {
            return Err(RemoteError::Configuration(
                "version cache capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A value together with the version token the remote returned for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub token: Option<String>,
}

impl<T> Versioned<T> {
    pub fn new(value: T, token: Option<String>) -> Self {
        Self { value, token }
    }
}

/// Builder for [`RemoteClient`].
pub struct RemoteClientBuilder {
    config: ControlConfig,
    backend: Arc<dyn LeaseBackend>,
    executor: Arc<dyn BatchExecutor>,
    credentials: Option<Arc<dyn CredentialSource>>,
    events: EventDispatcher,
}

impl RemoteClientBuilder {
    pub fn config(mut self, config: ControlConfig) -> Self {
        self.config = config;
        self
    }

    /// Credential source refreshed when the remote reports an expired token.
    pub fn credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> Result<RemoteClient, RemoteError> {
        self.config.validate()?;
        let config = self.config;
        let events = self.events;

        let admission = Arc::new(AdmissionController::new(
            config.admission.clone(),
            events.clone(),
        ));
        let gate = Arc::new(FailureGate::new(config.circuit.clone(), events.clone()));
        let mut orchestrator = RetryOrchestrator::new(config.retry.clone(), admission, gate);
        if let Some(credentials) = self.credentials {
            orchestrator = orchestrator.with_credentials(credentials);
        }
        let orchestrator = Arc::new(orchestrator);

        let leases = Arc::new(LeaseManager::new(
            config.lease.clone(),
            self.backend,
            orchestrator.clone(),
            events.clone(),
        ));
        let versions = Arc::new(VersionCache::new(config.versions.clone(), events));
        let batches = BatchScheduler::new(
            config.batch.clone(),
            leases.clone(),
            self.executor,
            versions.clone(),
        );

        Ok(RemoteClient {
            orchestrator,
            leases,
            versions,
            batches,
        })
    }
}

/// Safe concurrent access to a remote stateful resource.
///
/// One instance is meant to be shared (behind an `Arc`) by every caller.
pub struct RemoteClient {
    orchestrator: Arc<RetryOrchestrator>,
    leases: Arc<LeaseManager>,
    versions: Arc<VersionCache>,
    batches: BatchScheduler,
}

impl RemoteClient {
    pub fn builder(
        backend: Arc<dyn LeaseBackend>,
        executor: Arc<dyn BatchExecutor>,
    ) -> RemoteClientBuilder {
        RemoteClientBuilder {
            config: ControlConfig::default(),
            backend,
            executor,
            credentials: None,
            events: EventDispatcher::logging(),
        }
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    pub fn versions(&self) -> &Arc<VersionCache> {
        &self.versions
    }

    pub fn orchestrator(&self) -> &Arc<RetryOrchestrator> {
        &self.orchestrator
    }

    /// Start the periodic lease sweep.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        self.leases.spawn_reaper()
    }

    /// Run `operation` under a held, auto-refreshed lease on `resource_key`.
    ///
    /// Invalid leases are recreated once; transient, busy and throttled
    /// answers are retried per the retry policy.
    pub async fn with_lease<T, F, Fut>(
        &self,
        resource_key: &str,
        persist: bool,
        operation: F,
    ) -> Result<T, RemoteError>
    where
        F: Fn(Lease) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        self.with_lease_options(resource_key, persist, ExecuteOptions::default(), operation)
            .await
    }

    /// `with_lease` with a deadline or attempt bound.
    pub async fn with_lease_options<T, F, Fut>(
        &self,
        resource_key: &str,
        persist: bool,
        options: ExecuteOptions,
        operation: F,
    ) -> Result<T, RemoteError>
    where
        F: Fn(Lease) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        self.leases
            .execute_with_lease(resource_key, persist, options, operation)
            .await
    }

    /// Run a write conditioned on the cached version token of
    /// `(resource_key, sub_key)`.
    ///
    /// Without a cached token, `read` fetches the current one. On a version
    /// mismatch the cached token is dropped and the next attempt re-reads
    /// before writing again. The token returned with a successful write is
    /// cached. Persistent conflicts surface as `RetriesExhausted` wrapping the
    /// last `VersionMismatch`.
    pub async fn with_precondition<T, R, RFut, W, WFut>(
        &self,
        resource_key: &str,
        sub_key: &str,
        read: R,
        write: W,
    ) -> Result<Versioned<T>, RemoteError>
    where
        R: Fn() -> RFut,
        RFut: Future<Output = Result<String, RemoteError>>,
        W: Fn(String) -> WFut,
        WFut: Future<Output = Result<Versioned<T>, RemoteError>>,
    {
        self.with_precondition_options(
            resource_key,
            sub_key,
            ExecuteOptions::default(),
            read,
            write,
        )
        .await
    }

    /// `with_precondition` with a deadline or attempt bound.
    pub async fn with_precondition_options<T, R, RFut, W, WFut>(
        &self,
        resource_key: &str,
        sub_key: &str,
        options: ExecuteOptions,
        read: R,
        write: W,
    ) -> Result<Versioned<T>, RemoteError>
    where
        R: Fn() -> RFut,
        RFut: Future<Output = Result<String, RemoteError>>,
        W: Fn(String) -> WFut,
        WFut: Future<Output = Result<Versioned<T>, RemoteError>>,
    {
        let read = &read;
        let write = &write;
        let versions = &self.versions;

        self.orchestrator
            .execute(resource_key, options, move |ctx| async move {
                let cached = if ctx.reread {
                    None
                } else {
                    versions.get(resource_key, sub_key).await
                };
                let token = match cached {
                    Some(token) => token,
                    None => {
                        let token = read().await?;
                        debug!(
                            "Read version {} for {}/{}",
                            token, resource_key, sub_key
                        );
                        versions.set(resource_key, sub_key, token.clone()).await;
                        token
                    }
                };

                match write(token).await {
                    Ok(written) => {
                        match &written.token {
                            Some(token) => versions.set(resource_key, sub_key, token.clone()).await,
                            None => versions.invalidate(resource_key, sub_key).await,
                        }
                        Ok(written)
                    }
                    Err(e @ RemoteError::VersionMismatch { .. }) => {
                        versions.invalidate(resource_key, sub_key).await;
                        Err(e)
                    }
                    Err(e) => Err(e),
                }
            })
            .await
    }

    /// Submit operations against `resource_key` in persisted batches.
    pub async fn submit_batch(&self, resource_key: &str, operations: Vec<Operation>) -> BatchReport {
        self.submit_batch_with(resource_key, true, operations, ExecuteOptions::default())
            .await
    }

    pub async fn submit_batch_with(
        &self,
        resource_key: &str,
        persist: bool,
        operations: Vec<Operation>,
        options: ExecuteOptions,
    ) -> BatchReport {
        self.batches
            .submit(resource_key, persist, operations, options)
            .await
    }

    /// Drop every cached version token of a resource (e.g. after it was
    /// restored or replaced out of band).
    pub fn invalidate_resource(&self, resource_key: &str) {
        self.versions.invalidate_resource(resource_key);
    }

    /// Close every held lease.
    #[instrument(skip(self), level = "debug")]
    pub async fn shutdown(&self) -> usize {
        self.leases.release_all().await
    }
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("leases", &self.leases)
            .field("versions", &self.versions)
            .field("batches", &self.batches)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::BucketConfig;
    use std::time::Duration;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ControlConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let mut config = ControlConfig::default();
        config.admission.per_resource = BucketConfig {
            capacity: 0,
            refill_per_sec: 5.0,
        };
        assert!(matches!(
            config.validate(),
            Err(RemoteError::Configuration(_))
        ));

        let mut config = ControlConfig::default();
        config.batch.parallelism = 0;
        assert!(config.validate().is_err());

        let mut config = ControlConfig::default();
        config.lease.refresh_threshold = Duration::from_secs(600);
        assert!(config.validate().is_err());
    }
}
