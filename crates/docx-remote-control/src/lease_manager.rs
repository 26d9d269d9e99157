//! Session lease lifecycle.
//!
//! One lease per resource is shared by every caller. Creation is
//! single-flighted: concurrent `acquire` calls for a resource without a lease
//! wait on the same remote create call. Expired leases are never handed out;
//! lookups drop them lazily and `spawn_reaper` sweeps them periodically.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use docx_remote_core::{
    ControlEvent, EventDispatcher, Lease, LeaseBackend, LeaseGrant, RemoteError,
};
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::retry::{ExecuteOptions, RetryOrchestrator};

/// Configuration for lease management.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Session lifetime assumed when the remote does not report one
    pub ttl: Duration,
    /// Refresh once the remaining lifetime drops under this
    pub refresh_threshold: Duration,
    /// Period of the background sweep
    pub reaper_interval: Duration,
    /// Permit `acquire_dedicated` (extra, unshared sessions per resource)
    pub allow_multiple_leases: bool,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            refresh_threshold: Duration::from_secs(60),
            reaper_interval: Duration::from_secs(30),
            allow_multiple_leases: false,
        }
    }
}

impl LeaseConfig {
    pub fn validate(&self) -> Result<(), RemoteError> {
        if self.ttl.is_zero() {
            return Err(RemoteError::Configuration(
                "lease ttl must be positive".to_string(),
            ));
        }
        if self.refresh_threshold >= self.ttl {
            return Err(RemoteError::Configuration(format!(
                "lease refresh threshold ({:?}) must be shorter than the ttl ({:?})",
                self.refresh_threshold, self.ttl
            )));
        }
        if self.reaper_interval.is_zero() {
            return Err(RemoteError::Configuration(
                "lease reaper interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

type PendingLease = Shared<BoxFuture<'static, Result<Lease, RemoteError>>>;

/// Build a lease from a grant, falling back to `default_ttl` when the remote
/// reported no lifetime.
fn lease_from_grant(
    resource_key: &str,
    grant: LeaseGrant,
    persist: bool,
    default_ttl: Duration,
) -> Lease {
    let grant = if grant.ttl.is_zero() {
        LeaseGrant {
            ttl: default_ttl,
            ..grant
        }
    } else {
        grant
    };
    Lease::from_grant(resource_key, grant, persist, Instant::now())
}

/// Creates, refreshes, shares and closes session leases.
pub struct LeaseManager {
    config: LeaseConfig,
    backend: Arc<dyn LeaseBackend>,
    orchestrator: Arc<RetryOrchestrator>,
    /// resource_key -> shared lease
    active: DashMap<String, Lease>,
    /// resource_key -> creation in flight
    inflight: DashMap<String, PendingLease>,
    /// lease id -> dedicated lease
    dedicated: DashMap<String, Lease>,
    events: EventDispatcher,
}

impl LeaseManager {
    pub fn new(
        config: LeaseConfig,
        backend: Arc<dyn LeaseBackend>,
        orchestrator: Arc<RetryOrchestrator>,
        events: EventDispatcher,
    ) -> Self {
        Self {
            config,
            backend,
            orchestrator,
            active: DashMap::new(),
            inflight: DashMap::new(),
            dedicated: DashMap::new(),
            events,
        }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<RetryOrchestrator> {
        &self.orchestrator
    }

    /// Number of shared leases currently held.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// The unexpired shared lease for `resource_key`, if any.
    pub fn lease(&self, resource_key: &str) -> Option<Lease> {
        let lease = self.active.get(resource_key).map(|l| l.clone())?;
        if lease.is_expired(Instant::now()) {
            if self
                .active
                .remove_if(resource_key, |_, l| l.id == lease.id)
                .is_some()
            {
                self.expired(lease);
            }
            return None;
        }
        Some(lease)
    }

    fn expired(&self, lease: Lease) {
        debug!(
            "Lease {} on {} expired, dropping",
            lease.id, lease.resource_key
        );
        self.events.dispatch(ControlEvent::LeaseExpired {
            resource_key: lease.resource_key,
            lease_id: lease.id,
            detected_at: ControlEvent::now(),
        });
    }

    fn created(&self, lease: &Lease) {
        debug!(
            "Created lease {} on {} (persist={}, ttl={:?})",
            lease.id,
            lease.resource_key,
            lease.persist,
            lease.expires_at - lease.created_at
        );
        self.events.dispatch(ControlEvent::LeaseCreated {
            resource_key: lease.resource_key.clone(),
            lease_id: lease.id.clone(),
            detected_at: ControlEvent::now(),
        });
    }

    /// Return the shared lease for `resource_key`, creating it if needed.
    ///
    /// A lease whose remaining lifetime is under the refresh threshold is
    /// refreshed first. If the remote no longer knows it, a new one is
    /// created; if the refresh fails otherwise, the still-valid lease is
    /// returned.
    #[instrument(skip(self), level = "debug")]
    pub async fn acquire(&self, resource_key: &str, persist: bool) -> Result<Lease, RemoteError> {
        let Some(lease) = self.lease(resource_key) else {
            return self.create_shared(resource_key, persist).await;
        };

        if lease.persist != persist {
            warn!(
                "Lease {} on {} has persist={}, requested persist={}; sharing the existing lease",
                lease.id, resource_key, lease.persist, persist
            );
        }

        if !lease.needs_refresh(Instant::now(), self.config.refresh_threshold) {
            return Ok(lease);
        }

        match self.refresh(&lease).await {
            Ok(refreshed) => Ok(refreshed),
            Err(RemoteError::LeaseInvalid(reason)) => {
                info!(
                    "Lease {} on {} rejected on refresh ({}), recreating",
                    lease.id, resource_key, reason
                );
                self.create_shared(resource_key, persist).await
            }
            Err(e) if !lease.is_expired(Instant::now()) => {
                warn!(
                    "Failed to refresh lease {} on {} ({}), still valid for {:?}",
                    lease.id,
                    resource_key,
                    e,
                    lease.remaining(Instant::now())
                );
                Ok(lease)
            }
            Err(e) => Err(e),
        }
    }

    async fn create_shared(&self, resource_key: &str, persist: bool) -> Result<Lease, RemoteError> {
        let pending = match self.inflight.entry(resource_key.to_string()) {
            Entry::Occupied(entry) => {
                debug!("Joining in-flight lease creation for {}", resource_key);
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                // Another creation may have been published since our lookup
                if let Some(lease) = self.lease(resource_key) {
                    return Ok(lease);
                }
                let backend = self.backend.clone();
                let resource = resource_key.to_string();
                let default_ttl = self.config.ttl;
                let pending = async move {
                    let grant = backend.create(&resource, persist).await?;
                    Ok(lease_from_grant(&resource, grant, persist, default_ttl))
                }
                .boxed()
                .shared();
                entry.insert(pending.clone());
                pending
            }
        };

        let result = pending.clone().await;
        self.publish(resource_key, &pending, &result);
        result
    }

    /// Move a finished creation from `inflight` to `active`. Only the first
    /// waiter to get here does anything.
    fn publish(
        &self,
        resource_key: &str,
        pending: &PendingLease,
        result: &Result<Lease, RemoteError>,
    ) {
        let published = match self.inflight.entry(resource_key.to_string()) {
            Entry::Occupied(entry) if entry.get().ptr_eq(pending) => {
                let lease = result.as_ref().ok().cloned();
                if let Some(lease) = &lease {
                    self.active.insert(resource_key.to_string(), lease.clone());
                }
                entry.remove();
                lease
            }
            _ => None,
        };

        match (published, result) {
            (Some(lease), _) => self.created(&lease),
            (None, Err(e)) => debug!("Lease creation for {} failed: {}", resource_key, e),
            (None, Ok(_)) => {}
        }
    }

    /// Extend a lease's lifetime on the remote.
    ///
    /// A lease the remote rejects as invalid is dropped locally before the
    /// error is returned.
    #[instrument(skip(self, lease), fields(resource_key = %lease.resource_key, lease_id = %lease.id), level = "debug")]
    pub async fn refresh(&self, lease: &Lease) -> Result<Lease, RemoteError> {
        let ttl = match self.backend.refresh(&lease.resource_key, &lease.id).await {
            Ok(ttl) => ttl,
            Err(e) => {
                if let RemoteError::LeaseInvalid(_) = e {
                    self.invalidate(lease);
                }
                return Err(e);
            }
        };

        let ttl = if ttl.is_zero() { self.config.ttl } else { ttl };
        let refreshed = Lease {
            expires_at: Instant::now() + ttl,
            ..lease.clone()
        };

        if let Some(mut current) = self.active.get_mut(&lease.resource_key) {
            if current.id == lease.id {
                *current = refreshed.clone();
            }
        }
        if let Some(mut current) = self.dedicated.get_mut(&lease.id) {
            *current = refreshed.clone();
        }

        debug!(
            "Refreshed lease {} on {} for {:?}",
            lease.id, lease.resource_key, ttl
        );
        self.events.dispatch(ControlEvent::LeaseRefreshed {
            resource_key: lease.resource_key.clone(),
            lease_id: lease.id.clone(),
            detected_at: ControlEvent::now(),
        });
        Ok(refreshed)
    }

    /// Forget a lease locally without telling the remote (it already
    /// considers the session gone).
    pub fn invalidate(&self, lease: &Lease) {
        let shared = self
            .active
            .remove_if(&lease.resource_key, |_, l| l.id == lease.id)
            .is_some();
        let dedicated = self.dedicated.remove(&lease.id).is_some();
        if shared || dedicated {
            debug!(
                "Invalidated lease {} on {}",
                lease.id, lease.resource_key
            );
        }
    }

    /// Close a lease. The local entry is always removed; a failed remote close
    /// is logged and reported through the `LeaseClosed` event only.
    #[instrument(skip(self, lease), fields(resource_key = %lease.resource_key, lease_id = %lease.id), level = "debug")]
    pub async fn release(&self, lease: &Lease) {
        self.active
            .remove_if(&lease.resource_key, |_, l| l.id == lease.id);
        self.dedicated.remove(&lease.id);

        let remote_closed = match self.backend.close(&lease.resource_key, &lease.id).await {
            Ok(()) => {
                debug!("Released lease {} on {}", lease.id, lease.resource_key);
                true
            }
            Err(e) => {
                warn!(
                    "Failed to close lease {} on {}: {}",
                    lease.id, lease.resource_key, e
                );
                false
            }
        };

        self.events.dispatch(ControlEvent::LeaseClosed {
            resource_key: lease.resource_key.clone(),
            lease_id: lease.id.clone(),
            remote_closed,
            detected_at: ControlEvent::now(),
        });
    }

    /// Close every held lease, shared and dedicated.
    pub async fn release_all(&self) -> usize {
        let leases: Vec<Lease> = self
            .active
            .iter()
            .map(|e| e.value().clone())
            .chain(self.dedicated.iter().map(|e| e.value().clone()))
            .collect();
        let count = leases.len();
        join_all(leases.iter().map(|lease| self.release(lease))).await;
        if count > 0 {
            info!("Released {} leases", count);
        }
        count
    }

    /// Drop every expired lease. Returns how many were removed.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let mut reaped = Vec::new();

        let expired_shared: Vec<(String, String)> = self
            .active
            .iter()
            .filter(|e| e.value().is_expired(now))
            .map(|e| (e.key().clone(), e.value().id.clone()))
            .collect();
        for (resource_key, lease_id) in expired_shared {
            if let Some((_, lease)) = self
                .active
                .remove_if(&resource_key, |_, l| l.id == lease_id)
            {
                reaped.push(lease);
            }
        }

        let expired_dedicated: Vec<String> = self
            .dedicated
            .iter()
            .filter(|e| e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect();
        for lease_id in expired_dedicated {
            if let Some((_, lease)) = self.dedicated.remove(&lease_id) {
                reaped.push(lease);
            }
        }

        let count = reaped.len();
        for lease in reaped {
            self.expired(lease);
        }
        count
    }

    /// Run `reap_expired` every `reaper_interval` until the manager is dropped.
    /// Each sweep also drops idle admission buckets.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let period = self.config.reaper_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    debug!("Lease manager dropped, stopping reaper");
                    break;
                };
                let reaped = manager.reap_expired();
                if reaped > 0 {
                    debug!("Reaped {} expired leases", reaped);
                }
                manager.orchestrator.admission().prune_idle();
            }
        })
    }

    /// Create an extra lease on `resource_key` that is not shared with other
    /// callers. Only available with `allow_multiple_leases`.
    #[instrument(skip(self), level = "debug")]
    pub async fn acquire_dedicated(
        &self,
        resource_key: &str,
        persist: bool,
    ) -> Result<Lease, RemoteError> {
        if !self.config.allow_multiple_leases {
            return Err(RemoteError::Configuration(format!(
                "multiple leases on {} requested but allow_multiple_leases is off",
                resource_key
            )));
        }
        warn!(
            "Creating a dedicated lease on {}; concurrent sessions may conflict",
            resource_key
        );

        let grant = self.backend.create(resource_key, persist).await?;
        let lease = lease_from_grant(resource_key, grant, persist, self.config.ttl);
        self.dedicated.insert(lease.id.clone(), lease.clone());
        self.created(&lease);
        Ok(lease)
    }

    /// Run `op` under the shared lease of `resource_key`, through the retry
    /// orchestrator.
    ///
    /// A `LeaseInvalid` answer drops the lease so the next attempt creates a
    /// fresh one. Busy and transient answers are backed off and retried with
    /// the cached lease.
    pub async fn execute_with_lease<T, F, Fut>(
        &self,
        resource_key: &str,
        persist: bool,
        options: ExecuteOptions,
        op: F,
    ) -> Result<T, RemoteError>
    where
        F: Fn(Lease) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let op = &op;
        self.orchestrator
            .execute(resource_key, options, move |ctx| async move {
                if ctx.recreate_lease {
                    debug!("Recreating lease on {} (attempt {})", resource_key, ctx.attempt);
                }
                let lease = self.acquire(resource_key, persist).await?;
                let held = lease.clone();
                match op(lease).await {
                    Err(e @ RemoteError::LeaseInvalid(_)) => {
                        self.invalidate(&held);
                        Err(e)
                    }
                    other => other,
                }
            })
            .await
    }
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("config", &self.config)
            .field("active", &self.active.len())
            .field("inflight", &self.inflight.len())
            .field("dedicated", &self.dedicated.len())
            .finish_non_exhaustive()
    }
}
