//! Concurrency and resilience control for remote documents and workbooks.
//!
//! Many concurrent callers share one [`RemoteClient`]. Underneath it:
//! - [`VersionCache`]: optimistic-concurrency tokens per (resource, sub-resource)
//! - [`AdmissionController`]: global and per-resource token buckets, plus pauses
//!   from server backpressure hints
//! - [`FailureGate`]: one circuit breaker per resource
//! - [`RetryOrchestrator`]: failure classification and bounded retry loops
//! - [`LeaseManager`]: single-flighted, auto-refreshed session leases
//! - [`BatchScheduler`]: packing and bounded-parallel batch execution
//!
//! The remote itself is reached through the contracts of `docx_remote_core`;
//! [`http`] provides reqwest-based implementations.

pub mod admission;
pub mod batch;
pub mod client;
pub mod failure_gate;
pub mod http;
pub mod lease_manager;
pub mod retry;
pub mod version_cache;

pub use admission::{AdmissionConfig, AdmissionController, BucketConfig, TokenBucket, GLOBAL_BUCKET};
pub use batch::{pack, BatchConfig, BatchGroup, BatchScheduler};
pub use client::{ControlConfig, RemoteClient, RemoteClientBuilder, Versioned};
pub use failure_gate::{CircuitConfig, FailureGate};
pub use lease_manager::{LeaseConfig, LeaseManager};
pub use retry::{
    AttemptContext, ExecuteOptions, RetryAction, RetryClass, RetryOrchestrator, RetryPolicy,
    RetryRule,
};
pub use version_cache::{VersionCache, VersionCacheConfig, VersionToken};

pub use docx_remote_core::*;
