//! Core contracts and types for the docx-remote session control layer.
//!
//! This crate defines what the control layer consumes and produces:
//! - `RemoteTransport` / `CredentialSource`: the opaque remote boundary
//! - `LeaseBackend`: remote session create/refresh/close
//! - `BatchExecutor`: batched and single operation submission under a lease
//! - `RemoteError`: the error taxonomy shared by every component
//! - `ControlEvent`: lifecycle notifications, delivered through one dispatcher
//! - `InMemoryRemote`: a fault-scriptable remote for deterministic tests

mod error;
mod event;
mod lease;
mod memory;
mod operation;
mod remote;

pub use error::{ErrorKind, RemoteError};
pub use event::{CircuitState, ControlEvent, EventDispatcher, EventHandler};
pub use lease::{Lease, LeaseBackend, LeaseGrant};
pub use memory::{FaultPolicy, InMemoryRemote};
pub use operation::{
    BatchExecutor, BatchReport, Operation, OperationOutcome, OperationResult, OperationSuccess,
    ResolvedVia,
};
pub use remote::{
    parse_retry_after, CredentialSource, RemoteRequest, RemoteResponse, RemoteTransport,
    ETAG_HEADER, IF_MATCH_HEADER, RETRY_AFTER_HEADER,
};
