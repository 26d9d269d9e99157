//! HTTP implementations of the remote contracts.
//!
//! Sessions are addressed per resource (`{resource}/createSession`,
//! `{resource}/refreshSession`, `{resource}/closeSession`) and carried on every
//! subsequent request in the `workbook-session-id` header. Batches go through
//! one JSON `$batch` endpoint.

mod batch;
mod credentials;
mod session;
mod transport;

pub use batch::HttpBatchExecutor;
pub use credentials::StaticCredentials;
pub use session::HttpSessionBackend;
pub use transport::HttpTransport;

/// Request header carrying the session id.
pub const SESSION_HEADER: &str = "workbook-session-id";
