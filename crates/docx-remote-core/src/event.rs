use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Circuit breaker state of one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Lifecycle notifications emitted by the control layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    LeaseCreated {
        resource_key: String,
        lease_id: String,
        detected_at: i64,
    },
    LeaseRefreshed {
        resource_key: String,
        lease_id: String,
        detected_at: i64,
    },
    LeaseClosed {
        resource_key: String,
        lease_id: String,
        /// False when the remote close call failed
        remote_closed: bool,
        detected_at: i64,
    },
    LeaseExpired {
        resource_key: String,
        lease_id: String,
        detected_at: i64,
    },
    CircuitTransition {
        resource_key: String,
        from: CircuitState,
        to: CircuitState,
        detected_at: i64,
    },
    PauseApplied {
        bucket_key: String,
        pause_ms: u64,
        detected_at: i64,
    },
    VersionsInvalidated {
        resource_key: String,
        detected_at: i64,
    },
}

impl ControlEvent {
    /// Unix timestamp for the `detected_at` field.
    pub fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Caller-supplied receiver of [`ControlEvent`]s.
pub type EventHandler = Arc<dyn Fn(&ControlEvent) + Send + Sync>;

/// Single dispatch point for control events.
///
/// Every event is logged; if a handler was supplied it receives each event
/// synchronously, in emission order.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    handler: Option<EventHandler>,
}

impl EventDispatcher {
    pub fn new(handler: EventHandler) -> Self {
        Self {
            handler: Some(handler),
        }
    }

    /// A dispatcher that only logs.
    pub fn logging() -> Self {
        Self::default()
    }

    pub fn dispatch(&self, event: ControlEvent) {
        debug!(?event, "control event");
        if let Some(handler) = &self.handler {
            handler(&event);
        }
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}
