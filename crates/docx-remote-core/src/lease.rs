use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::RemoteError;

/// A time-bounded session on a remote resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: String,
    pub resource_key: String,
    pub created_at: Instant,
    pub expires_at: Instant,
    /// Whether changes made under the session are persisted
    pub persist: bool,
}

impl Lease {
    /// Build a lease from what the remote granted, stamped at `now`.
    pub fn from_grant(resource_key: &str, grant: LeaseGrant, persist: bool, now: Instant) -> Self {
        Self {
            id: grant.id,
            resource_key: resource_key.to_string(),
            created_at: now,
            expires_at: now + grant.ttl,
            persist,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    /// Whether the remaining lifetime is down to `threshold` or less.
    pub fn needs_refresh(&self, now: Instant, threshold: Duration) -> bool {
        self.remaining(now) <= threshold
    }
}

/// A session as granted by the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGrant {
    pub id: String,
    /// Lifetime the remote promises from the moment of the grant
    pub ttl: Duration,
}

/// Remote session lifecycle calls.
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    /// Create a session on `resource_key`.
    async fn create(&self, resource_key: &str, persist: bool) -> Result<LeaseGrant, RemoteError>;

    /// Keep a session alive. Returns the renewed lifetime.
    ///
    /// A session the remote no longer knows fails with `LeaseInvalid`.
    async fn refresh(&self, resource_key: &str, lease_id: &str) -> Result<Duration, RemoteError>;

    /// Close a session.
    async fn close(&self, resource_key: &str, lease_id: &str) -> Result<(), RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_window() {
        let now = Instant::now();
        let lease = Lease::from_grant(
            "wb-1",
            LeaseGrant {
                id: "s-1".into(),
                ttl: Duration::from_secs(300),
            },
            true,
            now,
        );

        assert!(!lease.is_expired(now));
        assert!(!lease.needs_refresh(now, Duration::from_secs(60)));

        let late = now + Duration::from_secs(240);
        assert!(lease.needs_refresh(late, Duration::from_secs(60)));
        assert!(!lease.is_expired(late));

        assert!(lease.is_expired(now + Duration::from_secs(300)));
        assert_eq!(lease.remaining(now + Duration::from_secs(400)), Duration::ZERO);
    }
}
