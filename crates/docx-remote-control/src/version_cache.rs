//! TTL-scoped store of optimistic-concurrency tokens.
//!
//! Tokens are advisory: the remote's precondition check is authoritative, so a
//! stale entry can only ever produce a conflict, never an overwrite.

use std::time::Duration;

use docx_remote_core::{ControlEvent, EventDispatcher};
use moka::future::Cache;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Configuration for the version cache.
#[derive(Debug, Clone)]
pub struct VersionCacheConfig {
    /// How long a captured token is trusted
    pub ttl: Duration,
    /// Maximum number of tokens kept
    pub max_capacity: u64,
}

impl Default for VersionCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_capacity: 10_000,
        }
    }
}

/// A cached entity tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionToken {
    pub resource_key: String,
    pub sub_key: String,
    pub token: String,
    pub captured_at: Instant,
}

type CacheKey = (String, String);

/// Version tokens keyed by `(resource_key, sub_key)`.
pub struct VersionCache {
    config: VersionCacheConfig,
    cache: Cache<CacheKey, VersionToken>,
    events: EventDispatcher,
}

impl VersionCache {
    pub fn new(config: VersionCacheConfig, events: EventDispatcher) -> Self {
        // The moka TTL only bounds memory; freshness is judged against
        // `captured_at` so paused-clock tests stay deterministic.
        let cache = Cache::builder()
            .time_to_live(config.ttl)
            .max_capacity(config.max_capacity)
            .support_invalidation_closures()
            .build();

        Self {
            config,
            cache,
            events,
        }
    }

    fn key(resource_key: &str, sub_key: &str) -> CacheKey {
        (resource_key.to_string(), sub_key.to_string())
    }

    /// Get a token if present and still within its TTL.
    pub async fn get(&self, resource_key: &str, sub_key: &str) -> Option<String> {
        let key = Self::key(resource_key, sub_key);
        let entry = self.cache.get(&key).await?;

        if entry.captured_at.elapsed() >= self.config.ttl {
            debug!(
                "Version token for {}/{} expired, dropping",
                resource_key, sub_key
            );
            self.cache.invalidate(&key).await;
            return None;
        }

        Some(entry.token)
    }

    /// Insert or overwrite a token with a fresh TTL stamp.
    pub async fn set(&self, resource_key: &str, sub_key: &str, token: impl Into<String>) {
        let token = VersionToken {
            resource_key: resource_key.to_string(),
            sub_key: sub_key.to_string(),
            token: token.into(),
            captured_at: Instant::now(),
        };
        debug!(
            "Cached version {} for {}/{}",
            token.token, resource_key, sub_key
        );
        self.cache
            .insert(Self::key(resource_key, sub_key), token)
            .await;
    }

    /// Drop a single sub-resource token (after a conflict).
    pub async fn invalidate(&self, resource_key: &str, sub_key: &str) {
        self.cache.invalidate(&Self::key(resource_key, sub_key)).await;
    }

    /// Drop every token held for a resource.
    pub fn invalidate_resource(&self, resource_key: &str) {
        let owner = resource_key.to_string();
        if let Err(e) = self
            .cache
            .invalidate_entries_if(move |(resource, _), _| *resource == owner)
        {
            warn!(
                "Failed to invalidate version tokens for {}: {}",
                resource_key, e
            );
            return;
        }

        self.events.dispatch(ControlEvent::VersionsInvalidated {
            resource_key: resource_key.to_string(),
            detected_at: ControlEvent::now(),
        });
    }
}

impl std::fmt::Debug for VersionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionCache")
            .field("config", &self.config)
            .field("entries", &self.cache.entry_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> VersionCache {
        VersionCache::new(VersionCacheConfig::default(), EventDispatcher::logging())
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_then_get_until_ttl() {
        let versions = cache();
        versions.set("wb", "Sheet1!A1", "\"v1\"").await;
        assert_eq!(
            versions.get("wb", "Sheet1!A1").await.as_deref(),
            Some("\"v1\"")
        );

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(versions.get("wb", "Sheet1!A1").await.is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(versions.get("wb", "Sheet1!A1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_restamps() {
        let versions = cache();
        versions.set("wb", "A1", "\"v1\"").await;
        tokio::time::advance(Duration::from_secs(200)).await;
        versions.set("wb", "A1", "\"v2\"").await;
        tokio::time::advance(Duration::from_secs(200)).await;

        assert_eq!(versions.get("wb", "A1").await.as_deref(), Some("\"v2\""));
    }

    #[tokio::test]
    async fn test_invalidate_resource_keeps_other_resources() {
        let versions = cache();
        versions.set("wb-1", "A1", "\"v1\"").await;
        versions.set("wb-1", "B2", "\"v4\"").await;
        versions.set("wb-2", "A1", "\"v9\"").await;

        versions.invalidate_resource("wb-1");

        assert!(versions.get("wb-1", "A1").await.is_none());
        assert!(versions.get("wb-1", "B2").await.is_none());
        assert_eq!(versions.get("wb-2", "A1").await.as_deref(), Some("\"v9\""));
    }

    #[tokio::test]
    async fn test_invalidate_single_entry() {
        let versions = cache();
        versions.set("wb", "A1", "\"v1\"").await;
        versions.set("wb", "A2", "\"v1\"").await;
        versions.invalidate("wb", "A1").await;

        assert!(versions.get("wb", "A1").await.is_none());
        assert!(versions.get("wb", "A2").await.is_some());
    }
}
