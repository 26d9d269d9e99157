//! Multi-tier, non-blocking admission control.
//!
//! One global bucket gates all traffic; one bucket per resource gates the
//! traffic to that resource. Buckets are lock-free: each keeps a single
//! "theoretical arrival time" (GCRA), which behaves exactly like a
//! continuously refilled token bucket of the same capacity and rate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use docx_remote_core::{ControlEvent, EventDispatcher, RemoteError};
use tokio::time::Instant;
use tracing::debug;

/// Key of the global bucket in `apply_pause` / `retry_hint`.
pub const GLOBAL_BUCKET: &str = "*";

/// Shape of one token bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    /// Maximum burst
    pub capacity: u32,
    /// Tokens added per second
    pub refill_per_sec: f64,
}

impl BucketConfig {
    pub fn validate(&self, name: &str) -> Result<(), RemoteError> {
        if self.capacity == 0 {
            return Err(RemoteError::Configuration(format!(
                "{} bucket capacity must be at least 1",
                name
            )));
        }
        if !(self.refill_per_sec.is_finite() && self.refill_per_sec > 0.0) {
            return Err(RemoteError::Configuration(format!(
                "{} bucket refill rate must be positive, got {}",
                name, self.refill_per_sec
            )));
        }
        Ok(())
    }
}

/// Configuration for the admission controller.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub global: BucketConfig,
    pub per_resource: BucketConfig,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            global: BucketConfig {
                capacity: 100,
                refill_per_sec: 50.0,
            },
            per_resource: BucketConfig {
                capacity: 10,
                refill_per_sec: 5.0,
            },
        }
    }
}

impl AdmissionConfig {
    pub fn validate(&self) -> Result<(), RemoteError> {
        self.global.validate("global")?;
        self.per_resource.validate("per-resource")
    }
}

/// A lock-free token bucket with a pause override.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_per_sec: f64,
    /// Nanoseconds per token
    interval_ns: u64,
    epoch: Instant,
    /// Theoretical arrival time, nanoseconds since `epoch`
    tat: AtomicU64,
    /// Pause end, nanoseconds since `epoch` (0 = not paused)
    paused_until: AtomicU64,
}

impl TokenBucket {
    pub fn new(config: BucketConfig) -> Self {
        let interval_ns = (1_000_000_000f64 / config.refill_per_sec).max(1.0) as u64;
        Self {
            capacity: config.capacity,
            refill_per_sec: config.refill_per_sec,
            interval_ns,
            epoch: Instant::now(),
            tat: AtomicU64::new(0),
            paused_until: AtomicU64::new(0),
        }
    }

    fn now_ns(&self) -> u64 {
        Instant::now()
            .saturating_duration_since(self.epoch)
            .as_nanos()
            .min(u64::MAX as u128) as u64
    }

    fn burst_ns(&self) -> u64 {
        self.interval_ns.saturating_mul(self.capacity as u64)
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }

    pub fn is_paused(&self) -> bool {
        self.now_ns() < self.paused_until.load(Ordering::Acquire)
    }

    /// Take one token. Never blocks.
    pub fn try_acquire(&self) -> bool {
        let now = self.now_ns();
        if now < self.paused_until.load(Ordering::Acquire) {
            return false;
        }

        let burst = self.burst_ns();
        let mut tat = self.tat.load(Ordering::Acquire);
        loop {
            let next = tat.max(now).saturating_add(self.interval_ns);
            if next - now > burst {
                return false;
            }
            match self
                .tat
                .compare_exchange_weak(tat, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(current) => tat = current,
            }
        }
    }

    /// Give back a token taken by `try_acquire`.
    pub fn refund(&self) {
        let interval = self.interval_ns;
        let _ = self
            .tat
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tat| {
                Some(tat.saturating_sub(interval))
            });
    }

    /// Whole tokens currently available (ignoring any pause).
    pub fn available(&self) -> u32 {
        let now = self.now_ns();
        let debt = self.tat.load(Ordering::Acquire).saturating_sub(now);
        let free = self.burst_ns().saturating_sub(debt);
        (free / self.interval_ns) as u32
    }

    /// Block acquisition until `until`, regardless of tokens. Pauses only
    /// ever extend.
    pub fn pause_until(&self, until: Instant) {
        let until_ns = until
            .saturating_duration_since(self.epoch)
            .as_nanos()
            .min(u64::MAX as u128) as u64;
        self.paused_until.fetch_max(until_ns, Ordering::AcqRel);
    }

    /// Time until an acquisition could succeed.
    pub fn wait_hint(&self) -> Duration {
        let now = self.now_ns();
        let paused = self.paused_until.load(Ordering::Acquire).saturating_sub(now);
        let tat = self.tat.load(Ordering::Acquire);
        let next = tat.max(now).saturating_add(self.interval_ns);
        let token = (next - now).saturating_sub(self.burst_ns());
        Duration::from_nanos(paused.max(token))
    }
}

/// Global plus per-resource admission.
pub struct AdmissionController {
    config: AdmissionConfig,
    global: TokenBucket,
    buckets: DashMap<String, Arc<TokenBucket>>,
    events: EventDispatcher,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig, events: EventDispatcher) -> Self {
        Self {
            global: TokenBucket::new(config.global),
            config,
            buckets: DashMap::new(),
            events,
        }
    }

    fn bucket(&self, bucket_key: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.get(bucket_key) {
            return bucket.clone();
        }
        self.buckets
            .entry(bucket_key.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(self.config.per_resource)))
            .clone()
    }

    /// Non-blocking admission for one attempt against `bucket_key`.
    ///
    /// Both the global bucket and the resource bucket must grant a token;
    /// a resource token taken before a global denial is handed back.
    pub fn try_acquire(&self, bucket_key: &str) -> bool {
        if self.global.is_paused() {
            return false;
        }
        let bucket = self.bucket(bucket_key);
        if !bucket.try_acquire() {
            return false;
        }
        if !self.global.try_acquire() {
            bucket.refund();
            return false;
        }
        true
    }

    /// Install a hard pause (from a server backpressure hint).
    pub fn apply_pause(&self, bucket_key: &str, until: Instant) {
        if bucket_key == GLOBAL_BUCKET {
            self.global.pause_until(until);
        } else {
            self.bucket(bucket_key).pause_until(until);
        }

        let pause = until.saturating_duration_since(Instant::now());
        debug!("Paused admission for {} for {:?}", bucket_key, pause);
        self.events.dispatch(ControlEvent::PauseApplied {
            bucket_key: bucket_key.to_string(),
            pause_ms: pause.as_millis() as u64,
            detected_at: ControlEvent::now(),
        });
    }

    /// How long a denied caller should wait before trying `bucket_key` again.
    pub fn retry_hint(&self, bucket_key: &str) -> Duration {
        let global = self.global.wait_hint();
        if bucket_key == GLOBAL_BUCKET {
            return global;
        }
        let local = self
            .buckets
            .get(bucket_key)
            .map(|b| b.wait_hint())
            .unwrap_or_default();
        global.max(local)
    }

    /// Tokens currently available for `bucket_key`.
    pub fn available(&self, bucket_key: &str) -> u32 {
        if bucket_key == GLOBAL_BUCKET {
            return self.global.available();
        }
        self.buckets
            .get(bucket_key)
            .map(|b| b.available())
            .unwrap_or(self.config.per_resource.capacity)
    }
}

impl AdmissionController {
    /// Number of per-resource buckets currently tracked.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Drop resource buckets that are full and unpaused. A fresh bucket is
    /// indistinguishable from them, so nothing is lost.
    pub fn prune_idle(&self) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| bucket.is_paused() || bucket.available() < bucket.capacity());
        let pruned = before.saturating_sub(self.buckets.len());
        if pruned > 0 {
            debug!("Pruned {} idle admission buckets", pruned);
        }
        pruned
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("config", &self.config)
            .field("buckets", &self.buckets.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(capacity: u32, refill_per_sec: f64) -> TokenBucket {
        TokenBucket::new(BucketConfig {
            capacity,
            refill_per_sec,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_plus_one_yields_capacity() {
        let bucket = bucket(5, 1.0);
        let granted = (0..6).filter(|_| bucket.try_acquire()).count();
        assert_eq!(granted, 5);
        assert_eq!(bucket.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refills_continuously() {
        let bucket = bucket(2, 2.0);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        assert_eq!(bucket.wait_hint(), Duration::from_millis(500));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        // Refill never exceeds capacity
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(bucket.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_overrides_tokens() {
        let bucket = bucket(10, 10.0);
        bucket.pause_until(Instant::now() + Duration::from_secs(3));

        assert!(!bucket.try_acquire());
        assert_eq!(bucket.available(), 10);
        assert_eq!(bucket.wait_hint(), Duration::from_secs(3));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_only_extends() {
        let bucket = bucket(1, 1.0);
        let now = Instant::now();
        bucket.pause_until(now + Duration::from_secs(5));
        bucket.pause_until(now + Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(bucket.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn test_controller_tiers() {
        let config = AdmissionConfig {
            global: BucketConfig {
                capacity: 3,
                refill_per_sec: 1.0,
            },
            per_resource: BucketConfig {
                capacity: 2,
                refill_per_sec: 1.0,
            },
        };
        let admission = AdmissionController::new(config, EventDispatcher::logging());

        assert!(admission.try_acquire("wb-1"));
        assert!(admission.try_acquire("wb-1"));
        // Per-resource bucket exhausted
        assert!(!admission.try_acquire("wb-1"));
        // Unrelated resource still admitted by the global bucket
        assert!(admission.try_acquire("wb-2"));
        // Global exhausted; the resource token is refunded
        assert!(!admission.try_acquire("wb-3"));
        assert_eq!(admission.available("wb-3"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_controller_pause_scopes() {
        let admission =
            AdmissionController::new(AdmissionConfig::default(), EventDispatcher::logging());
        let until = Instant::now() + Duration::from_secs(2);

        admission.apply_pause("wb-1", until);
        assert!(!admission.try_acquire("wb-1"));
        assert!(admission.try_acquire("wb-2"));
        assert_eq!(admission.retry_hint("wb-1"), Duration::from_secs(2));

        admission.apply_pause(GLOBAL_BUCKET, until);
        assert!(!admission.try_acquire("wb-2"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(admission.try_acquire("wb-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_idle_keeps_busy_buckets() {
        let admission =
            AdmissionController::new(AdmissionConfig::default(), EventDispatcher::logging());
        assert!(admission.try_acquire("wb-used"));
        assert!(admission.try_acquire("wb-idle"));
        admission.apply_pause("wb-paused", Instant::now() + Duration::from_secs(10));
        assert_eq!(admission.bucket_count(), 3);

        // Not yet refilled
        assert_eq!(admission.prune_idle(), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(admission.try_acquire("wb-used"));
        assert_eq!(admission.prune_idle(), 1);
        assert_eq!(admission.bucket_count(), 2);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(admission.prune_idle(), 2);
        assert_eq!(admission.bucket_count(), 0);
        assert_eq!(admission.available("wb-used"), 10);
    }
}
