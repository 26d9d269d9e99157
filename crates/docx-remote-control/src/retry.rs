//! Failure classification and bounded retry loops.
//!
//! | Condition                     | Action                         | Max retries |
//! |-------------------------------|--------------------------------|-------------|
//! | backpressure hint present     | wait exact hint                | 5           |
//! | transient server fault        | exponential backoff, base 1s   | 3           |
//! | service unavailable           | exponential backoff, base 2s   | 3           |
//! | resource busy/locked          | exponential backoff, base 2s   | 5           |
//! | lease invalid                 | recreate lease                 | 1           |
//! | credential expired            | refresh credential             | 1           |
//! | version/precondition mismatch | drop cached token, re-read     | 3           |
//! | permission/not-found/invalid  | none                           | 0           |

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use docx_remote_core::{CredentialSource, ErrorKind, RemoteError};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::admission::AdmissionController;
use crate::failure_gate::FailureGate;

/// Floor for admission waits so a zero hint cannot spin.
const MIN_ADMISSION_WAIT: Duration = Duration::from_millis(1);

/// What to do about a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    RetryAfter(Duration),
    RecreateLeaseAndRetry,
    RefreshCredentialAndRetry,
    ReReadAndRetry,
    DoNotRetry,
}

/// Failure classes with independent retry budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryClass {
    Backpressure,
    TransientFault,
    Unavailable,
    Busy,
    LeaseInvalid,
    CredentialExpired,
    VersionMismatch,
    NonRetryable,
}

impl RetryClass {
    pub fn of(error: &RemoteError) -> Self {
        if error.retry_after().is_some() && error.is_retryable() {
            if let RemoteError::CircuitOpen { .. } = error {
                return Self::NonRetryable;
            }
            return Self::Backpressure;
        }
        match error {
            RemoteError::RateLimited { .. } | RemoteError::AdmissionDenied { .. } => {
                Self::Backpressure
            }
            RemoteError::ServerFault { .. } | RemoteError::Timeout(_) | RemoteError::Network(_) => {
                Self::TransientFault
            }
            RemoteError::Unavailable { .. } => Self::Unavailable,
            RemoteError::ResourceBusy { .. } => Self::Busy,
            RemoteError::LeaseInvalid(_) => Self::LeaseInvalid,
            RemoteError::CredentialExpired(_) => Self::CredentialExpired,
            RemoteError::VersionMismatch { .. } => Self::VersionMismatch,
            _ => Self::NonRetryable,
        }
    }
}

/// Retry budget and backoff base of one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryRule {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryRule {
    const fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }
}

/// The retry policy table.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub backpressure: RetryRule,
    pub transient_fault: RetryRule,
    pub unavailable: RetryRule,
    pub busy: RetryRule,
    pub lease_invalid: RetryRule,
    pub credential_expired: RetryRule,
    pub version_mismatch: RetryRule,
    /// Upper bound for any single backoff
    pub max_backoff: Duration,
    /// Upper bound on attempts across all classes
    pub max_attempts: u32,
    /// How many admission denials an operation waits out before giving up
    pub max_admission_waits: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backpressure: RetryRule::new(5, Duration::from_secs(2)),
            transient_fault: RetryRule::new(3, Duration::from_secs(1)),
            unavailable: RetryRule::new(3, Duration::from_secs(2)),
            busy: RetryRule::new(5, Duration::from_secs(2)),
            lease_invalid: RetryRule::new(1, Duration::ZERO),
            credential_expired: RetryRule::new(1, Duration::ZERO),
            version_mismatch: RetryRule::new(3, Duration::ZERO),
            max_backoff: Duration::from_secs(60),
            max_attempts: 10,
            max_admission_waits: 50,
        }
    }
}

impl RetryPolicy {
    pub fn rule(&self, class: RetryClass) -> RetryRule {
        match class {
            RetryClass::Backpressure => self.backpressure,
            RetryClass::TransientFault => self.transient_fault,
            RetryClass::Unavailable => self.unavailable,
            RetryClass::Busy => self.busy,
            RetryClass::LeaseInvalid => self.lease_invalid,
            RetryClass::CredentialExpired => self.credential_expired,
            RetryClass::VersionMismatch => self.version_mismatch,
            RetryClass::NonRetryable => RetryRule::new(0, Duration::ZERO),
        }
    }

    /// `base * 2^retry`, capped at `max_backoff`.
    pub fn backoff(&self, base: Duration, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        base.saturating_mul(factor).min(self.max_backoff)
    }

    /// Decide the action for `error` given how many retries its class has
    /// already used.
    pub fn classify_attempt(&self, error: &RemoteError, retry: u32) -> RetryAction {
        let class = RetryClass::of(error);
        let rule = self.rule(class);
        match class {
            RetryClass::NonRetryable => RetryAction::DoNotRetry,
            RetryClass::Backpressure => RetryAction::RetryAfter(
                error
                    .retry_after()
                    .unwrap_or_else(|| self.backoff(rule.base_delay, retry)),
            ),
            RetryClass::TransientFault | RetryClass::Unavailable | RetryClass::Busy => {
                RetryAction::RetryAfter(self.backoff(rule.base_delay, retry))
            }
            RetryClass::LeaseInvalid => RetryAction::RecreateLeaseAndRetry,
            RetryClass::CredentialExpired => RetryAction::RefreshCredentialAndRetry,
            RetryClass::VersionMismatch => RetryAction::ReReadAndRetry,
        }
    }

    pub fn validate(&self) -> Result<(), RemoteError> {
        if self.max_attempts == 0 {
            return Err(RemoteError::Configuration(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Hints handed to each attempt about what the previous failure asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttemptContext {
    /// 1-based attempt number
    pub attempt: u32,
    /// The previous attempt hit an invalid lease
    pub recreate_lease: bool,
    /// The credential source was asked to refresh
    pub refresh_credential: bool,
    /// The previous attempt hit a version conflict; re-read before writing
    pub reread: bool,
}

/// Per-call limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// Overrides the policy's `max_attempts`
    pub max_attempts: Option<u32>,
    /// Give up (with `DeadlineExceeded`) once this instant passes
    pub deadline: Option<Instant>,
    /// An earlier attempt made elsewhere already failed with this class; it
    /// counts against the attempt and class budgets
    pub after_failure: Option<RetryClass>,
}

impl ExecuteOptions {
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..Default::default()
        }
    }

    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Default::default()
        }
    }

    /// Continue the retry sequence of an attempt that failed with `class`.
    pub fn after_failure(self, class: RetryClass) -> Self {
        Self {
            after_failure: Some(class),
            ..self
        }
    }
}

/// Drives bounded retry loops under admission and circuit control.
pub struct RetryOrchestrator {
    policy: RetryPolicy,
    admission: Arc<AdmissionController>,
    gate: Arc<FailureGate>,
    credentials: Option<Arc<dyn CredentialSource>>,
}

impl RetryOrchestrator {
    pub fn new(
        policy: RetryPolicy,
        admission: Arc<AdmissionController>,
        gate: Arc<FailureGate>,
    ) -> Self {
        Self {
            policy,
            admission,
            gate,
            credentials: None,
        }
    }

    /// Refresh this source on `RefreshCredentialAndRetry`.
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn gate(&self) -> &Arc<FailureGate> {
        &self.gate
    }

    /// First-retry action for `error`.
    pub fn classify(&self, error: &RemoteError) -> RetryAction {
        self.policy.classify_attempt(error, 0)
    }

    /// Sleep for `delay`, or until `deadline` if that comes first.
    async fn backoff(
        delay: Duration,
        deadline: Option<Instant>,
        attempts: u32,
    ) -> Result<(), RemoteError> {
        let wake = Instant::now() + delay;
        match deadline {
            Some(deadline) if deadline <= wake => {
                tokio::time::sleep_until(deadline).await;
                Err(RemoteError::DeadlineExceeded { attempts })
            }
            _ => {
                tokio::time::sleep_until(wake).await;
                Ok(())
            }
        }
    }

    fn record(&self, scope: &str, error: &RemoteError) {
        if error.is_fault() {
            self.gate.record_outcome(scope, false);
        } else if !error.is_local_rejection() && error.kind() != ErrorKind::Configuration {
            // The remote answered coherently
            self.gate.record_outcome(scope, true);
        }
    }

    /// Run `attempt` until it succeeds, fails permanently, exhausts its
    /// retry budget, or passes the deadline.
    ///
    /// Before every attempt the resource's admission bucket is consulted
    /// (denials are waited out) and its circuit is checked (an open circuit
    /// fails fast with `CircuitOpen`). Every outcome is fed back into the
    /// circuit.
    #[instrument(skip(self, attempt), level = "debug")]
    pub async fn execute<T, F, Fut>(
        &self,
        scope: &str,
        options: ExecuteOptions,
        mut attempt: F,
    ) -> Result<T, RemoteError>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.policy.max_attempts)
            .max(1);
        let mut attempts = 0u32;
        let mut admission_waits = 0u32;
        let mut retries: HashMap<RetryClass, u32> = HashMap::new();
        let mut ctx = AttemptContext::default();
        if let Some(class) = options.after_failure {
            attempts = 1;
            retries.insert(class, 1);
        }

        loop {
            if let Some(deadline) = options.deadline {
                if Instant::now() >= deadline {
                    return Err(RemoteError::DeadlineExceeded { attempts });
                }
            }

            // An open circuit refuses before any admission token is spent
            if let Some(retry_after) = self.gate.open_remaining(scope) {
                debug!("Circuit for {} open, refusing for {:?}", scope, retry_after);
                return Err(RemoteError::CircuitOpen {
                    resource_key: scope.to_string(),
                    retry_after,
                });
            }

            if !self.admission.try_acquire(scope) {
                let wait = self.admission.retry_hint(scope).max(MIN_ADMISSION_WAIT);
                admission_waits += 1;
                if admission_waits > self.policy.max_admission_waits {
                    warn!(
                        "Admission for {} denied {} times, giving up",
                        scope, admission_waits
                    );
                    return Err(RemoteError::RetriesExhausted {
                        attempts,
                        last: Box::new(RemoteError::AdmissionDenied {
                            bucket: scope.to_string(),
                            retry_after: wait,
                        }),
                    });
                }
                debug!("Admission for {} denied, waiting {:?}", scope, wait);
                Self::backoff(wait, options.deadline, attempts).await?;
                continue;
            }

            self.gate.check(scope)?;

            attempts += 1;
            ctx.attempt = attempts;
            let outcome = match options.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, attempt(ctx))
                    .await
                    .map_err(|_| RemoteError::DeadlineExceeded { attempts })?,
                None => attempt(ctx).await,
            };
            ctx = AttemptContext::default();

            let error = match outcome {
                Ok(value) => {
                    self.gate.record_outcome(scope, true);
                    if attempts > 1 {
                        info!(
                            "Operation on {} succeeded after {} attempts",
                            scope, attempts
                        );
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };
            self.record(scope, &error);

            let class = RetryClass::of(&error);
            let used = retries.entry(class).or_insert(0);
            let action = self.policy.classify_attempt(&error, *used);
            if action == RetryAction::DoNotRetry {
                debug!("Operation on {} failed permanently: {}", scope, error);
                return Err(error);
            }
            if *used >= self.policy.rule(class).max_retries || attempts >= max_attempts {
                warn!(
                    "Operation on {} failed after {} attempts: {}",
                    scope, attempts, error
                );
                return Err(RemoteError::RetriesExhausted {
                    attempts,
                    last: Box::new(error),
                });
            }
            *used += 1;

            match action {
                RetryAction::RetryAfter(delay) => {
                    if let Some(hint) = error.retry_after() {
                        if !error.is_local_rejection() {
                            self.admission.apply_pause(scope, Instant::now() + hint);
                        }
                    }
                    warn!(
                        "Operation on {} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        scope, attempts, max_attempts, error, delay
                    );
                    Self::backoff(delay, options.deadline, attempts).await?;
                }
                RetryAction::RecreateLeaseAndRetry => {
                    debug!("Lease for {} invalid, recreating", scope);
                    ctx.recreate_lease = true;
                }
                RetryAction::RefreshCredentialAndRetry => {
                    debug!("Credential rejected for {}, refreshing", scope);
                    if let Some(credentials) = &self.credentials {
                        credentials.refresh().await?;
                    }
                    ctx.refresh_credential = true;
                }
                RetryAction::ReReadAndRetry => {
                    debug!("Version conflict on {}, re-reading", scope);
                    ctx.reread = true;
                }
                RetryAction::DoNotRetry => return Err(error),
            }
        }
    }
}

impl std::fmt::Debug for RetryOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOrchestrator")
            .field("policy", &self.policy)
            .field("has_credentials", &self.credentials.is_some())
            .finish_non_exhaustive()
    }
}
