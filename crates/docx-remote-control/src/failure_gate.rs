//! Per-resource circuit breakers.
//!
//! States:
//! - Closed: calls pass; failures inside `failure_window` are counted
//! - Open: calls fail fast until `reset_timeout` has elapsed
//! - HalfOpen: one trial at a time; `success_threshold` consecutive
//!   successes close the circuit, any failure reopens it

use std::time::Duration;

use dashmap::DashMap;
use docx_remote_core::{CircuitState, ControlEvent, EventDispatcher, RemoteError};
use tokio::time::Instant;
use tracing::{info, warn};

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Failures within `failure_window` that open the circuit
    pub failure_threshold: u32,
    pub failure_window: Duration,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,
    /// How long the circuit stays open before a trial is admitted
    pub reset_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Tolerates more failures.
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            failure_window: Duration::from_secs(120),
            success_threshold: 1,
            reset_timeout: Duration::from_secs(15),
        }
    }

    pub fn validate(&self) -> Result<(), RemoteError> {
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(RemoteError::Configuration(
                "circuit thresholds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Breaker record for one resource.
#[derive(Debug, Clone)]
struct CircuitRecord {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    window_started: Instant,
    /// Start of the half-open trial currently in flight
    trial_started: Option<Instant>,
}

impl CircuitRecord {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            window_started: now,
            trial_started: None,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.success_count = 0;
        self.trial_started = None;
    }

    fn close(&mut self, now: Instant) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.opened_at = None;
        self.window_started = now;
        self.trial_started = None;
    }
}

/// Circuit breakers keyed by resource. One troubled resource never blocks
/// another.
pub struct FailureGate {
    config: CircuitConfig,
    circuits: DashMap<String, CircuitRecord>,
    events: EventDispatcher,
}

impl FailureGate {
    pub fn new(config: CircuitConfig, events: EventDispatcher) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
            events,
        }
    }

    fn transition(&self, resource_key: &str, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => warn!("Circuit for {} opened (was {})", resource_key, from),
            _ => info!("Circuit for {} is now {} (was {})", resource_key, to, from),
        }
        self.events.dispatch(ControlEvent::CircuitTransition {
            resource_key: resource_key.to_string(),
            from,
            to,
            detected_at: ControlEvent::now(),
        });
    }

    /// Current state, without side effects.
    pub fn state(&self, resource_key: &str) -> CircuitState {
        self.circuits
            .get(resource_key)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Cooldown left on a circuit that is refusing calls, without claiming
    /// the half-open trial.
    pub fn open_remaining(&self, resource_key: &str) -> Option<Duration> {
        let circuit = self.circuits.get(resource_key)?;
        let since = match (circuit.state, circuit.opened_at, circuit.trial_started) {
            (CircuitState::Open, Some(opened_at), _) => opened_at,
            (CircuitState::HalfOpen, _, Some(started)) => started,
            _ => return None,
        };
        let remaining = self
            .config
            .reset_timeout
            .saturating_sub(Instant::now().saturating_duration_since(since));
        (!remaining.is_zero()).then_some(remaining)
    }

    /// Whether an attempt against `resource_key` must be refused.
    ///
    /// Once `reset_timeout` has elapsed on an open circuit, the first caller
    /// moves it to half-open and is admitted as the trial; everyone else is
    /// refused until that trial's outcome is recorded.
    pub fn is_open(&self, resource_key: &str) -> bool {
        let now = Instant::now();
        let mut transition = None;

        let open = {
            let Some(mut circuit) = self.circuits.get_mut(resource_key) else {
                return false;
            };
            match circuit.state {
                CircuitState::Closed => false,
                CircuitState::Open => {
                    let opened_at = circuit.opened_at.unwrap_or(now);
                    if now.saturating_duration_since(opened_at) >= self.config.reset_timeout {
                        circuit.state = CircuitState::HalfOpen;
                        circuit.success_count = 0;
                        circuit.trial_started = Some(now);
                        transition = Some((CircuitState::Open, CircuitState::HalfOpen));
                        false
                    } else {
                        true
                    }
                }
                CircuitState::HalfOpen => match circuit.trial_started {
                    // A trial that never reported back does not hold the gate forever
                    Some(started)
                        if now.saturating_duration_since(started) < self.config.reset_timeout =>
                    {
                        true
                    }
                    _ => {
                        circuit.trial_started = Some(now);
                        false
                    }
                },
            }
        };

        if let Some((from, to)) = transition {
            self.transition(resource_key, from, to);
        }
        open
    }

    /// `is_open` as a `Result`, with the fast-fail error callers propagate.
    pub fn check(&self, resource_key: &str) -> Result<(), RemoteError> {
        if !self.is_open(resource_key) {
            return Ok(());
        }
        let retry_after = self
            .circuits
            .get(resource_key)
            .and_then(|c| match (c.state, c.opened_at) {
                (CircuitState::Open, Some(opened_at)) => Some(
                    self.config
                        .reset_timeout
                        .saturating_sub(opened_at.elapsed()),
                ),
                _ => None,
            })
            .unwrap_or(self.config.reset_timeout);

        Err(RemoteError::CircuitOpen {
            resource_key: resource_key.to_string(),
            retry_after,
        })
    }

    /// Feed the outcome of an attempt into the breaker.
    pub fn record_outcome(&self, resource_key: &str, success: bool) {
        let now = Instant::now();

        let transition = {
            let mut circuit = self
                .circuits
                .entry(resource_key.to_string())
                .or_insert_with(|| CircuitRecord::new(now));

            match (circuit.state, success) {
                (CircuitState::Closed, true) => {
                    circuit.failure_count = 0;
                    None
                }
                (CircuitState::Closed, false) => {
                    if now.saturating_duration_since(circuit.window_started)
                        > self.config.failure_window
                    {
                        circuit.window_started = now;
                        circuit.failure_count = 0;
                    }
                    circuit.failure_count += 1;
                    if circuit.failure_count >= self.config.failure_threshold {
                        circuit.open(now);
                        Some((CircuitState::Closed, CircuitState::Open))
                    } else {
                        None
                    }
                }
                (CircuitState::HalfOpen, true) => {
                    circuit.trial_started = None;
                    circuit.success_count += 1;
                    if circuit.success_count >= self.config.success_threshold {
                        circuit.close(now);
                        Some((CircuitState::HalfOpen, CircuitState::Closed))
                    } else {
                        None
                    }
                }
                (CircuitState::HalfOpen, false) => {
                    circuit.open(now);
                    Some((CircuitState::HalfOpen, CircuitState::Open))
                }
                // Late outcomes of calls admitted before the circuit opened
                (CircuitState::Open, _) => None,
            }
        };

        if let Some((from, to)) = transition {
            self.transition(resource_key, from, to);
        }
    }
}

impl std::fmt::Debug for FailureGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureGate")
            .field("config", &self.config)
            .field("circuits", &self.circuits.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(success_threshold: u32) -> FailureGate {
        FailureGate::new(
            CircuitConfig {
                failure_threshold: 3,
                failure_window: Duration::from_secs(60),
                success_threshold,
                reset_timeout: Duration::from_secs(30),
            },
            EventDispatcher::logging(),
        )
    }

    fn trip(gate: &FailureGate, key: &str) {
        for _ in 0..3 {
            gate.record_outcome(key, false);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let gate = gate(1);
        gate.record_outcome("wb", false);
        gate.record_outcome("wb", false);
        assert!(!gate.is_open("wb"));

        gate.record_outcome("wb", false);
        assert!(gate.is_open("wb"));
        assert_eq!(gate.state("wb"), CircuitState::Open);

        let err = gate.check("wb").unwrap_err();
        assert!(err.is_local_rejection());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let gate = gate(1);
        gate.record_outcome("wb", false);
        gate.record_outcome("wb", false);
        gate.record_outcome("wb", true);
        gate.record_outcome("wb", false);
        gate.record_outcome("wb", false);
        assert!(!gate.is_open("wb"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_accumulate() {
        let gate = gate(1);
        gate.record_outcome("wb", false);
        gate.record_outcome("wb", false);
        tokio::time::advance(Duration::from_secs(61)).await;
        gate.record_outcome("wb", false);
        assert!(!gate.is_open("wb"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_one_trial_then_closes() {
        let gate = gate(1);
        trip(&gate, "wb");

        tokio::time::advance(Duration::from_secs(30)).await;
        // Exactly one trial
        assert!(!gate.is_open("wb"));
        assert_eq!(gate.state("wb"), CircuitState::HalfOpen);
        assert!(gate.is_open("wb"));

        gate.record_outcome("wb", true);
        assert_eq!(gate.state("wb"), CircuitState::Closed);
        assert!(!gate.is_open("wb"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_restarts_timeout() {
        let gate = gate(1);
        trip(&gate, "wb");

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!gate.is_open("wb"));
        gate.record_outcome("wb", false);
        assert_eq!(gate.state("wb"), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(gate.is_open("wb"));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!gate.is_open("wb"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_threshold_needs_consecutive_trials() {
        let gate = gate(2);
        trip(&gate, "wb");
        tokio::time::advance(Duration::from_secs(30)).await;

        assert!(!gate.is_open("wb"));
        gate.record_outcome("wb", true);
        assert_eq!(gate.state("wb"), CircuitState::HalfOpen);

        // Next trial admitted once the previous one reported
        assert!(!gate.is_open("wb"));
        gate.record_outcome("wb", true);
        assert_eq!(gate.state("wb"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resources_are_isolated() {
        let gate = gate(1);
        trip(&gate, "wb-bad");
        assert!(gate.is_open("wb-bad"));
        assert!(!gate.is_open("wb-good"));
        assert!(gate.check("wb-good").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_remaining_does_not_claim_trial() {
        let gate = gate(1);
        assert_eq!(gate.open_remaining("wb"), None);
        trip(&gate, "wb");

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(gate.open_remaining("wb"), Some(Duration::from_secs(20)));

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(gate.open_remaining("wb"), None);
        assert_eq!(gate.state("wb"), CircuitState::Open);

        // The trial is still there for the caller that checks
        assert!(!gate.is_open("wb"));
        assert_eq!(gate.open_remaining("wb"), Some(Duration::from_secs(30)));
    }
}
