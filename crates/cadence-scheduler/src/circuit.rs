//! Per-key circuit breakers guarding calls to flaky dependencies.
//!
//! Each dependency (one per platform, one per generation target) gets its own
//! key, so a failing platform never blocks calls to the others. State lives
//! in a [`DashMap`]; no map guard is held across an `.await`.

use std::fmt;
use std::future::Future;

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{CollaboratorError, SchedulerError};

/// Breaker state for one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    #[default]
    Closed,
    /// Calls are rejected until the open timeout elapses.
    Open,
    /// One trial call is in flight; its result decides the next state.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

/// Error returned from a guarded call.
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// Rejected without calling the operation.
    #[error("circuit open for {key}")]
    Open { key: String },
    /// The operation (or fallback) itself failed.
    #[error(transparent)]
    Failed(E),
}

impl From<CircuitError<SchedulerError>> for SchedulerError {
    fn from(err: CircuitError<SchedulerError>) -> Self {
        match err {
            CircuitError::Open { key } => SchedulerError::CircuitOpen { key },
            CircuitError::Failed(e) => e,
        }
    }
}

impl From<CircuitError<CollaboratorError>> for SchedulerError {
    fn from(err: CircuitError<CollaboratorError>) -> Self {
        match err {
            CircuitError::Open { key } => SchedulerError::CircuitOpen { key },
            CircuitError::Failed(e) => SchedulerError::Collaborator(e),
        }
    }
}

/// Point-in-time view of one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitStatus {
    pub key: String,
    pub state: CircuitState,
    pub failures: u32,
    /// Closed with fewer than half the threshold's failures.
    pub healthy: bool,
}

#[derive(Debug, Clone, Default)]
struct Circuit {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

enum Admission {
    Allowed { trial: bool },
    Rejected,
}

/// Registry of circuit breakers keyed by dependency name.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, Circuit>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
        }
    }

    /// Run `op` through the breaker for `key`.
    pub async fn execute<T, E, F, Fut>(&self, key: &str, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let Admission::Allowed { trial } = self.admit(key) else {
            debug!(key, "circuit open, rejecting call");
            return Err(CircuitError::Open {
                key: key.to_string(),
            });
        };

        self.observe(key, trial, op)
            .await
            .map_err(|(e, _)| CircuitError::Failed(e))
    }

    /// Run `op` through the breaker, using `fallback` while the circuit is open.
    ///
    /// The fallback also runs when this call's failure is the one that opens
    /// the circuit.
    pub async fn execute_with_fallback<T, E, F, Fut, G, GFut>(
        &self,
        key: &str,
        op: F,
        fallback: G,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let Admission::Allowed { trial } = self.admit(key) else {
            debug!(key, "circuit open, using fallback");
            return fallback().await.map_err(CircuitError::Failed);
        };

        match self.observe(key, trial, op).await {
            Ok(value) => Ok(value),
            Err((_, true)) => fallback().await.map_err(CircuitError::Failed),
            Err((e, false)) => Err(CircuitError::Failed(e)),
        }
    }

    /// Current state of `key`. Unknown keys are closed.
    pub fn state(&self, key: &str) -> CircuitState {
        self.circuits
            .get(key)
            .map(|c| c.state)
            .unwrap_or_default()
    }

    pub fn status(&self, key: &str) -> CircuitStatus {
        let circuit = self
            .circuits
            .get(key)
            .map(|c| c.clone())
            .unwrap_or_default();
        self.to_status(key, &circuit)
    }

    /// Status of every key seen so far, sorted by key.
    pub fn all_status(&self) -> Vec<CircuitStatus> {
        let mut all: Vec<_> = self
            .circuits
            .iter()
            .map(|entry| self.to_status(entry.key(), entry.value()))
            .collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    pub fn open_count(&self) -> usize {
        self.circuits
            .iter()
            .filter(|c| c.state == CircuitState::Open)
            .count()
    }

    /// Forget all state for `key`.
    pub fn reset(&self, key: &str) {
        if self.circuits.remove(key).is_some() {
            info!(key, "circuit reset");
        }
    }

    fn to_status(&self, key: &str, circuit: &Circuit) -> CircuitStatus {
        CircuitStatus {
            key: key.to_string(),
            state: circuit.state,
            failures: circuit.failures,
            healthy: circuit.state == CircuitState::Closed
                && f64::from(circuit.failures) < f64::from(self.config.failure_threshold) / 2.0,
        }
    }

    fn admit(&self, key: &str) -> Admission {
        let now = Instant::now();
        let mut circuit = self.circuits.entry(key.to_string()).or_default();

        match circuit.state {
            CircuitState::Closed => Admission::Allowed { trial: false },
            CircuitState::Open => {
                let elapsed = circuit
                    .last_failure
                    .is_none_or(|at| now.duration_since(at) >= self.config.open_timeout());
                if !elapsed {
                    return Admission::Rejected;
                }
                circuit.state = CircuitState::HalfOpen;
                circuit.trial_in_flight = true;
                info!(key, "circuit half-open, admitting trial call");
                Admission::Allowed { trial: true }
            }
            CircuitState::HalfOpen if circuit.trial_in_flight => Admission::Rejected,
            CircuitState::HalfOpen => {
                circuit.trial_in_flight = true;
                Admission::Allowed { trial: true }
            }
        }
    }

    /// Await `op` and record its outcome. On error, also reports whether the
    /// circuit is now open.
    async fn observe<T, E, F, Fut>(&self, key: &str, trial: bool, op: F) -> Result<T, (E, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut guard = TrialGuard {
            breaker: self,
            key,
            armed: trial,
        };
        let result = op().await;
        guard.armed = false;

        match result {
            Ok(value) => {
                self.record_success(key, trial);
                Ok(value)
            }
            Err(e) => {
                let opened = self.record_failure(key, trial);
                warn!(key, error = %e, opened, "guarded call failed");
                Err((e, opened))
            }
        }
    }

    fn record_success(&self, key: &str, trial: bool) {
        let mut circuit = self.circuits.entry(key.to_string()).or_default();
        if trial {
            circuit.state = CircuitState::Closed;
            circuit.failures = 0;
            circuit.trial_in_flight = false;
            info!(key, "circuit closed after successful trial");
        } else {
            circuit.failures = circuit.failures.saturating_sub(1);
        }
    }

    fn record_failure(&self, key: &str, trial: bool) -> bool {
        let mut circuit = self.circuits.entry(key.to_string()).or_default();
        circuit.failures = circuit.failures.saturating_add(1);
        circuit.last_failure = Some(Instant::now());
        if trial {
            circuit.trial_in_flight = false;
        }

        if trial || circuit.failures >= self.config.failure_threshold {
            if circuit.state != CircuitState::Open {
                warn!(key, failures = circuit.failures, "circuit opened");
            }
            circuit.state = CircuitState::Open;
        }
        circuit.state == CircuitState::Open
    }

    /// A trial call was dropped or panicked before reporting back.
    fn abandon_trial(&self, key: &str) {
        if let Some(mut circuit) = self.circuits.get_mut(key)
            && circuit.state == CircuitState::HalfOpen
            && circuit.trial_in_flight
        {
            circuit.state = CircuitState::Open;
            circuit.trial_in_flight = false;
            circuit.last_failure = Some(Instant::now());
            warn!(key, "trial call abandoned, circuit reopened");
        }
    }
}

struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    key: &'a str,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_trial(self.key);
        }
    }
}
