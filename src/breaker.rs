//! Per-backend circuit breaker.
//!
//! `Closed` opens after `failure_threshold` consecutive failures. `Open` blocks
//! every call until its cool-down elapses; the first eligibility check after that
//! moves it to `HalfOpen` and claims the single trial call. The trial's result
//! closes the breaker or reopens it with a fresh timer.
//!
//! Dispatching code should go through [`CircuitBreaker::acquire`]: the returned
//! [`BreakerPermit`] gives its half-open trial back when dropped unrecorded, so a
//! caller that stops waiting can never wedge the breaker in `HalfOpen`.

use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::read_env;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerSignal {
    Success,
    Failure,
    /// Counts as a failure but opens with the shorter rate-limit cool-down.
    RateLimited,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub rate_limit_recovery: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(20),
            rate_limit_recovery: Duration::from_secs(5),
        }
    }
}

impl BreakerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            failure_threshold: read_env("ASSIST_FAILURE_THRESHOLD", defaults.failure_threshold),
            recovery_timeout: Duration::from_secs(read_env(
                "ASSIST_RECOVERY_TIMEOUT_SECS",
                defaults.recovery_timeout.as_secs(),
            )),
            rate_limit_recovery: Duration::from_secs(read_env(
                "ASSIST_RATE_LIMIT_RECOVERY_SECS",
                defaults.rate_limit_recovery.as_secs(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    backend_id: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    open_for: Duration,
    /// Generation of the half-open trial currently claimed, if any.
    trial: Option<u64>,
    trial_generation: u64,
}

/// Permission for one dispatch. Holds the half-open trial when the breaker
/// granted one.
#[must_use = "dropping the permit unrecorded gives the trial back"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: Option<u64>,
}

impl BreakerPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }

    /// Records the call's outcome. Returns `true` when this opened the breaker.
    pub fn record(mut self, signal: BreakerSignal) -> bool {
        self.trial = None;
        self.breaker.record(signal)
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if let Some(generation) = self.trial.take() {
            self.breaker.release_generation(generation);
        }
    }
}

impl CircuitBreaker {
    pub fn new(backend_id: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            backend_id: backend_id.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                open_for: config.recovery_timeout,
                trial: None,
                trial_generation: 0,
            }),
        }
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn is_eligible(&self) -> bool {
        self.is_eligible_at(Instant::now())
    }

    pub fn acquire(&self) -> Option<BreakerPermit<'_>> {
        self.acquire_at(Instant::now())
    }

    pub fn record(&self, signal: BreakerSignal) -> bool {
        self.record_at(signal, Instant::now())
    }

    /// Gives back a half-open trial whose call was abandoned before completing.
    pub fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.trial = None;
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
        }
    }

    /// State as seen by ranking: an `Open` breaker whose cool-down has elapsed
    /// reports `HalfOpen` without claiming the trial.
    pub fn state_at(&self, now: Instant) -> BreakerState {
        let inner = self.lock();
        match (inner.state, inner.opened_at) {
            (BreakerState::Open, Some(opened_at))
                if now.saturating_duration_since(opened_at) >= inner.open_for =>
            {
                BreakerState::HalfOpen
            }
            (state, _) => state,
        }
    }

    /// Claims the half-open trial as a side effect; pair it with `record` or
    /// `release_trial`, or use [`acquire_at`](Self::acquire_at) instead.
    pub fn is_eligible_at(&self, now: Instant) -> bool {
        self.claim_at(now).is_some()
    }

    pub fn acquire_at(&self, now: Instant) -> Option<BreakerPermit<'_>> {
        self.claim_at(now).map(|trial| BreakerPermit {
            breaker: self,
            trial,
        })
    }

    /// Returns `true` when this call opened the breaker.
    pub fn record_at(&self, signal: BreakerSignal, now: Instant) -> bool {
        let mut inner = self.lock();
        if signal == BreakerSignal::Success {
            if inner.state != BreakerState::Closed {
                info!(backend = %self.backend_id, "breaker closed");
            }
            inner.state = BreakerState::Closed;
            inner.consecutive_failures = 0;
            inner.opened_at = None;
            inner.trial = None;
            return false;
        }

        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let should_open = match inner.state {
            BreakerState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            BreakerState::HalfOpen => true,
            // Late result from a call dispatched before the breaker opened.
            BreakerState::Open => false,
        };
        if !should_open {
            return false;
        }

        inner.open_for = match signal {
            BreakerSignal::RateLimited => self.config.rate_limit_recovery,
            _ => self.config.recovery_timeout,
        };
        inner.state = BreakerState::Open;
        inner.opened_at = Some(now);
        inner.trial = None;
        warn!(
            backend = %self.backend_id,
            failures = inner.consecutive_failures,
            cooldown_ms = inner.open_for.as_millis() as u64,
            "circuit opened for backend"
        );
        true
    }

    /// `Some(None)` for a closed breaker, `Some(Some(generation))` for a claimed
    /// half-open trial, `None` when the call must be rejected.
    fn claim_at(&self, now: Instant) -> Option<Option<u64>> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Some(None),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|opened_at| now.saturating_duration_since(opened_at) >= inner.open_for)
                    .unwrap_or(true);
                if !elapsed {
                    return None;
                }
                inner.state = BreakerState::HalfOpen;
                info!(backend = %self.backend_id, "breaker half-open, trial permitted");
                Some(Some(inner.claim_trial()))
            }
            BreakerState::HalfOpen => {
                if inner.trial.is_some() {
                    return None;
                }
                Some(Some(inner.claim_trial()))
            }
        }
    }

    fn release_generation(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen && inner.trial == Some(generation) {
            inner.trial = None;
            info!(backend = %self.backend_id, "abandoned half-open trial released");
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BreakerInner {
    fn claim_trial(&mut self) -> u64 {
        self.trial_generation = self.trial_generation.wrapping_add(1);
        self.trial = Some(self.trial_generation);
        self.trial_generation
    }
}
