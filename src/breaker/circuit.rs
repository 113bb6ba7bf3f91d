use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cli::config::CircuitBreakerSettings;
use crate::error::BreakerError;
use crate::events::{Event, EventBus, EventKind};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(name)
    }
}

/// Snapshot of a breaker's counters
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub opened_count: u64,
    pub state_changed_at: DateTime<Utc>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,

    /// When the breaker last entered Open
    opened_at: Option<Instant>,
    state_changed_at: DateTime<Utc>,

    /// Trial calls currently running in Half-Open
    half_open_in_flight: u32,

    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_count: u64,
}

/// Fault-tolerance gate for one named external dependency.
///
/// All state lives behind a single mutex that is never held across an
/// `.await`; the wrapped operation runs unlocked.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerSettings,
    inner: Mutex<BreakerInner>,
    bus: Option<EventBus>,
}

/// Releases a Half-Open trial slot if the call is dropped before finishing.
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.breaker.lock();
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: &str, config: CircuitBreakerSettings, bus: Option<EventBus>) -> Self {
        Self {
            name: name.to_string(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                opened_at: None,
                state_changed_at: Utc::now(),
                half_open_in_flight: 0,
                total_calls: 0,
                successful_calls: 0,
                failed_calls: 0,
                rejected_calls: 0,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_count: 0,
            }),
            bus,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    /// Run `op` through the breaker. Rejects without calling `op` while open.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let is_trial = self.admit()?;
        let mut slot = TrialSlot {
            breaker: self,
            armed: is_trial,
        };

        let result = op().await;
        slot.armed = false;

        match &result {
            Ok(_) => self.record_success(is_trial),
            Err(_) => self.record_failure(is_trial),
        }
        result.map_err(BreakerError::Inner)
    }

    /// Decide whether a call may proceed. `Ok(true)` means it is a Half-Open trial.
    fn admit<E>(&self) -> Result<bool, BreakerError<E>> {
        let mut transitions = Vec::new();
        let decision = {
            let mut inner = self.lock();
            self.refresh(&mut inner, &mut transitions);
            inner.total_calls += 1;

            match inner.state {
                CircuitState::Closed => Ok(false),
                CircuitState::Open => {
                    inner.rejected_calls += 1;
                    let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                    Err(BreakerError::Open {
                        name: self.name.clone(),
                        retry_after: self.open_timeout().saturating_sub(elapsed),
                    })
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_in_flight >= self.config.half_open_max_calls {
                        inner.rejected_calls += 1;
                        Err(BreakerError::Open {
                            name: self.name.clone(),
                            retry_after: Duration::ZERO,
                        })
                    } else {
                        inner.half_open_in_flight += 1;
                        Ok(true)
                    }
                }
            }
        };

        self.announce(transitions);
        if decision.is_err() {
            debug!("Circuit '{}' rejected a call", self.name);
        }
        decision
    }

    fn record_success(&self, is_trial: bool) {
        let mut transitions = Vec::new();
        {
            let mut inner = self.lock();
            inner.successful_calls += 1;
            inner.consecutive_successes += 1;
            inner.consecutive_failures = 0;
            if is_trial {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            }
            if inner.state == CircuitState::HalfOpen
                && inner.consecutive_successes >= self.config.success_threshold
            {
                self.transition(&mut inner, CircuitState::Closed, &mut transitions);
            }
        }
        self.announce(transitions);
    }

    fn record_failure(&self, is_trial: bool) {
        let mut transitions = Vec::new();
        {
            let mut inner = self.lock();
            inner.failed_calls += 1;
            inner.consecutive_failures += 1;
            inner.consecutive_successes = 0;
            if is_trial {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            }
            match inner.state {
                CircuitState::Closed
                    if inner.consecutive_failures >= self.config.failure_threshold =>
                {
                    self.transition(&mut inner, CircuitState::Open, &mut transitions);
                }
                CircuitState::HalfOpen => {
                    self.transition(&mut inner, CircuitState::Open, &mut transitions);
                }
                _ => {}
            }
        }
        self.announce(transitions);
    }

    /// Move Open to Half-Open once the timeout has elapsed.
    fn refresh(&self, inner: &mut BreakerInner, transitions: &mut Vec<CircuitState>) {
        if inner.state != CircuitState::Open {
            return;
        }
        let expired = inner
            .opened_at
            .map(|t| t.elapsed() >= self.open_timeout())
            .unwrap_or(true);
        if expired {
            self.transition(inner, CircuitState::HalfOpen, transitions);
        }
    }

    fn transition(
        &self,
        inner: &mut BreakerInner,
        next: CircuitState,
        transitions: &mut Vec<CircuitState>,
    ) {
        if inner.state == next {
            return;
        }
        inner.state = next;
        inner.state_changed_at = Utc::now();
        match next {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.opened_count += 1;
                inner.half_open_in_flight = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = 0;
                inner.consecutive_successes = 0;
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.consecutive_failures = 0;
            }
        }
        transitions.push(next);
    }

    /// Log and publish transitions collected while the lock was held.
    fn announce(&self, transitions: Vec<CircuitState>) {
        for state in transitions {
            let kind = match state {
                CircuitState::Open => {
                    warn!("Circuit '{}' opened", self.name);
                    EventKind::CircuitOpened
                }
                CircuitState::HalfOpen => {
                    info!("Circuit '{}' half-open, allowing trial calls", self.name);
                    EventKind::CircuitHalfOpened
                }
                CircuitState::Closed => {
                    info!("Circuit '{}' closed", self.name);
                    EventKind::CircuitClosed
                }
            };
            if let Some(bus) = &self.bus {
                bus.publish_sync(Event::new(kind, "circuit_breaker").with("name", self.name.clone()));
            }
        }
    }

    /// Current state, applying a pending Open to Half-Open move.
    pub fn state(&self) -> CircuitState {
        let mut transitions = Vec::new();
        let state = {
            let mut inner = self.lock();
            self.refresh(&mut inner, &mut transitions);
            inner.state
        };
        self.announce(transitions);
        state
    }

    /// Time left before an open breaker admits trial calls.
    pub fn retry_after(&self) -> Option<Duration> {
        let inner = self.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at)) => Some(self.open_timeout().saturating_sub(at.elapsed())),
            _ => None,
        }
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.lock();
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            total_calls: inner.total_calls,
            successful_calls: inner.successful_calls,
            failed_calls: inner.failed_calls,
            rejected_calls: inner.rejected_calls,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            opened_count: inner.opened_count,
            state_changed_at: inner.state_changed_at,
        }
    }

    /// Force the breaker back to Closed with clean consecutive counters.
    pub fn reset(&self) {
        let mut transitions = Vec::new();
        {
            let mut inner = self.lock();
            self.transition(&mut inner, CircuitState::Closed, &mut transitions);
            inner.consecutive_failures = 0;
            inner.consecutive_successes = 0;
            inner.half_open_in_flight = 0;
        }
        self.announce(transitions);
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.lock().state)
            .finish()
    }
}

/// Shared handle type used by the manager and its callers
pub type SharedBreaker = Arc<CircuitBreaker>;
