use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-step failure guard.
///
/// Opens once failures reach the threshold. An open breaker half-opens only
/// after `timeout` has elapsed since the last failure, which allows one more
/// attempt; a failure while half-open reopens it.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    threshold: u32,
    timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            threshold: threshold.max(1),
            timeout,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Whether another attempt may go ahead. Moves an open breaker to
    /// half-open once the timeout has elapsed.
    pub fn allows_attempt(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = self
                    .last_failure
                    .map_or(true, |at| at.elapsed() >= self.timeout);
                if cooled {
                    self.state = CircuitState::HalfOpen;
                }
                cooled
            }
        }
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());
        if self.state == CircuitState::HalfOpen || self.failure_count >= self.threshold {
            self.state = CircuitState::Open;
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.last_failure = None;
    }
}

/// Breakers keyed by step id, created on first failure.
#[derive(Debug)]
pub struct CircuitBreakers {
    breakers: HashMap<String, CircuitBreaker>,
    threshold: u32,
    timeout: Duration,
}

impl CircuitBreakers {
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self {
            breakers: HashMap::new(),
            threshold,
            timeout,
        }
    }

    /// Consult the step's breaker and, if it lets the attempt through, count
    /// the failure against it. Returns `false` when the breaker rejected.
    pub fn check_and_record(&mut self, step_id: &str) -> bool {
        let (threshold, timeout) = (self.threshold, self.timeout);
        let breaker = self
            .breakers
            .entry(step_id.to_string())
            .or_insert_with(|| CircuitBreaker::new(threshold, timeout));
        if !breaker.allows_attempt() {
            warn!(step = step_id, failures = breaker.failure_count(), "Circuit breaker open");
            return false;
        }
        breaker.record_failure();
        if breaker.state() == CircuitState::Open {
            warn!(step = step_id, failures = breaker.failure_count(), "Circuit breaker opened");
        }
        true
    }

    pub fn record_success(&mut self, step_id: &str) {
        if let Some(breaker) = self.breakers.get_mut(step_id) {
            if breaker.state() != CircuitState::Closed {
                debug!(step = step_id, "Circuit breaker closed");
            }
            breaker.record_success();
        }
    }

    pub fn state(&self, step_id: &str) -> CircuitState {
        self.breakers
            .get(step_id)
            .map_or(CircuitState::Closed, CircuitBreaker::state)
    }
}
