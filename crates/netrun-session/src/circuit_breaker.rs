//! Circuit breaker for fragile external dependencies
//!
//! Implements the circuit breaker pattern so repeated failures of a remote
//! dependency (artifact storage, primarily) fail fast instead of tying up
//! device sessions in doomed uploads.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use netrun_core::{NetrunError, Result};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - calls allowed
    Closed,
    /// Too many failures - reject calls immediately
    Open,
    /// Recovery window elapsed - allow probe calls
    HalfOpen,
}

#[derive(Debug, Default)]
struct BreakerInner {
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
}

/// Read-only breaker snapshot for monitoring
#[derive(Debug, Clone)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    /// Time until the next probe is allowed; zero unless OPEN
    pub remaining_recovery: Duration,
}

/// Circuit breaker with CLOSED/OPEN/HALF_OPEN semantics
///
/// State is *derived* from the counters and the last failure stamp: a
/// stored OPEN becomes logically HALF_OPEN once the recovery timeout has
/// elapsed, without mutating anything until the next recorded outcome.
///
/// # Example
///
/// ```
/// use netrun_session::CircuitBreaker;
///
/// let cb = CircuitBreaker::new("storage", 3, std::time::Duration::from_secs(60), 1);
///
/// cb.record_failure();
/// cb.record_failure();
/// cb.record_failure();
///
/// // Circuit is now open
/// assert_eq!(cb.state(), netrun_session::CircuitState::Open);
/// ```
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    success_threshold: u32,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    ///
    /// # Arguments
    ///
    /// * `name` - Label used in errors and logs
    /// * `failure_threshold` - Recorded failures before the circuit opens
    /// * `recovery_timeout` - Wait after the last failure before probing
    /// * `success_threshold` - Consecutive half-open successes to close
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        recovery_timeout: Duration,
        success_threshold: u32,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            recovery_timeout,
            success_threshold,
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    /// Build from configuration
    pub fn from_config(name: impl Into<String>, config: &netrun_core::BreakerConfig) -> Self {
        Self::new(
            name,
            config.failure_threshold,
            config.recovery_timeout(),
            config.success_threshold,
        )
    }

    fn derive_state(&self, inner: &BreakerInner) -> CircuitState {
        if inner.failures < self.failure_threshold {
            return CircuitState::Closed;
        }
        let elapsed = inner
            .last_failure
            .map(|t| t.elapsed())
            .unwrap_or(self.recovery_timeout);
        if elapsed >= self.recovery_timeout {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock().unwrap();
        self.derive_state(&inner)
    }

    /// Run `fut` under the breaker
    ///
    /// If the derived state is OPEN the future is never polled and
    /// [`NetrunError::CircuitOpen`] is returned with the remaining
    /// recovery time. Otherwise the outcome is recorded and the original
    /// error is re-raised unchanged - the breaker never swallows it.
    pub async fn call<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        {
            let inner = self.inner.lock().unwrap();
            if self.derive_state(&inner) == CircuitState::Open {
                let remaining = self.remaining_recovery(&inner);
                return Err(NetrunError::CircuitOpen {
                    name: self.name.clone(),
                    remaining,
                });
            }
        }

        match fut.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    /// Record a successful operation
    ///
    /// In HALF_OPEN, counts toward the success threshold and closes the
    /// circuit once reached; otherwise resets the failure counter.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if self.derive_state(&inner) == CircuitState::HalfOpen {
            inner.successes += 1;
            if inner.successes >= self.success_threshold {
                tracing::info!("Circuit '{}' closed after successful recovery", self.name);
                inner.failures = 0;
                inner.successes = 0;
            }
        } else {
            inner.failures = 0;
        }
    }

    /// Record a failed operation
    ///
    /// Stamps the failure time; a failure while HALF_OPEN reopens the
    /// circuit immediately.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        let was_half_open = self.derive_state(&inner) == CircuitState::HalfOpen;
        inner.failures += 1;
        inner.successes = 0;
        inner.last_failure = Some(Instant::now());

        let now_open = inner.failures >= self.failure_threshold;
        if was_half_open {
            tracing::warn!("Circuit '{}' reopened by probe failure", self.name);
        } else if now_open {
            tracing::warn!(
                "Circuit '{}' opened after {} failures",
                self.name,
                inner.failures
            );
        }
    }

    fn remaining_recovery(&self, inner: &BreakerInner) -> Duration {
        match self.derive_state(inner) {
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                self.recovery_timeout.saturating_sub(elapsed)
            }
            _ => Duration::ZERO,
        }
    }

    /// Read-only snapshot of counters and derived state
    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock().unwrap();
        BreakerStats {
            name: self.name.clone(),
            state: self.derive_state(&inner),
            failures: inner.failures,
            successes: inner.successes,
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            remaining_recovery: self.remaining_recovery(&inner),
        }
    }
}
