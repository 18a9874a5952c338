use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Gate state for an upstream dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests pass through.
    Closed,
    /// Threshold breached; requests fail fast until the reset timeout.
    Open,
    /// Probing recovery with live requests.
    HalfOpen,
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("Circuit breaker is open: {0}")]
    Open(String),

    #[error(transparent)]
    Inner(E),
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: usize,
    probe_successes: usize,
    last_failure: Option<Instant>,
}

/// Fail-fast gate in front of an unreliable upstream.
///
/// `failure_threshold` consecutive failures open the gate. Once
/// `reset_timeout` has passed since the last failure, requests are let
/// through as probes, and `success_threshold` successful probes close the
/// gate again. Any probe failure reopens it immediately.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: usize,
    success_threshold: usize,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: usize,
        success_threshold: usize,
        reset_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            success_threshold,
            reset_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                probe_successes: 0,
                last_failure: None,
            }),
        }
    }

    /// Run `f` unless the gate rejects the request. The future is only
    /// polled when admitted, so a rejected call costs nothing upstream.
    pub async fn call<F, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        if let Some(rejection) = self.admit() {
            return Err(CircuitBreakerError::Open(rejection));
        }

        match f.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// `None` admits the request, `Some` carries the rejection message.
    fn admit(&self) -> Option<String> {
        let mut inner = self.lock();
        if inner.state != CircuitState::Open {
            return None;
        }
        let Some(last_failure) = inner.last_failure else {
            return None;
        };

        let elapsed = last_failure.elapsed();
        if elapsed > self.reset_timeout {
            info!(
                "CircuitBreaker [{}]: Open -> HalfOpen, probing recovery",
                self.name
            );
            inner.state = CircuitState::HalfOpen;
            inner.probe_successes = 0;
            None
        } else {
            Some(format!(
                "circuit [{}] open, retry in {:?}",
                self.name,
                self.reset_timeout - elapsed
            ))
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.probe_successes += 1;
                if inner.probe_successes >= self.success_threshold {
                    info!(
                        "CircuitBreaker [{}]: HalfOpen -> Closed after {} successful probes",
                        self.name, inner.probe_successes
                    );
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.probe_successes = 0;
                }
            }
            CircuitState::Open => {
                warn!(
                    "CircuitBreaker [{}]: Success recorded while open",
                    self.name
                );
            }
        }
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.failure_threshold {
                    error!(
                        "CircuitBreaker [{}]: Closed -> Open after {} consecutive failures",
                        self.name, inner.consecutive_failures
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    "CircuitBreaker [{}]: HalfOpen -> Open, probe failed",
                    self.name
                );
                inner.state = CircuitState::Open;
                inner.probe_successes = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
