//! Circuit breaker filter.
//!
//! Closed: deliveries flow, consecutive failures are counted. Once the count
//! reaches the threshold the circuit opens and every delivery fails fast
//! with `CircuitBreakerOpen`. After the reset interval a single trial
//! delivery is admitted (half-open): success closes the circuit, failure
//! re-opens it.
//!
//! The failure counter is atomic. The state lock is held only while a
//! transition is decided, never across `next`. A trial that neither succeeds
//! nor fails (the downstream panicked or the future was dropped) re-opens the
//! circuit and restarts the reset interval.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{BusResult, Error};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::pipe::{Filter, Pipe, PipeContext, ProbeContext};

/// Externally visible circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "halfOpen",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Circuit {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

enum Admission {
    Normal,
    Trial,
}

/// Shared across all concurrent deliveries of one pipe.
#[derive(Debug)]
pub struct CircuitBreakerFilter {
    failure_threshold: u32,
    reset_interval: Duration,
    consecutive_failures: AtomicU32,
    circuit: Mutex<Circuit>,
}

impl CircuitBreakerFilter {
    #[must_use]
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            reset_interval: config.reset_interval(),
            consecutive_failures: AtomicU32::new(0),
            circuit: Mutex::new(Circuit::Closed),
        }
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        match *self.circuit.lock() {
            Circuit::Closed => CircuitState::Closed,
            Circuit::Open { .. } => CircuitState::Open,
            Circuit::HalfOpen => CircuitState::HalfOpen,
        }
    }

    fn admit(&self) -> Option<Admission> {
        let mut circuit = self.circuit.lock();
        match *circuit {
            Circuit::Closed => Some(Admission::Normal),
            Circuit::Open { since } if since.elapsed() >= self.reset_interval => {
                *circuit = Circuit::HalfOpen;
                tracing::info!("circuit breaker half-open, admitting trial delivery");
                Some(Admission::Trial)
            }
            Circuit::Open { .. } | Circuit::HalfOpen => None,
        }
    }

    fn reopen(&self, failures: u32) {
        *self.circuit.lock() = Circuit::Open {
            since: Instant::now(),
        };
        tracing::warn!(
            consecutive_failures = failures,
            reset_interval_ms = u64::try_from(self.reset_interval.as_millis()).unwrap_or(u64::MAX),
            "circuit breaker opened"
        );
    }

    fn on_success(&self, admission: &Admission) {
        self.consecutive_failures.store(0, Ordering::Release);
        if matches!(admission, Admission::Trial) {
            *self.circuit.lock() = Circuit::Closed;
            tracing::info!("circuit breaker closed");
        }
    }

    fn on_failure(&self, admission: &Admission) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let trip = match admission {
            Admission::Trial => true,
            Admission::Normal => {
                failures >= self.failure_threshold
                    && matches!(*self.circuit.lock(), Circuit::Closed)
            }
        };
        if trip {
            self.reopen(failures);
        }
    }
}

/// Holds an admission until its outcome is recorded. Dropping an unsettled
/// trial re-opens the circuit.
struct AdmissionGuard<'a> {
    breaker: &'a CircuitBreakerFilter,
    admission: Admission,
    settled: bool,
}

impl AdmissionGuard<'_> {
    fn settle(mut self, result: &BusResult<()>) {
        self.settled = true;
        match result {
            Ok(()) => self.breaker.on_success(&self.admission),
            Err(_) => self.breaker.on_failure(&self.admission),
        }
    }
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        if !self.settled && matches!(self.admission, Admission::Trial) {
            tracing::warn!("circuit breaker trial delivery abandoned");
            self.breaker
                .reopen(self.breaker.consecutive_failures.load(Ordering::Acquire));
        }
    }
}

#[async_trait]
impl<C: PipeContext> Filter<C> for CircuitBreakerFilter {
    async fn send(&self, ctx: &mut C, next: &dyn Pipe<C>) -> BusResult<()> {
        let Some(admission) = self.admit() else {
            return Err(Error::CircuitBreakerOpen.into());
        };
        let guard = AdmissionGuard {
            breaker: self,
            admission,
            settled: false,
        };

        let result = next.send(ctx).await;
        guard.settle(&result);
        result
    }

    fn probe(&self, probe: &mut ProbeContext) {
        probe
            .add("circuitBreaker")
            .set("state", self.state().as_str())
            .set("failureThreshold", self.failure_threshold)
            .set(
                "resetIntervalMs",
                u64::try_from(self.reset_interval.as_millis()).unwrap_or(u64::MAX),
            );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
