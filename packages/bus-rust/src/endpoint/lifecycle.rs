//! Endpoint lifecycle state with in-flight delivery tracking.
//!
//! Uses `ArcSwap` for lock-free state reads and an atomic counter with RAII
//! guards for in-flight tracking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

/// Receive endpoint state.
///
/// State machine: Created -> Starting -> Running -> Stopping -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Configured, never started.
    Created,
    /// Building pipes and opening the transport subscription.
    Starting,
    /// Consuming.
    Running,
    /// No longer taking deliveries; draining in-flight ones.
    Stopping,
    /// Fully stopped. Cannot be restarted.
    Stopped,
}

impl EndpointState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks an endpoint's state and its in-flight deliveries.
///
/// Transitions are serialized by the endpoint; reads are lock-free.
#[derive(Debug)]
pub struct Lifecycle {
    state: ArcSwap<EndpointState>,
    in_flight: Arc<AtomicU64>,
}

impl Lifecycle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(EndpointState::Created),
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn state(&self) -> EndpointState {
        **self.state.load()
    }

    pub fn set(&self, state: EndpointState) {
        let previous = self.state.swap(Arc::new(state));
        tracing::trace!(from = %previous, to = %state, "endpoint state transition");
    }

    /// Creates an RAII guard that tracks an in-flight delivery.
    ///
    /// The counter is decremented when the guard drops, including during
    /// unwinding.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits for in-flight deliveries to finish, up to `timeout`.
    ///
    /// Returns `true` if everything drained in time.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
