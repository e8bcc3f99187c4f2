//! Bus and endpoint configuration.
//!
//! Plain structs with `Default` impls. Durations are carried as `*_ms`
//! integers so the structs deserialize from any serde format without
//! extra adapters.

use std::time::Duration;

use courier_core::MessageSerializer;
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Bus-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BusConfig {
    /// Name used in logs and as the source queue of published messages.
    pub name: String,
    /// Serializer used for outgoing bodies.
    pub serializer: MessageSerializer,
    /// Whether outgoing envelopes carry host provenance.
    pub stamp_host: bool,
    /// Defaults applied to every receive endpoint.
    pub endpoint_defaults: EndpointConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            name: "courier".to_string(),
            serializer: MessageSerializer::Json,
            stamp_host: true,
            endpoint_defaults: EndpointConfig::default(),
        }
    }
}

/// What to do with a delivery whose body cannot be decoded.
///
/// The same policy applies regardless of transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeserializationFailurePolicy {
    /// Move the delivery to the endpoint's `_error` queue.
    #[default]
    DeadLetter,
    /// Acknowledge and discard the delivery.
    Drop,
    /// Return the delivery to the queue.
    Requeue,
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a trial delivery.
    pub reset_interval_ms: u64,
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn reset_interval(&self) -> Duration {
        Duration::from_millis(self.reset_interval_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_interval_ms: 60_000,
        }
    }
}

/// Per-endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EndpointConfig {
    /// Maximum deliveries processed at the same time.
    pub concurrency_limit: u32,
    /// Deliveries buffered locally ahead of processing.
    pub prefetch_count: u32,
    pub retry: RetryPolicy,
    /// `None` disables the circuit breaker.
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Per-delivery timeout around each consumer attempt. `None` disables it.
    pub message_timeout_ms: Option<u64>,
    /// How long `stop()` waits for in-flight deliveries before cancelling them.
    pub stop_grace_period_ms: u64,
    pub deserialization_failure: DeserializationFailurePolicy,
    /// Pause before an undecodable delivery is returned to the queue under
    /// [`DeserializationFailurePolicy::Requeue`].
    pub requeue_delay_ms: u64,
}

impl EndpointConfig {
    #[must_use]
    pub fn message_timeout(&self) -> Option<Duration> {
        self.message_timeout_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }

    #[must_use]
    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 16,
            prefetch_count: 32,
            retry: RetryPolicy::None,
            circuit_breaker: None,
            message_timeout_ms: Some(30_000),
            stop_grace_period_ms: 5_000,
            deserialization_failure: DeserializationFailurePolicy::DeadLetter,
            requeue_delay_ms: 1_000,
        }
    }
}
