//! Delivery outcomes and the sinks that observe them.
//!
//! Every delivery an endpoint takes from its queue ends in exactly one
//! [`DeliveryOutcome`], reported to the endpoint's [`ObservabilitySink`].
//! Sink failures are logged and never affect message processing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use courier_core::{EndpointAddress, Errors, MessageId};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

/// How a delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OutcomeKind {
    Success,
    /// The retry policy gave up.
    RetryExhausted,
    /// The pipe failed without retry.
    Faulted,
    /// A consumer or filter panicked.
    Exception,
    DeserializationFailed,
    /// Expired, or no consumer accepts the message type.
    Skipped,
    /// The endpoint stopped while the delivery was in flight.
    Cancelled,
}

impl OutcomeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RetryExhausted => "retry_exhausted",
            Self::Faulted => "faulted",
            Self::Exception => "exception",
            Self::DeserializationFailed => "deserialization_failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Report of one delivery, per consumer registration.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub kind: OutcomeKind,
    pub endpoint: EndpointAddress,
    pub message_id: MessageId,
    pub message_type: String,
    /// `None` when no consumer was involved (skips, decode failures before
    /// a consumer was selected).
    pub consumer: Option<String>,
    /// Number of times the consumer was invoked.
    pub attempts: u32,
    pub duration: Duration,
    pub errors: Option<Errors>,
    /// Fields added by filters and consumers.
    pub fields: BTreeMap<String, String>,
    /// Timed stages recorded by filters.
    pub stages: Vec<(&'static str, Duration)>,
}

/// Receives every [`DeliveryOutcome`].
pub trait ObservabilitySink: Send + Sync {
    /// # Errors
    ///
    /// Any error is logged by the endpoint and otherwise ignored.
    fn record(&self, outcome: &DeliveryOutcome) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// TracingSink
// ---------------------------------------------------------------------------

/// Logs each outcome as a structured `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ObservabilitySink for TracingSink {
    fn record(&self, outcome: &DeliveryOutcome) -> anyhow::Result<()> {
        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = outcome.duration.as_millis() as u64;
        let consumer = outcome.consumer.as_deref().unwrap_or("-");
        match &outcome.errors {
            None => tracing::info!(
                endpoint = %outcome.endpoint,
                message_id = %outcome.message_id,
                message_type = %outcome.message_type,
                consumer,
                attempts = outcome.attempts,
                duration_ms,
                outcome = outcome.kind.as_str(),
                "delivery outcome"
            ),
            Some(errors) => tracing::warn!(
                endpoint = %outcome.endpoint,
                message_id = %outcome.message_id,
                message_type = %outcome.message_type,
                consumer,
                attempts = outcome.attempts,
                duration_ms,
                outcome = outcome.kind.as_str(),
                error = %errors,
                "delivery outcome"
            ),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MetricsSink
// ---------------------------------------------------------------------------

/// Records counters and duration histograms through the `metrics` facade.
///
/// Metric names:
/// - `<prefix>_deliveries_total{endpoint, message_type, outcome}`
/// - `<prefix>_delivery_duration_seconds{endpoint, outcome}`
/// - `<prefix>_delivery_attempts{endpoint}`
/// - `<prefix>_delivery_stage_seconds{endpoint, stage}`
#[derive(Debug, Clone)]
pub struct MetricsSink {
    deliveries: String,
    duration: String,
    attempts: String,
    stage: String,
}

impl MetricsSink {
    #[must_use]
    pub fn new(prefix: &str) -> Self {
        Self {
            deliveries: format!("{prefix}_deliveries_total"),
            duration: format!("{prefix}_delivery_duration_seconds"),
            attempts: format!("{prefix}_delivery_attempts"),
            stage: format!("{prefix}_delivery_stage_seconds"),
        }
    }
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self::new("courier")
    }
}

impl ObservabilitySink for MetricsSink {
    fn record(&self, outcome: &DeliveryOutcome) -> anyhow::Result<()> {
        let endpoint = outcome.endpoint.to_string();
        let kind = outcome.kind.as_str();

        metrics::counter!(
            self.deliveries.clone(),
            "endpoint" => endpoint.clone(),
            "message_type" => outcome.message_type.clone(),
            "outcome" => kind,
        )
        .increment(1);
        metrics::histogram!(
            self.duration.clone(),
            "endpoint" => endpoint.clone(),
            "outcome" => kind,
        )
        .record(outcome.duration.as_secs_f64());
        metrics::histogram!(self.attempts.clone(), "endpoint" => endpoint.clone())
            .record(f64::from(outcome.attempts));
        for (stage, elapsed) in &outcome.stages {
            metrics::histogram!(
                self.stage.clone(),
                "endpoint" => endpoint.clone(),
                "stage" => *stage,
            )
            .record(elapsed.as_secs_f64());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CompositeSink
// ---------------------------------------------------------------------------

/// Fans out to several sinks. Every sink is called even if an earlier one
/// fails; the failures are combined into one error.
#[derive(Clone, Default)]
pub struct CompositeSink {
    sinks: Vec<Arc<dyn ObservabilitySink>>,
}

impl CompositeSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, sink: impl ObservabilitySink + 'static) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    #[must_use]
    pub fn with_shared(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ObservabilitySink for CompositeSink {
    fn record(&self, outcome: &DeliveryOutcome) -> anyhow::Result<()> {
        let failures: Vec<String> = self
            .sinks
            .iter()
            .filter_map(|sink| sink.record(outcome).err())
            .map(|err| format!("{err:#}"))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("{} sink(s) failed: {}", failures.len(), failures.join("; ")))
        }
    }
}

// ---------------------------------------------------------------------------
// MemorySink
// ---------------------------------------------------------------------------

/// Keeps every outcome in memory. Useful for tests and diagnostics.
#[derive(Debug, Default)]
pub struct MemorySink {
    outcomes: Mutex<Vec<DeliveryOutcome>>,
    notify: Notify,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn outcomes(&self) -> Vec<DeliveryOutcome> {
        self.outcomes.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until at least `count` outcomes were recorded or `timeout`
    /// elapses. Returns whether the count was reached.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.len() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.len() >= count;
            }
        }
    }
}

impl ObservabilitySink for MemorySink {
    fn record(&self, outcome: &DeliveryOutcome) -> anyhow::Result<()> {
        self.outcomes.lock().push(outcome.clone());
        self.notify.notify_waiters();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
