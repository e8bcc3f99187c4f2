//! Per-delivery state threaded through an endpoint's pipe.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use courier_core::{EndpointAddress, MessageEnvelope};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::pipe::filters::Traceable;
use crate::pipe::{PipeContext, RetryableContext};
use crate::publish::Publisher;
use crate::retry::RetryContext;

/// Decoded message shared between attempts.
pub type SharedMessage = Arc<dyn Any + Send + Sync>;

/// Structured fields attached by filters and consumers, reported with the
/// delivery outcome.
pub type Fields = Arc<Mutex<BTreeMap<String, String>>>;

/// Context of one delivery to one consumer registration.
pub struct DeliveryContext {
    pub(crate) envelope: Arc<MessageEnvelope>,
    pub(crate) message: SharedMessage,
    pub(crate) endpoint: EndpointAddress,
    pub(crate) consumer: Arc<str>,
    pub(crate) cancel: CancellationToken,
    pub(crate) retry: RetryContext,
    pub(crate) fields: Fields,
    pub(crate) stages: Vec<(&'static str, Duration)>,
    pub(crate) publisher: Option<Weak<dyn Publisher>>,
}

impl DeliveryContext {
    #[must_use]
    pub fn new(
        envelope: Arc<MessageEnvelope>,
        message: SharedMessage,
        endpoint: EndpointAddress,
        consumer: Arc<str>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            envelope,
            message,
            endpoint,
            consumer,
            cancel,
            retry: RetryContext::new(),
            fields: Arc::new(Mutex::new(BTreeMap::new())),
            stages: Vec::new(),
            publisher: None,
        }
    }

    #[must_use]
    pub fn with_publisher(mut self, publisher: Weak<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    #[must_use]
    pub fn envelope(&self) -> &Arc<MessageEnvelope> {
        &self.envelope
    }

    #[must_use]
    pub fn message(&self) -> &SharedMessage {
        &self.message
    }

    #[must_use]
    pub fn endpoint(&self) -> &EndpointAddress {
        &self.endpoint
    }

    #[must_use]
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Zero-based attempt index.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.retry.attempt()
    }

    pub fn add_field(&self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.lock().insert(key.into(), value.into());
    }

    #[must_use]
    pub fn fields(&self) -> BTreeMap<String, String> {
        self.fields.lock().clone()
    }

    #[must_use]
    pub fn stages(&self) -> &[(&'static str, Duration)] {
        &self.stages
    }
}

impl PipeContext for DeliveryContext {
    fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn record_stage(&mut self, stage: &'static str, elapsed: Duration) {
        self.stages.push((stage, elapsed));
    }
}

impl RetryableContext for DeliveryContext {
    fn retry_context(&self) -> &RetryContext {
        &self.retry
    }

    fn retry_context_mut(&mut self) -> &mut RetryContext {
        &mut self.retry
    }
}

impl Traceable for DeliveryContext {
    fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "delivery",
            endpoint = %self.endpoint,
            message_id = %self.envelope.message_id(),
            message_type = self.envelope.primary_message_type(),
            consumer = &*self.consumer,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        )
    }
}
