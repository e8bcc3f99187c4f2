//! Transport contract.
//!
//! A [`Transport`] owns the queues behind one address scheme. The bus asks
//! it for [`SendTransport`]s to enqueue envelopes and for
//! [`ReceiveTransport`]s that receive endpoints consume from.

pub mod in_memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{BusResult, EndpointAddress, MessageEnvelope};
use tokio_util::sync::CancellationToken;

pub use in_memory::InMemoryTransport;

/// A message taken from a queue, pending settlement.
#[derive(Debug, Clone)]
pub struct InboundDelivery {
    pub envelope: MessageEnvelope,
    /// Transport-assigned tag, unique per queue.
    pub delivery_tag: u64,
    /// Whether this delivery was requeued at least once before.
    pub redelivered: bool,
}

/// How a delivery leaves its queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Processed; remove it.
    Ack,
    /// Put it back for another delivery.
    Requeue,
    /// Move it to the endpoint's `_error` queue, adding `headers`.
    DeadLetter { headers: BTreeMap<String, String> },
    /// Move it to the endpoint's `_skipped` queue.
    Skip { reason: String },
}

impl Settlement {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Requeue => "requeue",
            Self::DeadLetter { .. } => "deadLetter",
            Self::Skip { .. } => "skip",
        }
    }
}

/// Owns the queues of one address scheme.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Address scheme handled, e.g. `inmemory`.
    fn scheme(&self) -> &str;

    /// # Errors
    ///
    /// Returns `TransportError` if the transport cannot start.
    async fn start(&self) -> BusResult<()>;

    /// # Errors
    ///
    /// Returns `TransportError` if the transport cannot stop cleanly.
    async fn stop(&self) -> BusResult<()>;

    /// # Errors
    ///
    /// Returns `InvalidEndpointAddress` for addresses this transport does not
    /// serve.
    fn get_send_endpoint(&self, address: &EndpointAddress) -> BusResult<Arc<dyn SendTransport>>;

    /// # Errors
    ///
    /// Returns `InvalidEndpointAddress` for addresses this transport does not
    /// serve.
    fn create_receive_endpoint(&self, address: &EndpointAddress) -> BusResult<Arc<dyn ReceiveTransport>>;
}

/// Enqueues envelopes on one queue.
#[async_trait]
pub trait SendTransport: Send + Sync {
    fn address(&self) -> &EndpointAddress;

    /// # Errors
    ///
    /// Returns `TransportError` when the envelope cannot be enqueued.
    async fn send(&self, envelope: MessageEnvelope) -> BusResult<()>;
}

/// Consumes one queue.
#[async_trait]
pub trait ReceiveTransport: Send + Sync {
    fn address(&self) -> &EndpointAddress;

    /// Starts the subscription with the given local buffer size.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` when the subscription cannot be opened.
    async fn open(&self, prefetch: u32) -> BusResult<()>;

    /// Next delivery, or `None` once `cancel` fires or the subscription is
    /// closed.
    async fn receive(&self, cancel: &CancellationToken) -> Option<InboundDelivery>;

    /// # Errors
    ///
    /// Returns `TransportError` when the settlement cannot be applied.
    async fn settle(&self, delivery: InboundDelivery, settlement: Settlement) -> BusResult<()>;

    /// # Errors
    ///
    /// Returns `TransportError` when the subscription cannot be closed.
    async fn close(&self) -> BusResult<()>;
}
