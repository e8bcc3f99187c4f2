//! Consumers and the context they receive.
//!
//! A consumer handles one message type. It is registered on a receive
//! endpoint through a [`ConsumerRegistration`], which erases the message
//! type so one endpoint can host consumers of many types.

pub mod delivery;
pub mod registration;

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use courier_core::{
    BusResult, CorrelationId, EndpointAddress, Error, Message, MessageEnvelope, MessageId,
    MessageTypeName,
};
use tokio_util::sync::CancellationToken;

use crate::publish::{Publisher, SendOptions};

pub use delivery::{DeliveryContext, Fields};
pub use registration::{ConsumerFilter, ConsumerRegistration};

/// Handles messages of type `T`.
#[async_trait]
pub trait Consumer<T: Message>: Send + Sync + 'static {
    /// # Errors
    ///
    /// Any error fails this attempt; the endpoint's retry policy decides
    /// whether it is retried.
    async fn consume(&self, ctx: ConsumeContext<T>) -> BusResult<()>;
}

// ---------------------------------------------------------------------------
// ConsumeContext
// ---------------------------------------------------------------------------

/// What a consumer sees of one delivery attempt.
///
/// Cheap to clone. Fields added through [`ConsumeContext::add_field`] are
/// shared with the delivery and reported with its outcome.
pub struct ConsumeContext<T> {
    message: Arc<T>,
    envelope: Arc<MessageEnvelope>,
    endpoint: EndpointAddress,
    attempt: u32,
    cancel: CancellationToken,
    fields: Fields,
    publisher: Option<Weak<dyn Publisher>>,
}

impl<T> Clone for ConsumeContext<T> {
    fn clone(&self) -> Self {
        Self {
            message: Arc::clone(&self.message),
            envelope: Arc::clone(&self.envelope),
            endpoint: self.endpoint.clone(),
            attempt: self.attempt,
            cancel: self.cancel.clone(),
            fields: Arc::clone(&self.fields),
            publisher: self.publisher.clone(),
        }
    }
}

impl<T: Message> ConsumeContext<T> {
    pub(crate) fn from_delivery(message: Arc<T>, delivery: &DeliveryContext) -> Self {
        Self {
            message,
            envelope: Arc::clone(&delivery.envelope),
            endpoint: delivery.endpoint.clone(),
            attempt: delivery.attempt(),
            cancel: delivery.cancel.clone(),
            fields: Arc::clone(&delivery.fields),
            publisher: delivery.publisher.clone(),
        }
    }

    /// Standalone context, for driving consumers directly.
    #[must_use]
    pub fn detached(message: T, envelope: MessageEnvelope, endpoint: EndpointAddress) -> Self {
        Self {
            message: Arc::new(message),
            envelope: Arc::new(envelope),
            endpoint,
            attempt: 0,
            cancel: CancellationToken::new(),
            fields: Fields::default(),
            publisher: None,
        }
    }

    #[must_use]
    pub fn message(&self) -> &T {
        &self.message
    }

    #[must_use]
    pub fn envelope(&self) -> &MessageEnvelope {
        &self.envelope
    }

    #[must_use]
    pub fn message_id(&self) -> MessageId {
        self.envelope.message_id()
    }

    #[must_use]
    pub fn correlation_id(&self) -> CorrelationId {
        self.envelope.correlation_id()
    }

    /// Address of the endpoint this delivery arrived on.
    #[must_use]
    pub fn endpoint(&self) -> &EndpointAddress {
        &self.endpoint
    }

    /// Zero-based attempt index.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Fires when the endpoint is stopping.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Attaches a structured field to the delivery's outcome.
    pub fn add_field(&self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.lock().insert(key.into(), value.into());
    }

    // -- follow-ups --

    fn publisher(&self) -> BusResult<Arc<dyn Publisher>> {
        self.publisher
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::transport("no bus attached to this delivery").into())
    }

    fn follow_up<M: Message>(
        &self,
        publisher: &dyn Publisher,
        message: &M,
        options: SendOptions,
    ) -> BusResult<MessageEnvelope> {
        let serializer = publisher.serializer();
        let body = serializer.serialize(message)?;
        let types = M::message_types().iter().map(MessageTypeName::urn).collect();
        let mut builder = self
            .envelope
            .follow_up(types, body)
            .content_type(serializer.content_type())
            .source_address(self.endpoint.clone());
        if let Some(host) = publisher.host() {
            builder = builder.host(host);
        }
        Ok(options.apply(builder).build()?)
    }

    /// Publishes a message caused by this one, keeping correlation,
    /// conversation and initiator linkage.
    ///
    /// # Errors
    ///
    /// Fails when the message cannot be serialized or the bus is gone.
    pub async fn publish<M: Message>(&self, message: &M) -> BusResult<()> {
        self.publish_with(message, SendOptions::default()).await
    }

    /// [`ConsumeContext::publish`] with per-call overrides.
    ///
    /// # Errors
    ///
    /// Fails when the message cannot be serialized or the bus is gone.
    pub async fn publish_with<M: Message>(&self, message: &M, options: SendOptions) -> BusResult<()> {
        let publisher = self.publisher()?;
        let envelope = self.follow_up(publisher.as_ref(), message, options)?;
        publisher.publish_envelope(envelope).await.map(|_| ())
    }

    /// Sends a command to the address mapped for its type.
    ///
    /// # Errors
    ///
    /// Returns `InvalidEndpointAddress` when the type has no mapped address.
    pub async fn send<M: Message>(&self, message: &M) -> BusResult<()> {
        let publisher = self.publisher()?;
        let address = publisher.mapped_address(&M::message_type().urn())?;
        let envelope = self.follow_up(publisher.as_ref(), message, SendOptions::default())?;
        publisher.send_envelope(&address, envelope).await
    }

    /// Sends a command to `address`.
    ///
    /// # Errors
    ///
    /// Fails when the message cannot be serialized or the address cannot be
    /// resolved.
    pub async fn send_to<M: Message>(&self, address: &EndpointAddress, message: &M) -> BusResult<()> {
        let publisher = self.publisher()?;
        let envelope = self.follow_up(publisher.as_ref(), message, SendOptions::default())?;
        publisher.send_envelope(address, envelope).await
    }

    /// Sends `message` to the response address of the inbound envelope.
    ///
    /// # Errors
    ///
    /// Returns `InvalidEndpointAddress` when the inbound envelope carries no
    /// response address.
    pub async fn respond<M: Message>(&self, message: &M) -> BusResult<()> {
        let address = self.envelope.response_address().cloned().ok_or_else(|| {
            Error::invalid_address("", "inbound message has no response address")
        })?;
        self.send_to(&address, message).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use courier_core::{ErrorKind, MessageSerializer};
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl Message for Ping {
        fn message_type() -> MessageTypeName {
            MessageTypeName::new("Tests", "Ping")
        }
    }

    fn detached(envelope: MessageEnvelope) -> ConsumeContext<Ping> {
        ConsumeContext::detached(
            Ping { n: 1 },
            envelope,
            EndpointAddress::in_memory("pings").unwrap(),
        )
    }

    #[tokio::test]
    async fn follow_ups_without_a_bus_fail() {
        let envelope = MessageEnvelope::for_message(&Ping { n: 1 }, MessageSerializer::Json)
            .unwrap()
            .build()
            .unwrap();
        let ctx = detached(envelope);

        let errors = ctx.publish(&Ping { n: 2 }).await.unwrap_err();
        assert_eq!(errors.first().kind(), ErrorKind::TransportError);
    }

    #[tokio::test]
    async fn respond_requires_response_address() {
        let envelope = MessageEnvelope::for_message(&Ping { n: 1 }, MessageSerializer::Json)
            .unwrap()
            .build()
            .unwrap();
        let errors = detached(envelope).respond(&Ping { n: 2 }).await.unwrap_err();
        assert_eq!(errors.first().kind(), ErrorKind::InvalidEndpointAddress);
    }

    #[test]
    fn clones_share_fields() {
        let envelope = MessageEnvelope::for_message(&Ping { n: 1 }, MessageSerializer::Json)
            .unwrap()
            .build()
            .unwrap();
        let ctx = detached(envelope);
        let clone = ctx.clone();
        clone.add_field("order", "42");
        assert_eq!(ctx.fields.lock().get("order").map(String::as_str), Some("42"));
        assert_eq!(ctx.message(), &Ping { n: 1 });
        assert_eq!(ctx.attempt(), 0);
    }
}
