//! Outbound side shared by the bus and by consumers sending follow-ups.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{
    BusResult, ConversationId, CorrelationId, EndpointAddress, EnvelopeBuilder, HostInfo,
    MessageEnvelope, MessageSerializer,
};

/// Dispatches finished envelopes.
///
/// Implemented by the bus; receive endpoints hold a weak reference so
/// consumers can publish and send without owning the bus.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Serializer for outgoing bodies.
    fn serializer(&self) -> MessageSerializer;

    /// Provenance stamped on outgoing envelopes, if enabled.
    fn host(&self) -> Option<HostInfo>;

    /// Address mapped for a message type identifier.
    ///
    /// # Errors
    ///
    /// Returns `InvalidEndpointAddress` when no address is mapped.
    fn mapped_address(&self, message_type: &str) -> BusResult<EndpointAddress>;

    /// Delivers `envelope` to every endpoint subscribed to one of its
    /// message types. Returns how many endpoints received it.
    async fn publish_envelope(&self, envelope: MessageEnvelope) -> BusResult<usize>;

    /// Delivers `envelope` to `address`.
    async fn send_envelope(&self, address: &EndpointAddress, envelope: MessageEnvelope) -> BusResult<()>;
}

/// Per-call overrides applied to an outgoing envelope.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub correlation_id: Option<CorrelationId>,
    pub conversation_id: Option<ConversationId>,
    pub response_address: Option<EndpointAddress>,
    pub fault_address: Option<EndpointAddress>,
    pub headers: BTreeMap<String, String>,
    pub time_to_live: Option<Duration>,
}

impl SendOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    #[must_use]
    pub fn conversation_id(mut self, id: ConversationId) -> Self {
        self.conversation_id = Some(id);
        self
    }

    #[must_use]
    pub fn response_address(mut self, address: EndpointAddress) -> Self {
        self.response_address = Some(address);
        self
    }

    #[must_use]
    pub fn fault_address(mut self, address: EndpointAddress) -> Self {
        self.fault_address = Some(address);
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    /// Applies the overrides to `builder`.
    pub fn apply(self, mut builder: EnvelopeBuilder) -> EnvelopeBuilder {
        if let Some(id) = self.correlation_id {
            builder = builder.correlation_id(id);
        }
        if let Some(id) = self.conversation_id {
            builder = builder.conversation_id(id);
        }
        if let Some(address) = self.response_address {
            builder = builder.response_address(address);
        }
        if let Some(address) = self.fault_address {
            builder = builder.fault_address(address);
        }
        if let Some(ttl) = self.time_to_live {
            builder = builder.time_to_live(ttl);
        }
        builder.headers(self.headers)
    }
}
