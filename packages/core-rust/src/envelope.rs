//! Message envelope: the unit of delivery.
//!
//! An envelope wraps an opaque body with identity, routing, and propagation
//! metadata. It is created once at publish/send time and never mutated;
//! helpers such as [`MessageEnvelope::with_destination`] return new values.
//!
//! Fields serialize in `camelCase` so envelopes can cross process boundaries
//! through any serde format.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::address::EndpointAddress;
use crate::error::Error;
use crate::ids::{ConversationId, CorrelationId, MessageId};
use crate::message_type::{Message, MessageTypeName};
use crate::serializer::MessageSerializer;

/// Well-known header names.
pub mod headers {
    /// W3C trace context, propagated to follow-up messages.
    pub const TRACE_PARENT: &str = "traceparent";
    pub const TRACE_STATE: &str = "tracestate";
    /// Tenant scope, propagated to follow-up messages.
    pub const TENANT_ID: &str = "x-tenant-id";

    pub const FAULT_MESSAGE: &str = "courier-fault-message";
    pub const FAULT_KIND: &str = "courier-fault-kind";
    pub const FAULT_TIMESTAMP: &str = "courier-fault-timestamp";
    pub const FAULT_ENDPOINT: &str = "courier-fault-endpoint";
    pub const FAULT_CONSUMER: &str = "courier-fault-consumer";
    pub const FAULT_RETRY_COUNT: &str = "courier-fault-retry-count";
    /// Why a delivery was skipped or dead-lettered.
    pub const REASON: &str = "courier-reason";

    /// Headers copied from a parent envelope into its follow-ups.
    pub const PROPAGATED: [&str; 3] = [TRACE_PARENT, TRACE_STATE, TENANT_ID];
}

// ---------------------------------------------------------------------------
// HostInfo
// ---------------------------------------------------------------------------

/// Provenance of the process that produced an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    pub machine_name: Option<String>,
    pub process_id: u32,
    pub process_name: Option<String>,
    pub courier_version: String,
}

impl HostInfo {
    /// Describes the current process.
    #[must_use]
    pub fn current() -> Self {
        let process_name = std::env::current_exe()
            .ok()
            .and_then(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()));
        Self {
            machine_name: hostname::get().ok().and_then(|h| h.into_string().ok()),
            process_id: std::process::id(),
            process_name,
            courier_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// MessageEnvelope
// ---------------------------------------------------------------------------

/// Immutable, wire-level unit of delivery.
///
/// Invariant: `message_types` is never empty, including after
/// deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "EnvelopeRecord")]
pub struct MessageEnvelope {
    message_id: MessageId,
    correlation_id: CorrelationId,
    conversation_id: Option<ConversationId>,
    initiator_id: Option<MessageId>,
    source_address: Option<EndpointAddress>,
    destination_address: Option<EndpointAddress>,
    response_address: Option<EndpointAddress>,
    fault_address: Option<EndpointAddress>,
    message_types: Vec<String>,
    body: Bytes,
    headers: BTreeMap<String, String>,
    sent_time: DateTime<Utc>,
    expiration_time: Option<DateTime<Utc>>,
    content_type: String,
    host: Option<HostInfo>,
}

/// Unchecked wire form of [`MessageEnvelope`].
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeRecord {
    message_id: MessageId,
    correlation_id: CorrelationId,
    conversation_id: Option<ConversationId>,
    initiator_id: Option<MessageId>,
    source_address: Option<EndpointAddress>,
    destination_address: Option<EndpointAddress>,
    response_address: Option<EndpointAddress>,
    fault_address: Option<EndpointAddress>,
    message_types: Vec<String>,
    body: Bytes,
    headers: BTreeMap<String, String>,
    sent_time: DateTime<Utc>,
    expiration_time: Option<DateTime<Utc>>,
    content_type: String,
    host: Option<HostInfo>,
}

impl TryFrom<EnvelopeRecord> for MessageEnvelope {
    type Error = Error;

    fn try_from(record: EnvelopeRecord) -> Result<Self, Error> {
        if record.message_types.is_empty() {
            return Err(Error::UnknownMessageType(
                "envelope requires at least one message type".to_string(),
            ));
        }
        Ok(Self {
            message_id: record.message_id,
            correlation_id: record.correlation_id,
            conversation_id: record.conversation_id,
            initiator_id: record.initiator_id,
            source_address: record.source_address,
            destination_address: record.destination_address,
            response_address: record.response_address,
            fault_address: record.fault_address,
            message_types: record.message_types,
            body: record.body,
            headers: record.headers,
            sent_time: record.sent_time,
            expiration_time: record.expiration_time,
            content_type: record.content_type,
            host: record.host,
        })
    }
}

impl MessageEnvelope {
    /// Starts an envelope around an already-encoded body.
    pub fn builder(message_types: Vec<String>, body: impl Into<Bytes>) -> EnvelopeBuilder {
        EnvelopeBuilder::new(message_types, body.into())
    }

    /// Serializes `message` and starts an envelope carrying its type identifiers.
    ///
    /// # Errors
    ///
    /// Returns `Error::SerializationFailed` if the body cannot be encoded.
    pub fn for_message<T: Message>(
        message: &T,
        serializer: MessageSerializer,
    ) -> Result<EnvelopeBuilder, Error> {
        let body = serializer.serialize(message)?;
        let types = T::message_types().iter().map(MessageTypeName::urn).collect();
        Ok(EnvelopeBuilder::new(types, body).content_type(serializer.content_type()))
    }

    /// Starts a follow-up envelope caused by this one.
    ///
    /// The new envelope shares this envelope's correlation and conversation,
    /// names this message as its initiator, and carries the propagated
    /// trace/tenant headers.
    pub fn follow_up(&self, message_types: Vec<String>, body: impl Into<Bytes>) -> EnvelopeBuilder {
        let conversation = self
            .conversation_id
            .unwrap_or_else(|| self.message_id.as_conversation());
        let mut builder = EnvelopeBuilder::new(message_types, body.into())
            .correlation_id(self.correlation_id)
            .conversation_id(conversation)
            .initiator_id(self.message_id);
        for name in headers::PROPAGATED {
            if let Some(value) = self.headers.get(name) {
                builder = builder.header(name, value.clone());
            }
        }
        builder
    }

    /// Copy of this envelope addressed to `destination`.
    #[must_use]
    pub fn with_destination(&self, destination: EndpointAddress) -> Self {
        Self {
            destination_address: Some(destination),
            ..self.clone()
        }
    }

    /// Copy of this envelope with additional (or replaced) headers.
    #[must_use]
    pub fn with_headers<I, K, V>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut copy = self.clone();
        copy.headers
            .extend(extra.into_iter().map(|(k, v)| (k.into(), v.into())));
        copy
    }

    /// Whether the envelope's time-to-live has elapsed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time.is_some_and(|exp| exp <= now)
    }

    #[must_use]
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    #[must_use]
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    #[must_use]
    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.conversation_id
    }

    #[must_use]
    pub fn initiator_id(&self) -> Option<MessageId> {
        self.initiator_id
    }

    #[must_use]
    pub fn source_address(&self) -> Option<&EndpointAddress> {
        self.source_address.as_ref()
    }

    #[must_use]
    pub fn destination_address(&self) -> Option<&EndpointAddress> {
        self.destination_address.as_ref()
    }

    #[must_use]
    pub fn response_address(&self) -> Option<&EndpointAddress> {
        self.response_address.as_ref()
    }

    #[must_use]
    pub fn fault_address(&self) -> Option<&EndpointAddress> {
        self.fault_address.as_ref()
    }

    /// Type identifiers, most-derived first. Never empty.
    #[must_use]
    pub fn message_types(&self) -> &[String] {
        &self.message_types
    }

    /// The most-derived type identifier.
    #[must_use]
    pub fn primary_message_type(&self) -> &str {
        self.message_types.first().map_or("", String::as_str)
    }

    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    #[must_use]
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn sent_time(&self) -> DateTime<Utc> {
        self.sent_time
    }

    #[must_use]
    pub fn expiration_time(&self) -> Option<DateTime<Utc>> {
        self.expiration_time
    }

    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    #[must_use]
    pub fn host(&self) -> Option<&HostInfo> {
        self.host.as_ref()
    }
}

// ---------------------------------------------------------------------------
// EnvelopeBuilder
// ---------------------------------------------------------------------------

/// Builder for [`MessageEnvelope`]; the only way to create one.
#[derive(Debug, Clone)]
#[must_use]
pub struct EnvelopeBuilder {
    message_id: MessageId,
    correlation_id: Option<CorrelationId>,
    conversation_id: Option<ConversationId>,
    initiator_id: Option<MessageId>,
    source_address: Option<EndpointAddress>,
    destination_address: Option<EndpointAddress>,
    response_address: Option<EndpointAddress>,
    fault_address: Option<EndpointAddress>,
    message_types: Vec<String>,
    body: Bytes,
    headers: BTreeMap<String, String>,
    sent_time: Option<DateTime<Utc>>,
    time_to_live: Option<Duration>,
    content_type: String,
    host: Option<HostInfo>,
}

impl EnvelopeBuilder {
    fn new(message_types: Vec<String>, body: Bytes) -> Self {
        Self {
            message_id: MessageId::new(),
            correlation_id: None,
            conversation_id: None,
            initiator_id: None,
            source_address: None,
            destination_address: None,
            response_address: None,
            fault_address: None,
            message_types,
            body,
            headers: BTreeMap::new(),
            sent_time: None,
            time_to_live: None,
            content_type: MessageSerializer::default().content_type().to_string(),
            host: None,
        }
    }

    pub fn message_id(mut self, id: MessageId) -> Self {
        self.message_id = id;
        self
    }

    pub fn correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn conversation_id(mut self, id: ConversationId) -> Self {
        self.conversation_id = Some(id);
        self
    }

    pub fn initiator_id(mut self, id: MessageId) -> Self {
        self.initiator_id = Some(id);
        self
    }

    pub fn source_address(mut self, address: EndpointAddress) -> Self {
        self.source_address = Some(address);
        self
    }

    pub fn destination_address(mut self, address: EndpointAddress) -> Self {
        self.destination_address = Some(address);
        self
    }

    pub fn response_address(mut self, address: EndpointAddress) -> Self {
        self.response_address = Some(address);
        self
    }

    pub fn fault_address(mut self, address: EndpointAddress) -> Self {
        self.fault_address = Some(address);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn sent_time(mut self, at: DateTime<Utc>) -> Self {
        self.sent_time = Some(at);
        self
    }

    /// Expiration relative to the sent time.
    pub fn time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn host(mut self, host: HostInfo) -> Self {
        self.host = Some(host);
        self
    }

    /// Finishes the envelope.
    ///
    /// When no correlation id was given the message correlates on itself.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownMessageType` when no message type was supplied.
    pub fn build(self) -> Result<MessageEnvelope, Error> {
        if self.message_types.is_empty() {
            return Err(Error::UnknownMessageType(
                "envelope requires at least one message type".to_string(),
            ));
        }
        let sent_time = self.sent_time.unwrap_or_else(Utc::now);
        // A TTL past the last representable instant never expires.
        let expiration_time = self
            .time_to_live
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| sent_time.checked_add_signed(ttl));

        Ok(MessageEnvelope {
            message_id: self.message_id,
            correlation_id: self
                .correlation_id
                .unwrap_or_else(|| self.message_id.as_correlation()),
            conversation_id: self.conversation_id,
            initiator_id: self.initiator_id,
            source_address: self.source_address,
            destination_address: self.destination_address,
            response_address: self.response_address,
            fault_address: self.fault_address,
            message_types: self.message_types,
            body: self.body,
            headers: self.headers,
            sent_time,
            expiration_time,
            content_type: self.content_type,
            host: self.host,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct SubmitOrder {
        sku: String,
    }

    impl Message for SubmitOrder {
        fn message_type() -> MessageTypeName {
            MessageTypeName::new("Shop", "SubmitOrder")
        }
    }

    fn envelope() -> MessageEnvelope {
        MessageEnvelope::for_message(&SubmitOrder { sku: "A-1".into() }, MessageSerializer::Json)
            .unwrap()
            .header(headers::TENANT_ID, "acme")
            .header("x-custom", "local")
            .build()
            .unwrap()
    }

    #[test]
    fn builder_requires_a_message_type() {
        let err = MessageEnvelope::builder(Vec::new(), Bytes::new())
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownMessageType);
    }

    #[test]
    fn empty_body_is_allowed() {
        let env = MessageEnvelope::builder(vec!["urn:message:Shop:Ping".into()], Bytes::new())
            .build()
            .unwrap();
        assert!(env.body().is_empty());
        assert_eq!(env.primary_message_type(), "urn:message:Shop:Ping");
    }

    #[test]
    fn for_message_sets_types_body_and_self_correlation() {
        let env = envelope();
        assert_eq!(env.message_types(), ["urn:message:Shop:SubmitOrder"]);
        assert_eq!(env.content_type(), "application/json");
        assert_eq!(env.correlation_id(), env.message_id().as_correlation());
        let decoded: SubmitOrder = MessageSerializer::Json.deserialize(env.body()).unwrap();
        assert_eq!(decoded.sku, "A-1");
    }

    #[test]
    fn follow_up_copies_linkage_and_propagated_headers() {
        let parent = envelope();
        let child = parent
            .follow_up(vec!["urn:message:Shop:OrderAccepted".into()], Bytes::from_static(b"{}"))
            .build()
            .unwrap();

        assert_ne!(child.message_id(), parent.message_id());
        assert_eq!(child.correlation_id(), parent.correlation_id());
        assert_eq!(child.initiator_id(), Some(parent.message_id()));
        assert_eq!(
            child.conversation_id(),
            Some(parent.message_id().as_conversation())
        );
        assert_eq!(child.header(headers::TENANT_ID), Some("acme"));
        assert_eq!(child.header("x-custom"), None);
    }

    #[test]
    fn copies_leave_the_original_untouched() {
        let env = envelope();
        let dest = EndpointAddress::in_memory("orders").unwrap();
        let routed = env
            .with_destination(dest.clone())
            .with_headers([(headers::REASON, "test")]);

        assert_eq!(env.destination_address(), None);
        assert_eq!(env.header(headers::REASON), None);
        assert_eq!(routed.destination_address(), Some(&dest));
        assert_eq!(routed.header(headers::REASON), Some("test"));
        assert_eq!(routed.message_id(), env.message_id());
    }

    #[test]
    fn time_to_live_sets_expiration() {
        let sent = Utc::now();
        let env = MessageEnvelope::builder(vec!["urn:message:Shop:Ping".into()], Bytes::new())
            .sent_time(sent)
            .time_to_live(Duration::from_secs(10))
            .build()
            .unwrap();
        assert!(!env.is_expired(sent));
        assert!(env.is_expired(sent + chrono::Duration::seconds(10)));
    }

    #[test]
    fn unrepresentable_time_to_live_never_expires() {
        let sent = Utc::now();
        let env = MessageEnvelope::builder(vec!["urn:message:Shop:Ping".into()], Bytes::new())
            .sent_time(sent)
            .time_to_live(Duration::from_secs(10_000_000_000_000))
            .build()
            .unwrap();
        assert_eq!(env.expiration_time(), None);
        assert!(!env.is_expired(sent + chrono::Duration::days(365)));
    }

    #[test]
    fn deserializing_without_message_types_fails() {
        let mut value = serde_json::to_value(envelope()).unwrap();
        value["messageTypes"] = serde_json::json!([]);
        let err = serde_json::from_value::<MessageEnvelope>(value).unwrap_err();
        assert!(err.to_string().contains("at least one message type"));
    }

    #[test]
    fn envelope_survives_msgpack() {
        let env = envelope().with_destination(EndpointAddress::in_memory("q").unwrap());
        let bytes = rmp_serde::to_vec_named(&env).unwrap();
        let back: MessageEnvelope = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, env);
    }
}
